//! One-shot wait/signal pair used for every blocking hand-off between the
//! protocol thread and the render thread.
//!
//! The [`Signal`] half can live on any thread. It is consumed by
//! [`Signal::signal`]; dropping it without signalling closes the latch so the
//! waiter never hangs on a half that no longer exists.

use std::sync::{Arc, Condvar, Mutex, PoisonError};

struct State<T> {
    value: Option<T>,
    done: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

impl<T> Shared<T> {
    fn finish(&self, value: Option<T>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.done {
            return;
        }
        state.value = value;
        state.done = true;
        self.cond.notify_all();
    }
}

/// Waiting half.
pub struct Wait<T> {
    shared: Arc<Shared<T>>,
}

/// Signalling half.
pub struct Signal<T> {
    shared: Option<Arc<Shared<T>>>,
}

/// Create a connected wait/signal pair.
pub fn latch<T>() -> (Wait<T>, Signal<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            value: None,
            done: false,
        }),
        cond: Condvar::new(),
    });
    (
        Wait {
            shared: shared.clone(),
        },
        Signal {
            shared: Some(shared),
        },
    )
}

impl<T> Wait<T> {
    /// Block until the signal half fires or is dropped.
    ///
    /// Returns `None` when the signal half was dropped without a value.
    /// There is no timeout: a consumer that never finishes blocks the caller
    /// forever.
    pub fn wait(self) -> Option<T> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !state.done {
            state = self
                .shared
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.value.take()
    }

    /// Non-blocking check.
    pub fn is_done(&self) -> bool {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .done
    }
}

impl<T> Signal<T> {
    /// Fire the latch with `value`, waking the waiter.
    pub fn signal(mut self, value: T) {
        if let Some(shared) = self.shared.take() {
            shared.finish(Some(value));
        }
    }
}

impl<T> Drop for Signal<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.finish(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_signal_delivers_value_across_threads() {
        let (wait, signal) = latch::<u32>();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signal.signal(7);
        });
        assert_eq!(wait.wait(), Some(7));
        t.join().unwrap();
    }

    #[test]
    fn test_dropped_signal_wakes_waiter() {
        let (wait, signal) = latch::<()>();
        let t = thread::spawn(move || drop(signal));
        assert_eq!(wait.wait(), None);
        t.join().unwrap();
    }

    #[test]
    fn test_is_done_tracks_signal() {
        let (wait, signal) = latch::<()>();
        assert!(!wait.is_done());
        signal.signal(());
        assert!(wait.is_done());
    }
}
