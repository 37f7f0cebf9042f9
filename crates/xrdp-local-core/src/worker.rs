//! Background thread that owns every call into the protocol module.
//!
//! The module is not re-entrant. It sits behind one mutex (the
//! communication lock) which this worker, frame acks and cursor updates all
//! take before entering it. The worker polls the transport, forwards queued
//! input and services a pending accelerated-buffer request, then sleeps for
//! the poll interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::ModuleError;
use crate::input::{InputEvent, InputEventQueue, ModuleMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Open,
    Closed,
}

/// Calls the worker makes into the protocol module.
pub trait ProtocolModule: Send {
    /// Service the module's wait objects once.
    fn check_transport(&mut self) -> TransportStatus;

    fn send_event(&mut self, message: &ModuleMessage) -> Result<(), ModuleError>;

    /// Ask the module to start offering accelerated buffers.
    fn request_accel(&mut self) -> Result<(), ModuleError>;
}

/// Lets the worker ask the application to shut down.
pub trait ExitHandle: Send + Sync {
    fn request_exit(&self);
}

#[derive(Debug, Default)]
struct Shared {
    queue: InputEventQueue,
    accel_requested: AtomicBool,
    running: AtomicBool,
}

/// Cheap handle for producers of input and requests.
#[derive(Debug, Clone)]
pub struct WorkerInput {
    shared: Arc<Shared>,
}

impl WorkerInput {
    /// Queue an event. Never blocks on the module.
    pub fn push(&self, event: InputEvent) {
        self.shared.queue.push(event);
    }

    pub fn extend(&self, events: impl IntoIterator<Item = InputEvent>) {
        self.shared.queue.extend(events);
    }

    /// Flag an accelerated-buffer request for the next iteration.
    pub fn request_accel(&self) {
        self.shared.accel_requested.store(true, Ordering::SeqCst);
    }
}

pub struct TransportWorker {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl TransportWorker {
    /// Start the worker thread.
    pub fn spawn<M: ProtocolModule + 'static>(
        module: Arc<Mutex<M>>,
        exit: Arc<dyn ExitHandle>,
        poll_interval: Duration,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared::default());
        shared.running.store(true, Ordering::SeqCst);

        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("xup-transport".into())
            .spawn(move || run(module, thread_shared, exit, poll_interval))?;

        info!("Transport worker started (poll every {:?})", poll_interval);
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn input(&self) -> WorkerInput {
        WorkerInput {
            shared: self.shared.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Clear the running flag and join. Must happen before the module is
    /// unloaded.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Transport worker panicked");
            }
            debug!("Transport worker joined");
        }
    }
}

impl Drop for TransportWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<M: ProtocolModule>(
    module: Arc<Mutex<M>>,
    shared: Arc<Shared>,
    exit: Arc<dyn ExitHandle>,
    poll_interval: Duration,
) {
    while shared.running.load(Ordering::SeqCst) {
        let status = {
            let mut module = module.lock().unwrap_or_else(PoisonError::into_inner);
            service(&mut *module, &shared)
        };
        if status == TransportStatus::Closed {
            info!("Transport closed, requesting exit");
            shared.running.store(false, Ordering::SeqCst);
            exit.request_exit();
            break;
        }
        thread::sleep(poll_interval);
    }
}

/// One iteration with the communication lock held.
fn service<M: ProtocolModule + ?Sized>(module: &mut M, shared: &Shared) -> TransportStatus {
    if module.check_transport() == TransportStatus::Closed {
        return TransportStatus::Closed;
    }

    for event in shared.queue.drain() {
        let message = event.message();
        if let Err(e) = module.send_event(&message) {
            warn!("Dropping input message {}: {}", message.msg, e);
        }
    }

    if shared.accel_requested.swap(false, Ordering::SeqCst) {
        match module.request_accel() {
            Ok(()) => info!("Requested accelerated buffers"),
            Err(e) => warn!("Accelerated buffer request failed: {}", e),
        }
    }
    TransportStatus::Open
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::msg;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct FakeModule {
        sent: Vec<ModuleMessage>,
        accel_requests: u32,
        polls: usize,
        close_after: Option<usize>,
    }

    impl ProtocolModule for FakeModule {
        fn check_transport(&mut self) -> TransportStatus {
            self.polls += 1;
            match self.close_after {
                Some(n) if self.polls > n => TransportStatus::Closed,
                _ => TransportStatus::Open,
            }
        }

        fn send_event(&mut self, message: &ModuleMessage) -> Result<(), ModuleError> {
            self.sent.push(*message);
            Ok(())
        }

        fn request_accel(&mut self) -> Result<(), ModuleError> {
            self.accel_requests += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingExit(AtomicUsize);

    impl ExitHandle for CountingExit {
        fn request_exit(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_service_forwards_queue_in_order() {
        let shared = Shared::default();
        shared.queue.extend([
            InputEvent::pointer_move(1, 2),
            InputEvent::button_down(1, 2, 1),
            InputEvent::button_up(1, 2, 1),
        ]);
        let mut module = FakeModule::default();

        assert_eq!(service(&mut module, &shared), TransportStatus::Open);
        let codes: Vec<i32> = module.sent.iter().map(|m| m.msg).collect();
        assert_eq!(codes, vec![msg::WM_MOUSEMOVE, msg::WM_LBUTTONDOWN, msg::WM_LBUTTONUP]);
        assert!(shared.queue.is_empty());
    }

    #[test]
    fn test_service_handles_accel_request_once() {
        let shared = Shared::default();
        shared.accel_requested.store(true, Ordering::SeqCst);
        let mut module = FakeModule::default();
        service(&mut module, &shared);
        service(&mut module, &shared);
        assert_eq!(module.accel_requests, 1);
    }

    #[test]
    fn test_closed_transport_skips_queue() {
        let shared = Shared::default();
        shared.queue.push(InputEvent::pointer_move(0, 0));
        let mut module = FakeModule {
            close_after: Some(0),
            ..Default::default()
        };
        assert_eq!(service(&mut module, &shared), TransportStatus::Closed);
        assert!(module.sent.is_empty());
    }

    #[test]
    fn test_worker_delivers_input_and_stops() {
        let module = Arc::new(Mutex::new(FakeModule::default()));
        let exit = Arc::new(CountingExit::default());
        let mut worker =
            TransportWorker::spawn(module.clone(), exit.clone(), Duration::from_millis(1)).unwrap();

        let input = worker.input();
        input.push(InputEvent::pointer_move(3, 4));
        input.request_accel();
        wait_for(|| {
            let m = module.lock().unwrap();
            m.sent.len() == 1 && m.accel_requests == 1
        });

        worker.stop();
        assert!(!worker.is_running());
        assert_eq!(exit.0.load(Ordering::SeqCst), 0);
        assert_eq!(module.lock().unwrap().sent[0].param1, 3);
    }

    #[test]
    fn test_worker_requests_exit_when_transport_closes() {
        let module = Arc::new(Mutex::new(FakeModule {
            close_after: Some(3),
            ..Default::default()
        }));
        let exit = Arc::new(CountingExit::default());
        let worker = TransportWorker::spawn(module, exit.clone(), Duration::from_millis(1)).unwrap();

        wait_for(|| exit.0.load(Ordering::SeqCst) == 1);
        wait_for(|| !worker.is_running());
        drop(worker);
        assert_eq!(exit.0.load(Ordering::SeqCst), 1);
    }
}
