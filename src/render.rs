//! Render thread run loop.
//!
//! The thread that calls [`RenderState::run`] owns the window, the CPU
//! framebuffer and the EGL context. Other threads reach it only by posting
//! [`RenderTask`]s through a [`RenderHandle`].

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use xrdp_local_core::AccelError;
use xrdp_local_core::accel::{AccelBufferHandle, AccelPipeline, AccelState};
use xrdp_local_core::cursor::CursorImage;
use xrdp_local_core::frame::FrameHandle;
use xrdp_local_core::latch;
use xrdp_local_core::sink::{DisplaySink, Region};
use xrdp_local_core::worker::{ExitHandle, WorkerInput};

use crate::accel::egl::EglBackend;
use crate::input::{WindowEvent, translate};
use crate::window::XWindow;
use crate::x11_async::X11EventStream;

type RenderFn = Box<dyn FnOnce(&mut RenderState) + Send>;

pub enum RenderTask {
    Frame(FrameHandle),
    Cursor(CursorImage),
    Run(RenderFn),
    Exit,
}

/// Sending side of the render thread's task queue.
#[derive(Clone)]
pub struct RenderHandle {
    tx: mpsc::UnboundedSender<RenderTask>,
}

impl RenderHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RenderTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a frame. If the render loop is gone the frame is dropped,
    /// which releases it.
    pub fn post_frame(&self, frame: FrameHandle) -> bool {
        self.tx.send(RenderTask::Frame(frame)).is_ok()
    }

    pub fn post_cursor(&self, image: CursorImage) -> bool {
        self.tx.send(RenderTask::Cursor(image)).is_ok()
    }

    /// Run `f` on the render thread and block until it returns.
    ///
    /// `None` when the render loop exited before running it.
    pub fn run_blocking<R, F>(&self, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut RenderState) -> R + Send + 'static,
    {
        let (wait, done) = latch::latch();
        let task: RenderFn = Box::new(move |state| done.signal(f(state)));
        if self.tx.send(RenderTask::Run(task)).is_err() {
            return None;
        }
        wait.wait()
    }
}

impl ExitHandle for RenderHandle {
    fn request_exit(&self) {
        if self.tx.send(RenderTask::Exit).is_err() {
            debug!("Exit requested after render loop ended");
        }
    }
}

pub struct RenderState {
    // Declared before `sink`: the EGL surface must go before the window.
    accel: Option<AccelPipeline<EglBackend>>,
    sink: DisplaySink<XWindow>,
    exit_requested: bool,
}

impl RenderState {
    pub fn new(sink: DisplaySink<XWindow>, accel: Option<AccelPipeline<EglBackend>>) -> Self {
        Self {
            accel,
            sink,
            exit_requested: false,
        }
    }

    pub fn window(&self) -> &XWindow {
        self.sink.surface()
    }

    fn apply_frame(&mut self, frame: FrameHandle) {
        let result = self.sink.apply_update(&frame.update());
        frame.signal_released();
        if let Err(e) = result {
            error!("Failed to apply frame update: {}", e);
            self.exit_requested = true;
        }
    }

    fn set_cursor(&mut self, image: CursorImage) {
        if let Err(e) = self.sink.surface_mut().set_cursor(&image) {
            warn!("Failed to set cursor: {:#}", e);
        }
    }

    /// Switch presentation to `handle`. False leaves the CPU path active.
    pub fn enable_accel(&mut self, handle: AccelBufferHandle) -> bool {
        match self.accel.as_mut() {
            Some(pipeline) => pipeline.enable(handle, &mut self.sink),
            None => {
                warn!("Accelerated buffer offered but the accelerated path is off");
                false
            }
        }
    }

    pub fn disable_accel(&mut self) {
        match self.accel.as_mut() {
            Some(pipeline) => pipeline.disable(&mut self.sink),
            None => self.sink.set_paint_enabled(true),
        }
    }

    pub fn render_accel(&mut self) -> Result<(), AccelError> {
        self.accel.as_mut().ok_or(AccelError::NotEnabled)?.render()
    }

    fn accel_enabled(&self) -> bool {
        self.accel
            .as_ref()
            .is_some_and(|p| p.state() == AccelState::Enabled)
    }

    fn expose(&mut self, region: Region) {
        trace!("Expose {:?}", region);
        let result = if self.accel_enabled() {
            self.render_accel().map_err(|e| e.to_string())
        } else {
            self.sink.paint(region).map_err(|e| e.to_string())
        };
        if let Err(e) = result {
            warn!("Repaint failed: {}", e);
        }
    }

    fn execute(&mut self, task: RenderTask) {
        match task {
            RenderTask::Frame(frame) => self.apply_frame(frame),
            RenderTask::Cursor(image) => self.set_cursor(image),
            RenderTask::Run(f) => f(self),
            RenderTask::Exit => self.exit_requested = true,
        }
    }

    fn handle_window_event(&mut self, event: WindowEvent, input: &WorkerInput) {
        match event {
            WindowEvent::Input(events) => input.extend(events),
            WindowEvent::Expose(region) => self.expose(region),
            WindowEvent::Close => {
                info!("Window closed");
                self.exit_requested = true;
            }
            WindowEvent::Ignore => {}
        }
    }

    /// Run until an exit request, a closed window, a signal or a lost X
    /// connection. Tasks still queued on return are dropped, which
    /// releases any frame or blocked caller waiting on them.
    pub async fn run(
        &mut self,
        mut tasks: mpsc::UnboundedReceiver<RenderTask>,
        stream: X11EventStream,
        input: WorkerInput,
    ) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let atoms = *self.window().atoms();

        info!("Render loop started");
        while !self.exit_requested {
            tokio::select! {
                () = stream.readable() => {}
                task = tasks.recv() => match task {
                    Some(task) => self.execute(task),
                    None => self.exit_requested = true,
                },
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    self.exit_requested = true;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down");
                    self.exit_requested = true;
                }
            }

            match stream.drain() {
                Ok(events) => {
                    for event in &events {
                        self.handle_window_event(translate(event, &atoms), &input);
                    }
                }
                Err(e) => {
                    error!("X11 connection lost: {:#}", e);
                    self.exit_requested = true;
                }
            }
            if let Err(e) = stream.flush() {
                warn!("Failed to flush X11 requests: {:#}", e);
            }
        }

        tasks.close();
        let mut dropped = 0;
        while let Ok(task) = tasks.try_recv() {
            drop(task);
            dropped += 1;
        }
        info!("Render loop stopped ({} pending task(s) dropped)", dropped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use xrdp_local_core::frame::{FrameChannel, FrameTransfer, FrameUpdate, UpdateRect};

    #[test]
    fn test_run_blocking_after_loop_exit_returns_none() {
        let (handle, tasks) = RenderHandle::channel();
        drop(tasks);
        assert_eq!(handle.run_blocking(|_| 7), None);
    }

    #[test]
    fn test_dropped_task_unblocks_caller() {
        let (handle, mut tasks) = RenderHandle::channel();
        let caller = thread::spawn(move || handle.run_blocking(|_| 1));
        let task = tasks.blocking_recv();
        assert!(matches!(task, Some(RenderTask::Run(_))));
        drop(task);
        assert_eq!(caller.join().unwrap(), None);
    }

    #[test]
    fn test_frame_posted_after_exit_is_released() {
        let (handle, tasks) = RenderHandle::channel();
        drop(tasks);

        let pixels = vec![0u8; 2 * 2 * 4];
        let rects = [UpdateRect::new(0, 0, 2, 2)];
        let update = FrameUpdate::new(0, 0, 2, 2, &rects, &pixels).unwrap();
        let delivered = FrameChannel::create(update, FrameTransfer::Borrow).hand_off(|h| handle.post_frame(h));
        assert!(!delivered);
    }

    #[test]
    fn test_exit_request_is_queued() {
        let (handle, mut tasks) = RenderHandle::channel();
        ExitHandle::request_exit(&handle);
        assert!(matches!(tasks.try_recv(), Ok(RenderTask::Exit)));
    }
}
