//! Accelerated (zero-copy) presentation state machine.
//!
//! The protocol module may hand over a GPU buffer (a dma-buf) instead of
//! shipping pixels. While a buffer is imported, CPU painting of the
//! framebuffer is switched off and every paint becomes a draw of the
//! imported buffer. A failed import changes nothing.

use std::os::fd::RawFd;

use tracing::{debug, info, warn};

use crate::error::AccelError;
use crate::sink::{DisplaySink, Surface};

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

/// `DRM_FORMAT_XRGB8888`
pub const DRM_FORMAT_XRGB8888: u32 = fourcc(b"XR24");
/// `DRM_FORMAT_ARGB8888`
pub const DRM_FORMAT_ARGB8888: u32 = fourcc(b"AR24");

/// Descriptor of a buffer the protocol module wants shown directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelBufferHandle {
    /// Owned by the protocol module; never closed here.
    pub fd: RawFd,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub size: u32,
    pub format: u32,
}

impl AccelBufferHandle {
    /// Check geometry and format before any backend resource is touched.
    pub fn validate(&self) -> Result<(), AccelError> {
        if self.fd < 0 {
            return Err(AccelError::InvalidBuffer(format!("bad fd {}", self.fd)));
        }
        if self.width == 0 || self.height == 0 {
            return Err(AccelError::InvalidBuffer(format!(
                "empty buffer {}x{}",
                self.width, self.height
            )));
        }
        let min_stride = self.width as u64 * 4;
        if (self.stride as u64) < min_stride {
            return Err(AccelError::InvalidBuffer(format!(
                "stride {} below {}",
                self.stride, min_stride
            )));
        }
        let min_size = self.stride as u64 * self.height as u64;
        if (self.size as u64) < min_size {
            return Err(AccelError::InvalidBuffer(format!(
                "size {} below {}",
                self.size, min_size
            )));
        }
        match self.format {
            DRM_FORMAT_XRGB8888 | DRM_FORMAT_ARGB8888 => Ok(()),
            other => Err(AccelError::UnsupportedFormat(other)),
        }
    }
}

/// GPU side of the accelerated path.
///
/// `import` acquires every resource needed to draw the buffer and returns
/// them as one session; dropping the session releases them in reverse
/// order. An `import` that fails part-way must release whatever it already
/// acquired before returning.
pub trait AccelBackend {
    type Session;

    fn import(&mut self, handle: &AccelBufferHandle) -> Result<Self::Session, AccelError>;

    /// Draw the imported buffer onto the visible surface.
    fn render(&mut self, session: &mut Self::Session) -> Result<(), AccelError>;

    /// Drop state shared by sessions. Called once no session is live.
    fn release(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelState {
    Disabled,
    Enabled,
}

/// Owns at most one live backend session.
pub struct AccelPipeline<B: AccelBackend> {
    // Before `backend`: a session must drop while its backend is alive.
    active: Option<(AccelBufferHandle, B::Session)>,
    backend: B,
}

impl<B: AccelBackend> AccelPipeline<B> {
    pub fn new(backend: B) -> Self {
        Self {
            active: None,
            backend,
        }
    }

    pub fn state(&self) -> AccelState {
        if self.active.is_some() {
            AccelState::Enabled
        } else {
            AccelState::Disabled
        }
    }

    pub fn handle(&self) -> Option<&AccelBufferHandle> {
        self.active.as_ref().map(|(h, _)| h)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Import `handle` and switch presentation over to it.
    ///
    /// Returns `false` on any validation or import failure. A failed call
    /// leaves everything as it was: an active session keeps presenting,
    /// otherwise CPU painting stays on. A successful replacement drops the
    /// previous session only after the new one is imported.
    pub fn enable<S: Surface>(&mut self, handle: AccelBufferHandle, sink: &mut DisplaySink<S>) -> bool {
        if let Err(e) = handle.validate() {
            warn!("Rejecting accelerated buffer: {}", e);
            return false;
        }

        let session = match self.backend.import(&handle) {
            Ok(session) => session,
            Err(e) => {
                warn!("Accelerated buffer import failed: {}", e);
                if self.active.is_none() {
                    self.backend.release();
                }
                return false;
            }
        };
        info!(
            "Accelerated path enabled: {}x{} stride {} format {:#010x}",
            handle.width, handle.height, handle.stride, handle.format
        );
        if let Some((previous, _)) = self.active.replace((handle, session)) {
            debug!("Replaced accelerated buffer fd {}", previous.fd);
        }
        sink.set_paint_enabled(false);
        true
    }

    /// Draw the imported buffer. `NotEnabled` when no session is live,
    /// which is expected when a paint races a deactivate.
    pub fn render(&mut self) -> Result<(), AccelError> {
        let (_, session) = self.active.as_mut().ok_or(AccelError::NotEnabled)?;
        self.backend.render(session)
    }

    /// Release the session (if any) and hand painting back to the CPU path.
    pub fn disable<S: Surface>(&mut self, sink: &mut DisplaySink<S>) {
        if let Some((handle, session)) = self.active.take() {
            drop(session);
            info!("Accelerated path disabled (fd {})", handle.fd);
        }
        self.backend.release();
        sink.set_paint_enabled(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::tests::RecordingSurface;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Tracks how many resources are alive at once.
    struct Resource(Rc<Cell<i32>>);

    impl Resource {
        fn acquire(live: &Rc<Cell<i32>>) -> Self {
            live.set(live.get() + 1);
            Self(live.clone())
        }
    }

    impl Drop for Resource {
        fn drop(&mut self) {
            self.0.set(self.0.get() - 1);
        }
    }

    #[derive(Default)]
    struct CountingBackend {
        live: Rc<Cell<i32>>,
        imports: u32,
        renders: u32,
        releases: u32,
        /// Fail while acquiring this resource (0-based).
        fail_at: Option<usize>,
    }

    impl AccelBackend for CountingBackend {
        type Session = Vec<Resource>;

        fn import(&mut self, _: &AccelBufferHandle) -> Result<Self::Session, AccelError> {
            self.imports += 1;
            let mut acquired = Vec::new();
            for step in 0..4 {
                if self.fail_at == Some(step) {
                    return Err(AccelError::backend("acquire", format!("step {}", step)));
                }
                acquired.push(Resource::acquire(&self.live));
            }
            Ok(acquired)
        }

        fn render(&mut self, _: &mut Self::Session) -> Result<(), AccelError> {
            self.renders += 1;
            Ok(())
        }

        fn release(&mut self) {
            self.releases += 1;
        }
    }

    fn handle() -> AccelBufferHandle {
        AccelBufferHandle {
            fd: 9,
            width: 64,
            height: 32,
            stride: 256,
            size: 256 * 32,
            format: DRM_FORMAT_XRGB8888,
        }
    }

    fn sink() -> DisplaySink<RecordingSurface> {
        DisplaySink::new(4, 4, RecordingSurface::default())
    }

    #[test]
    fn test_fourcc_values() {
        assert_eq!(DRM_FORMAT_XRGB8888, 0x3432_5258);
        assert_eq!(DRM_FORMAT_ARGB8888, 0x3432_5241);
    }

    #[test]
    fn test_enable_render_disable_releases_everything() {
        let mut pipeline = AccelPipeline::new(CountingBackend::default());
        let mut sink = sink();

        assert!(pipeline.enable(handle(), &mut sink));
        assert_eq!(pipeline.state(), AccelState::Enabled);
        assert!(!sink.paint_enabled());
        assert_eq!(pipeline.backend().live.get(), 4);

        pipeline.render().unwrap();
        assert_eq!(pipeline.backend().renders, 1);

        pipeline.disable(&mut sink);
        assert_eq!(pipeline.state(), AccelState::Disabled);
        assert!(sink.paint_enabled());
        assert_eq!(pipeline.backend().live.get(), 0);
    }

    #[test]
    fn test_partial_import_failure_leaks_nothing() {
        for fail_at in 0..4 {
            let backend = CountingBackend {
                fail_at: Some(fail_at),
                ..Default::default()
            };
            let mut pipeline = AccelPipeline::new(backend);
            let mut sink = sink();

            assert!(!pipeline.enable(handle(), &mut sink));
            assert_eq!(pipeline.state(), AccelState::Disabled);
            assert!(sink.paint_enabled());
            assert_eq!(pipeline.backend().live.get(), 0, "fail_at {}", fail_at);
        }
    }

    #[test]
    fn test_invalid_handles_never_reach_backend() {
        let bad = [
            AccelBufferHandle { stride: 100, ..handle() },
            AccelBufferHandle { size: 10, ..handle() },
            AccelBufferHandle { width: 0, ..handle() },
            AccelBufferHandle { fd: -1, ..handle() },
            AccelBufferHandle { format: 0x3631_4752, ..handle() },
        ];
        let mut pipeline = AccelPipeline::new(CountingBackend::default());
        let mut sink = sink();
        for h in bad {
            assert!(!pipeline.enable(h, &mut sink));
        }
        assert_eq!(pipeline.backend().imports, 0);
        assert!(sink.paint_enabled());
    }

    #[test]
    fn test_render_without_session_is_not_enabled() {
        let mut pipeline = AccelPipeline::new(CountingBackend::default());
        assert!(matches!(pipeline.render(), Err(AccelError::NotEnabled)));
    }

    #[test]
    fn test_disable_is_safe_when_idle() {
        let mut pipeline = AccelPipeline::new(CountingBackend::default());
        let mut sink = sink();
        pipeline.disable(&mut sink);
        pipeline.disable(&mut sink);
        assert_eq!(pipeline.state(), AccelState::Disabled);
        assert!(sink.surface().presented.is_empty());
    }

    #[test]
    fn test_second_enable_replaces_first_session() {
        let mut pipeline = AccelPipeline::new(CountingBackend::default());
        let mut sink = sink();
        assert!(pipeline.enable(handle(), &mut sink));
        assert!(pipeline.enable(AccelBufferHandle { fd: 11, ..handle() }, &mut sink));
        assert_eq!(pipeline.backend().live.get(), 4);
        assert_eq!(pipeline.handle().map(|h| h.fd), Some(11));
        assert_eq!(pipeline.backend().releases, 0);
    }

    #[test]
    fn test_rejected_replacement_keeps_active_session() {
        let mut pipeline = AccelPipeline::new(CountingBackend::default());
        let mut sink = sink();
        assert!(pipeline.enable(handle(), &mut sink));

        assert!(!pipeline.enable(AccelBufferHandle { fd: 11, stride: 1, ..handle() }, &mut sink));
        assert_eq!(pipeline.state(), AccelState::Enabled);
        assert_eq!(pipeline.handle().map(|h| h.fd), Some(9));
        assert!(!sink.paint_enabled());
        assert_eq!(pipeline.backend().live.get(), 4);
        pipeline.render().unwrap();
    }

    #[test]
    fn test_failed_replacement_import_keeps_active_session() {
        let mut pipeline = AccelPipeline::new(CountingBackend::default());
        let mut sink = sink();
        assert!(pipeline.enable(handle(), &mut sink));

        pipeline.backend.fail_at = Some(2);
        assert!(!pipeline.enable(AccelBufferHandle { fd: 11, ..handle() }, &mut sink));
        assert_eq!(pipeline.state(), AccelState::Enabled);
        assert_eq!(pipeline.handle().map(|h| h.fd), Some(9));
        assert!(!sink.paint_enabled());
        assert_eq!(pipeline.backend().live.get(), 4);
        assert_eq!(pipeline.backend().releases, 0);

        pipeline.disable(&mut sink);
        assert_eq!(pipeline.backend().live.get(), 0);
        assert_eq!(pipeline.backend().releases, 1);
    }
}
