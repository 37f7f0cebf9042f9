//! Error types shared by the bridge.
//!
//! Each concern gets its own enum so callers can tell a recoverable
//! degradation (cursor, accel) from a fatal one (frame apply, transport).

use thiserror::Error;

/// Failures while building or consuming a frame update.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The pixel buffer is shorter than `width * height * 4` bytes.
    #[error("pixel buffer too small: {actual} bytes for {width}x{height} (need {expected})")]
    BufferTooSmall {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    /// The rect list is not a whole number of 8-byte wire records.
    #[error("rect list of {0} bytes is not a multiple of 8")]
    RaggedRects(usize),
}

/// Failures applying an update onto the composited framebuffer.
#[derive(Debug, Error)]
pub enum SinkError {
    /// A rectangle has a negative origin or extent.
    #[error("invalid rect {x},{y} {w}x{h}")]
    InvalidRect { x: i16, y: i16, w: i16, h: i16 },

    /// A rectangle reaches outside the update's source buffer.
    #[error("rect {x},{y} {w}x{h} exceeds source {width}x{height}")]
    RectOutOfBounds {
        x: i16,
        y: i16,
        w: i16,
        h: i16,
        width: u32,
        height: u32,
    },

    /// The visible surface refused the repaint.
    #[error("surface present failed: {0}")]
    Present(String),
}

/// Failures on the accelerated (zero-copy) path. All are recoverable: the
/// CPU path stays in charge.
#[derive(Debug, Error)]
pub enum AccelError {
    #[error("invalid buffer geometry: {0}")]
    InvalidBuffer(String),

    #[error("unsupported pixel format {0:#010x}")]
    UnsupportedFormat(u32),

    #[error("accelerated path is not enabled")]
    NotEnabled,

    #[error("{call} failed: {detail}")]
    Backend { call: &'static str, detail: String },
}

impl AccelError {
    pub fn backend(call: &'static str, detail: impl Into<String>) -> Self {
        Self::Backend {
            call,
            detail: detail.into(),
        }
    }
}

/// Failures converting a protocol cursor image.
#[derive(Debug, Error)]
pub enum CursorError {
    #[error("unsupported cursor depth: {0} bpp")]
    UnsupportedDepth(u32),

    #[error("cursor {what} too small: {actual} bytes (need {expected})")]
    ShortData {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("empty cursor {0}x{1}")]
    Empty(u32, u32),
}

/// Failures reported by (or about) the protocol module.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// A protocol callback this bridge does not support was invoked.
    #[error("{0} is not implemented")]
    Unimplemented(&'static str),

    /// The module returned a non-zero status from an entry point.
    #[error("{call} returned {code}")]
    Call { call: &'static str, code: i32 },

    /// The module does not provide an optional entry point.
    #[error("module has no {0} entry point")]
    MissingEntryPoint(&'static str),
}
