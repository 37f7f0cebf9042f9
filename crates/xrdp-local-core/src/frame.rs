//! Frame hand-off from the protocol thread to the render thread.
//!
//! The protocol module owns the pixel buffer of every paint callback and
//! frees (or unmaps) it as soon as the callback returns. A [`FrameChannel`]
//! lends that buffer to the render thread and keeps the protocol thread
//! parked until the render thread lets go of it.
//!
//! Two transfer modes exist, picked once for the whole process:
//! - [`FrameTransfer::Borrow`]: zero copies, the producer blocks for the
//!   duration of the render-thread update (lower throughput on the protocol
//!   side, no allocation).
//! - [`FrameTransfer::Copy`]: pixels and rects are copied at creation, the
//!   producer continues immediately (one allocation + copy per frame).

use std::borrow::Cow;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::FrameError;
use crate::latch::{self, Signal, Wait};

/// Bytes per packed pixel in every frame buffer.
pub const BYTES_PER_PIXEL: usize = 4;

/// Size of one rect on the wire.
pub const RECT_WIRE_SIZE: usize = 8;

/// One dirty rectangle, exactly as xorgxrdp lays it out: four signed 16-bit
/// little-endian fields, no padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateRect {
    pub x: i16,
    pub y: i16,
    pub w: i16,
    pub h: i16,
}

// SAFETY: four i16 fields, repr(C), 8 bytes with no padding.
unsafe impl bytemuck::Zeroable for UpdateRect {}
unsafe impl bytemuck::Pod for UpdateRect {}

impl UpdateRect {
    pub fn new(x: i16, y: i16, w: i16, h: i16) -> Self {
        Self { x, y, w, h }
    }

    /// Decode one 8-byte wire record.
    pub fn from_wire(b: [u8; RECT_WIRE_SIZE]) -> Self {
        Self {
            x: i16::from_le_bytes([b[0], b[1]]),
            y: i16::from_le_bytes([b[2], b[3]]),
            w: i16::from_le_bytes([b[4], b[5]]),
            h: i16::from_le_bytes([b[6], b[7]]),
        }
    }

    pub fn to_wire(self) -> [u8; RECT_WIRE_SIZE] {
        let mut out = [0u8; RECT_WIRE_SIZE];
        out[0..2].copy_from_slice(&self.x.to_le_bytes());
        out[2..4].copy_from_slice(&self.y.to_le_bytes());
        out[4..6].copy_from_slice(&self.w.to_le_bytes());
        out[6..8].copy_from_slice(&self.h.to_le_bytes());
        out
    }

    /// View a wire rect list as rects.
    ///
    /// On little-endian hosts with a suitably aligned buffer this borrows the
    /// bytes in place; otherwise every record is decoded with an explicit
    /// byte swap.
    pub fn slice_from_wire(bytes: &[u8]) -> Result<Cow<'_, [UpdateRect]>, FrameError> {
        if bytes.len() % RECT_WIRE_SIZE != 0 {
            return Err(FrameError::RaggedRects(bytes.len()));
        }

        #[cfg(target_endian = "little")]
        if let Ok(rects) = bytemuck::try_cast_slice::<u8, UpdateRect>(bytes) {
            return Ok(Cow::Borrowed(rects));
        }

        Ok(Cow::Owned(
            bytes
                .chunks_exact(RECT_WIRE_SIZE)
                .map(|c| UpdateRect::from_wire([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ))
    }
}

/// One batch of rectangle changes over a borrowed pixel buffer.
///
/// `pixels` covers `width * height` packed 32-bit pixels, row-major. Each
/// rect addresses the source buffer directly and lands on the framebuffer
/// shifted by (`left`, `top`).
#[derive(Debug, Clone, Copy)]
pub struct FrameUpdate<'a> {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
    pub rects: &'a [UpdateRect],
    pub pixels: &'a [u8],
}

impl<'a> FrameUpdate<'a> {
    pub fn new(
        left: i32,
        top: i32,
        width: u32,
        height: u32,
        rects: &'a [UpdateRect],
        pixels: &'a [u8],
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if pixels.len() < expected {
            return Err(FrameError::BufferTooSmall {
                width,
                height,
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            left,
            top,
            width,
            height,
            rects,
            pixels,
        })
    }

    /// Bytes per source row.
    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }
}

/// System-wide frame transfer mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameTransfer {
    #[default]
    Borrow,
    Copy,
}

enum Storage {
    /// Points into the producer's buffer; valid until the release signal.
    Borrowed {
        pixels: *const u8,
        pixels_len: usize,
        rects: *const UpdateRect,
        rects_len: usize,
    },
    Owned {
        pixels: Vec<u8>,
        rects: Vec<UpdateRect>,
    },
}

/// Consumer half of a [`FrameChannel`].
///
/// Dropping the handle releases the frame, so every exit path of the
/// consumer (including errors and an exiting render loop) unblocks the
/// producer. [`FrameHandle::signal_released`] does the same explicitly.
pub struct FrameHandle {
    left: i32,
    top: i32,
    width: u32,
    height: u32,
    storage: Storage,
    release: Option<Signal<()>>,
}

// SAFETY: borrowed storage is only read, and the producer thread keeps the
// underlying buffer alive until `release` fires or is dropped.
unsafe impl Send for FrameHandle {}

impl FrameHandle {
    /// The update this handle carries.
    pub fn update(&self) -> FrameUpdate<'_> {
        let (pixels, rects) = match &self.storage {
            Storage::Borrowed {
                pixels,
                pixels_len,
                rects,
                rects_len,
            } => {
                // SAFETY: see `Storage::Borrowed`; the lifetime is tied to
                // `&self`, which cannot outlive the release.
                unsafe {
                    (
                        std::slice::from_raw_parts(*pixels, *pixels_len),
                        std::slice::from_raw_parts(*rects, *rects_len),
                    )
                }
            }
            Storage::Owned { pixels, rects } => (pixels.as_slice(), rects.as_slice()),
        };
        FrameUpdate {
            left: self.left,
            top: self.top,
            width: self.width,
            height: self.height,
            rects,
            pixels,
        }
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self.storage, Storage::Borrowed { .. })
    }

    /// Tell the producer the buffer is no longer in use.
    pub fn signal_released(mut self) {
        if let Some(release) = self.release.take() {
            release.signal(());
        }
    }
}

/// Blocks on drop until the consumer has let go of the frame, so the wait
/// also runs when `deliver` unwinds.
struct ReleaseGuard(Option<Wait<()>>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(released) = self.0.take() {
            trace!("Waiting for frame release");
            released.wait();
            trace!("Frame released");
        }
    }
}

/// Producer half: created on the protocol thread around a borrowed update.
pub struct FrameChannel<'a> {
    handle: FrameHandle,
    released: Option<Wait<()>>,
    _borrow: PhantomData<&'a [u8]>,
}

impl<'a> FrameChannel<'a> {
    /// Wrap `update` for transfer. In borrow mode nothing is copied.
    pub fn create(update: FrameUpdate<'a>, mode: FrameTransfer) -> Self {
        let (storage, released, release) = match mode {
            FrameTransfer::Borrow => {
                let (wait, signal) = latch::latch();
                (
                    Storage::Borrowed {
                        pixels: update.pixels.as_ptr(),
                        pixels_len: update.pixels.len(),
                        rects: update.rects.as_ptr(),
                        rects_len: update.rects.len(),
                    },
                    Some(wait),
                    Some(signal),
                )
            }
            FrameTransfer::Copy => {
                let used = update.width as usize * update.height as usize * BYTES_PER_PIXEL;
                (
                    Storage::Owned {
                        pixels: update.pixels[..used].to_vec(),
                        rects: update.rects.to_vec(),
                    },
                    None,
                    None,
                )
            }
        };

        Self {
            handle: FrameHandle {
                left: update.left,
                top: update.top,
                width: update.width,
                height: update.height,
                storage,
                release,
            },
            released,
            _borrow: PhantomData,
        }
    }

    /// Give the consumer half to `deliver`, then block until the consumer
    /// releases it (borrow mode) or return at once (copy mode).
    ///
    /// The wait has no timeout. Handing off and waiting are one step so the
    /// borrowed buffer can never be dropped while a handle still points at it.
    pub fn hand_off<R>(self, deliver: impl FnOnce(FrameHandle) -> R) -> R {
        let Self {
            handle, released, ..
        } = self;
        let _released = ReleaseGuard(released);
        deliver(handle)
    }
}
