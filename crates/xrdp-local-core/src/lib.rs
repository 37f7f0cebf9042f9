//! xrdp-local core
//!
//! Platform-neutral pieces of the bridge between the xup protocol module and
//! the local display: frame hand-off between threads, the CPU framebuffer,
//! the accelerated buffer state machine, the input queue and the transport
//! worker that serializes every call into the protocol module.
//!
//! The `xrdp-local` binary supplies the X11, EGL and dlopen implementations
//! of the traits defined here.

pub mod accel;
pub mod cursor;
pub mod display;
pub mod error;
pub mod frame;
pub mod input;
pub mod latch;
pub mod probe;
pub mod sink;
pub mod worker;

pub use error::{AccelError, CursorError, FrameError, ModuleError, SinkError};
