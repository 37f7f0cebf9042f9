//! Accelerated presentation through EGL dma-buf import.

pub mod egl;
mod quad;
