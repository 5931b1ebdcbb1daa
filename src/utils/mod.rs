//! Small cross-cutting utilities shared by the allocator, drm and x11 backends.

pub mod fd;
pub mod serial;

pub use fd::{DevPath, DeviceFd};
pub use serial::{Serial, SerialCounter, SERIAL_COUNTER};
