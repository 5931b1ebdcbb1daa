//! GPU buffer allocation and dma-buf export/import.
//!
//! [`Allocator`] is implemented by [`gbm::GbmAllocator`] and produces
//! [`Buffer`]s that can be turned into a [`dmabuf::Dmabuf`] via
//! [`dmabuf::AsDmabuf`] for sharing with the X server.

pub mod dmabuf;
pub mod format;
pub mod gbm;

pub use drm_fourcc::{
    DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier, DrmVendor as Vendor,
    UnrecognizedFourcc, UnrecognizedVendor,
};

/// A buffer of GPU memory with a known size and pixel format.
pub trait Buffer {
    /// Width of the buffer in pixels.
    fn width(&self) -> u32;
    /// Height of the buffer in pixels.
    fn height(&self) -> u32;
    /// Width and height of the buffer in pixels.
    fn size(&self) -> (u32, u32) {
        (self.width(), self.height())
    }
    /// Format (fourcc + modifier) of the buffer.
    fn format(&self) -> Format;
}

/// Type capable of allocating new buffers.
pub trait Allocator {
    /// Type of buffers this allocator produces.
    type Buffer: Buffer;
    /// Type of errors this allocator produces.
    type Error: std::error::Error;

    /// Create a new buffer of the given size, format and candidate modifiers.
    ///
    /// The allocator is free to pick any of the given modifiers (or, on
    /// platforms without explicit modifier support, implicit tiling); the
    /// modifier actually used is recoverable from [`Buffer::format`].
    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Self::Buffer, Self::Error>;
}
