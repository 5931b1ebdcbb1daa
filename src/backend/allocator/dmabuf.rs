//! [`Dmabuf`]: a GPU buffer shared as one or more dma-buf file descriptors.

use super::{Buffer, Format, Modifier};
use crate::backend::drm::node::DrmNode;
use std::os::unix::io::OwnedFd;
use std::sync::Arc;

/// Maximum number of planes a [`Dmabuf`] can carry.
///
/// Four matches every format this crate negotiates (at most one chroma and
/// one alpha plane beyond a base plane pair) and is the limit DRI3
/// `BuffersFromPixmap`/`PixmapFromBuffers` themselves use.
pub const MAX_PLANES: usize = 4;

bitflags::bitflags! {
    /// Flags describing how the planes of a [`Dmabuf`] relate to each other.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DmabufFlags: u32 {
        /// The planes originate from separate, unrelated allocations.
        const RELAXED = 0b0000_0001;
    }
}

#[derive(Debug)]
struct Plane {
    fd: Arc<OwnedFd>,
    offset: u32,
    stride: u32,
}

#[derive(Debug)]
struct DmabufInner {
    width: u32,
    height: u32,
    format: Format,
    #[allow(dead_code)]
    flags: DmabufFlags,
    planes: smallvec::SmallVec<[Plane; MAX_PLANES]>,
    node: Option<DrmNode>,
}

/// A GPU buffer shared as dma-buf file descriptors, one per plane.
///
/// Cheaply cloneable (the underlying fds are reference counted); every
/// clone shares ownership of the same planes, so closing happens once the
/// last clone is dropped.
#[derive(Debug, Clone)]
pub struct Dmabuf(Arc<DmabufInner>);

impl Buffer for Dmabuf {
    fn width(&self) -> u32 {
        self.0.width
    }

    fn height(&self) -> u32 {
        self.0.height
    }

    fn format(&self) -> Format {
        self.0.format
    }
}

impl Dmabuf {
    /// Start building a new [`Dmabuf`] with the size and format of `buffer`.
    pub fn builder_from_buffer<B: Buffer>(buffer: &B, flags: DmabufFlags) -> DmabufBuilder {
        DmabufBuilder {
            width: buffer.width(),
            height: buffer.height(),
            format: buffer.format(),
            flags,
            planes: smallvec::SmallVec::new(),
            node: None,
        }
    }

    /// Start building a new [`Dmabuf`] from explicit dimensions and format.
    pub fn builder(width: u32, height: u32, format: Format, flags: DmabufFlags) -> DmabufBuilder {
        DmabufBuilder {
            width,
            height,
            format,
            flags,
            planes: smallvec::SmallVec::new(),
            node: None,
        }
    }

    /// Number of planes.
    pub fn num_planes(&self) -> usize {
        self.0.planes.len()
    }

    /// Whether this buffer carries an explicit, non-linear modifier.
    pub fn has_modifier(&self) -> bool {
        !matches!(self.0.format.modifier, Modifier::Invalid | Modifier::Linear)
    }

    /// Borrowed file descriptors, one per plane, in plane order.
    pub fn handles(&self) -> impl ExactSizeIterator<Item = std::os::unix::io::BorrowedFd<'_>> + '_ {
        use std::os::unix::io::AsFd;
        self.0.planes.iter().map(|p| p.fd.as_fd())
    }

    /// Byte offsets, one per plane, in plane order.
    pub fn offsets(&self) -> impl ExactSizeIterator<Item = u32> + '_ {
        self.0.planes.iter().map(|p| p.offset)
    }

    /// Byte strides, one per plane, in plane order.
    pub fn strides(&self) -> impl ExactSizeIterator<Item = u32> + '_ {
        self.0.planes.iter().map(|p| p.stride)
    }

    /// The DRM node the buffer was exported from, if known.
    ///
    /// Populated for PRIME intermediate buffers and used to match the
    /// server's device against the allocator's device (spec §4.1 step 3).
    pub fn node(&self) -> Option<DrmNode> {
        self.0.node
    }
}

/// Builder for [`Dmabuf`]; collects planes before an immutable `Dmabuf` is built.
#[derive(Debug)]
pub struct DmabufBuilder {
    width: u32,
    height: u32,
    format: Format,
    flags: DmabufFlags,
    planes: smallvec::SmallVec<[Plane; MAX_PLANES]>,
    node: Option<DrmNode>,
}

/// Error returned by [`DmabufBuilder::build`].
#[derive(thiserror::Error, Debug)]
pub enum DmabufBuilderError {
    /// No planes were ever added.
    #[error("a dmabuf needs at least one plane")]
    NoPlanes,
    /// More than [`MAX_PLANES`] planes were added.
    #[error("a dmabuf cannot have more than {MAX_PLANES} planes")]
    TooManyPlanes,
}

impl DmabufBuilder {
    /// Add a plane. `fd` is consumed — ownership of the fd crosses into the
    /// `Dmabuf` exactly once and is closed when the last reference to the
    /// built buffer is dropped.
    pub fn add_plane(&mut self, fd: OwnedFd, _plane_idx: u32, offset: u32, stride: u32) -> bool {
        if self.planes.len() >= MAX_PLANES {
            return false;
        }
        self.planes.push(Plane {
            fd: Arc::new(fd),
            offset,
            stride,
        });
        true
    }

    /// Record which DRM device node this buffer was exported from.
    pub fn set_node(&mut self, node: DrmNode) {
        self.node = Some(node);
    }

    /// Finish building, yielding an immutable, reference-counted [`Dmabuf`].
    pub fn build(self) -> Result<Dmabuf, DmabufBuilderError> {
        if self.planes.is_empty() {
            return Err(DmabufBuilderError::NoPlanes);
        }
        if self.planes.len() > MAX_PLANES {
            return Err(DmabufBuilderError::TooManyPlanes);
        }
        Ok(Dmabuf(Arc::new(DmabufInner {
            width: self.width,
            height: self.height,
            format: self.format,
            flags: self.flags,
            planes: self.planes,
            node: self.node,
        })))
    }
}

/// Types that can export themselves as a [`Dmabuf`].
pub trait AsDmabuf {
    /// Error produced if export fails.
    type Error: std::error::Error;

    /// Export this buffer's planes as a [`Dmabuf`].
    fn export(&self) -> Result<Dmabuf, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use drm_fourcc::DrmFourcc;

    fn devnull() -> OwnedFd {
        use std::fs::File;
        File::open("/dev/null").unwrap().into()
    }

    #[test]
    fn builder_rejects_empty() {
        let format = Format {
            code: DrmFourcc::Xrgb8888,
            modifier: Modifier::Linear,
        };
        let builder = Dmabuf::builder(4, 4, format, DmabufFlags::empty());
        assert!(matches!(builder.build(), Err(DmabufBuilderError::NoPlanes)));
    }

    #[test]
    fn builder_builds_with_one_plane() {
        let format = Format {
            code: DrmFourcc::Xrgb8888,
            modifier: Modifier::Linear,
        };
        let mut builder = Dmabuf::builder(4, 4, format, DmabufFlags::empty());
        assert!(builder.add_plane(devnull(), 0, 0, 16));
        let dmabuf = builder.build().unwrap();
        assert_eq!(dmabuf.num_planes(), 1);
        assert_eq!(dmabuf.width(), 4);
        assert_eq!(dmabuf.height(), 4);
        assert!(!dmabuf.has_modifier());
    }

    #[test]
    fn has_modifier_excludes_linear_and_invalid() {
        let linear = Format {
            code: DrmFourcc::Xrgb8888,
            modifier: Modifier::Linear,
        };
        let tiled = Format {
            code: DrmFourcc::Xrgb8888,
            modifier: Modifier::I915XTiled,
        };
        let mut b1 = Dmabuf::builder(4, 4, linear, DmabufFlags::empty());
        b1.add_plane(devnull(), 0, 0, 16);
        assert!(!b1.build().unwrap().has_modifier());

        let mut b2 = Dmabuf::builder(4, 4, tiled, DmabufFlags::empty());
        b2.add_plane(devnull(), 0, 0, 16);
        assert!(b2.build().unwrap().has_modifier());
    }
}
