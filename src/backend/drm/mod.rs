//! DRM device node identification and kernel timeline syncobjs.
//!
//! [`node`] identifies a DRM device node from a path or an open fd.
//! [`DrmDeviceFd`] is a ref-counted handle to an open render-node fd that
//! implements the [`drm::Device`]/[`drm::control::Device`] traits, giving
//! access to the `DRM_IOCTL_SYNCOBJ_*` family the explicit-sync path in
//! [`crate::backend::x11::timeline`] is built on.

pub mod node;

pub use node::{CreateDrmNodeError, DrmNode, NodeType};

use crate::utils::{DevPath, DeviceFd};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::Arc;

#[derive(Debug)]
struct DrmDeviceFdInner {
    fd: DeviceFd,
}

impl Drop for DrmDeviceFdInner {
    fn drop(&mut self) {
        tracing::debug!(path = ?self.fd.dev_path(), "closing drm device fd");
    }
}

impl AsFd for DrmDeviceFdInner {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl drm::Device for DrmDeviceFdInner {}
impl drm::control::Device for DrmDeviceFdInner {}

/// A ref-counted file descriptor of an open DRM render node.
///
/// Unlike a modesetting compositor's device handle, this never attempts to
/// acquire DRM master: a render-only client has no business becoming master,
/// and `create_syncobj`/`syncobj_timeline_*` ioctls don't require it.
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<DrmDeviceFdInner>);

impl DrmDeviceFd {
    /// Wrap an already-open device fd.
    pub fn new(fd: DeviceFd) -> DrmDeviceFd {
        DrmDeviceFd(Arc::new(DrmDeviceFdInner { fd }))
    }

    /// The underlying [`DeviceFd`].
    pub fn device_fd(&self) -> DeviceFd {
        self.0.fd.clone()
    }
}

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl AsRawFd for DrmDeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.as_raw_fd()
    }
}

impl drm::Device for DrmDeviceFd {}
impl drm::control::Device for DrmDeviceFd {}

/// A non-owning reference to a [`DrmDeviceFd`], usable from contexts that
/// must not keep the device alive on their own (e.g. a cached device match
/// held across a callback into driver code).
#[derive(Debug, Clone)]
pub struct WeakDrmDeviceFd(std::sync::Weak<DrmDeviceFdInner>);

impl DrmDeviceFd {
    /// Downgrade to a [`WeakDrmDeviceFd`].
    pub fn downgrade(&self) -> WeakDrmDeviceFd {
        WeakDrmDeviceFd(Arc::downgrade(&self.0))
    }
}

impl WeakDrmDeviceFd {
    /// Try to upgrade back to a strong [`DrmDeviceFd`].
    pub fn upgrade(&self) -> Option<DrmDeviceFd> {
        self.0.upgrade().map(DrmDeviceFd)
    }
}
