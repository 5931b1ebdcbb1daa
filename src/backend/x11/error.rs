//! The crate-level error enum and its conversions from lower-level errors.

use crate::backend::{allocator::gbm::GbmConvertError, drm::CreateDrmNodeError};

/// Every failure this crate's core can raise, mapped at the loader boundary
/// onto an EGL error code (see the `not-available`/`device-mismatch`/... table
/// in the error handling design).
#[derive(Debug, thiserror::Error)]
pub enum X11Error {
    /// A required server extension, socket transport or capability is
    /// missing, too old, or gated behind the NV-GLX guard without the
    /// force-enable override.
    #[error("{0}")]
    NotAvailable(String),

    /// NV→NV offload was requested, or a caller-requested device was not
    /// found among the enumerated EGL devices.
    #[error("device mismatch: {0}")]
    DeviceMismatch(String),

    /// The native window is the wrong screen, an invalid XID, zero-sized, or
    /// its visual does not match the chosen config.
    #[error("bad native window: {0}")]
    BadNativeWindow(String),

    /// The native pixmap is an invalid XID, or its depth/bpp/plane count
    /// does not match the chosen config.
    #[error("bad native pixmap: {0}")]
    BadNativePixmap(String),

    /// The config lacks a required surface-type bit, or the requested
    /// format is not supported by the driver.
    #[error("bad match: {0}")]
    BadMatch(String),

    /// Allocator failure, file-descriptor exhaustion, or syncobj creation
    /// failure.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A wire round-trip returned an X protocol error.
    #[error("transient wire error: {0}")]
    TransientWire(String),

    /// `xcb_wait_for_special_event` returned null; the native window is gone.
    #[error("the X server connection or native window was terminated")]
    ServerTermination,

    /// An implicit-sync dma-buf ioctl returned `ENOTTY`/`EBADF`/`ENOSYS`; the
    /// process-wide latch has been (or should be) tripped.
    #[error("implicit sync ioctls are not supported by this kernel")]
    IoctlUnsupported,
}

impl From<x11rb::errors::ConnectError> for X11Error {
    fn from(err: x11rb::errors::ConnectError) -> Self {
        X11Error::NotAvailable(err.to_string())
    }
}

impl From<x11rb::errors::ConnectionError> for X11Error {
    fn from(err: x11rb::errors::ConnectionError) -> Self {
        X11Error::TransientWire(err.to_string())
    }
}

impl From<x11rb::errors::ReplyError> for X11Error {
    fn from(err: x11rb::errors::ReplyError) -> Self {
        X11Error::TransientWire(err.to_string())
    }
}

impl From<x11rb::errors::ReplyOrIdError> for X11Error {
    fn from(err: x11rb::errors::ReplyOrIdError) -> Self {
        X11Error::TransientWire(err.to_string())
    }
}

impl From<std::io::Error> for X11Error {
    fn from(err: std::io::Error) -> Self {
        X11Error::ResourceExhausted(err.to_string())
    }
}

impl From<rustix::io::Errno> for X11Error {
    fn from(err: rustix::io::Errno) -> Self {
        match err {
            rustix::io::Errno::NOTTY | rustix::io::Errno::BADF | rustix::io::Errno::NOSYS => {
                X11Error::IoctlUnsupported
            }
            other => X11Error::ResourceExhausted(other.to_string()),
        }
    }
}

impl From<CreateDrmNodeError> for X11Error {
    fn from(err: CreateDrmNodeError) -> Self {
        match err {
            CreateDrmNodeError::Io(err) => X11Error::ResourceExhausted(err.to_string()),
            CreateDrmNodeError::NotDrmNode => {
                X11Error::DeviceMismatch("path is not a DRM device node".into())
            }
        }
    }
}

impl From<GbmConvertError> for X11Error {
    fn from(err: GbmConvertError) -> Self {
        X11Error::ResourceExhausted(err.to_string())
    }
}

impl From<crate::backend::egl::Error> for X11Error {
    fn from(err: crate::backend::egl::Error) -> Self {
        X11Error::NotAvailable(err.to_string())
    }
}

/// An error which may occur when creating a [`WindowPresenter`](super::window::WindowPresenter).
#[derive(Debug, thiserror::Error)]
pub enum CreateWindowError {
    /// No depth fulfilling the pixel format requirements was found.
    #[error("no depth fulfilling the requirements was found")]
    NoDepth,

    /// No visual fulfilling the pixel format requirements was found.
    #[error("no visual fulfilling the requirements was found")]
    NoVisual,

    /// The config has no `WINDOW_BIT` set.
    #[error("config is not usable for window surfaces")]
    NotAWindowConfig,
}

impl From<CreateWindowError> for X11Error {
    fn from(err: CreateWindowError) -> Self {
        X11Error::BadMatch(err.to_string())
    }
}

/// An error which may occur when a required X11 extension is missing or too old.
#[derive(Debug, thiserror::Error)]
pub enum MissingExtensionError {
    /// An extension was not found.
    #[error("extension \"{name}\" was not found")]
    NotFound {
        /// The name of the required extension.
        name: &'static str,
    },

    /// An extension was present, but not at the exact/minimum version required.
    #[error(
        "extension \"{name}\" version {available_major}.{available_minor} does not satisfy the required major {required_major}, minor >= {required_minor}"
    )]
    WrongVersion {
        /// The name of the extension.
        name: &'static str,
        /// The required major version (must match exactly).
        required_major: u32,
        /// The minimum required minor version.
        required_minor: u32,
        /// The major version the server advertised.
        available_major: u32,
        /// The minor version the server advertised.
        available_minor: u32,
    },
}

impl From<MissingExtensionError> for X11Error {
    fn from(err: MissingExtensionError) -> Self {
        X11Error::NotAvailable(err.to_string())
    }
}
