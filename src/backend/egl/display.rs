//! The driver's internal EGL display for a chosen GPU device.
//!
//! [`DisplayInstance::new`](crate::backend::x11::display::DisplayInstance::new)
//! obtains one of these for the device it selects (step 6 of its
//! initialization algorithm) via `eglGetPlatformDisplayEXT(EGL_PLATFORM_DEVICE_EXT, ...)`,
//! then queries it for the dma-buf format/modifier catalog and the sync
//! extensions that drive the explicit/implicit/no-sync decision.

use std::{
    ops::Deref,
    os::unix::io::{IntoRawFd, OwnedFd},
    sync::Arc,
};

use drm_fourcc::{DrmFourcc, DrmModifier};

use super::{device::EGLDevice, ffi, ffi::EGLint, wrap_egl_call_bool, wrap_egl_call_ptr, Error};

/// Thin RAII wrapper around a raw `EGLDisplay`.
///
/// Cloned (via `Arc`) into every object created against this display
/// ([`EGLFence`](super::EGLFence), color-buffer imports). `eglTerminate` only
/// runs once the last clone is dropped, which is how a display instance can
/// outlive its external handle while a callback on another thread is still
/// executing against it (§3 of the data model).
#[derive(Debug)]
pub struct EGLDisplayHandle {
    pub(crate) handle: ffi::egl::types::EGLDisplay,
}

unsafe impl Send for EGLDisplayHandle {}
unsafe impl Sync for EGLDisplayHandle {}

impl Deref for EGLDisplayHandle {
    type Target = ffi::egl::types::EGLDisplay;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for EGLDisplayHandle {
    fn drop(&mut self) {
        unsafe {
            ffi::egl::Terminate(self.handle);
        }
    }
}

/// A `(fourcc, modifier)` pair the driver can import or render into, as
/// reported by `EGL_EXT_image_dma_buf_import_modifiers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmabufFormat {
    /// Pixel format.
    pub format: DrmFourcc,
    /// Memory layout tag.
    pub modifier: DrmModifier,
}

/// The driver's internal EGL display for one GPU device.
#[derive(Debug, Clone)]
pub struct EGLDisplay {
    pub(crate) display: Arc<EGLDisplayHandle>,
    extensions: Vec<String>,
    egl_version: (EGLint, EGLint),
    pub(crate) has_fences: bool,
    pub(crate) supports_native_fences: bool,
    render_formats: Vec<DmabufFormat>,
    texture_formats: Vec<DmabufFormat>,
}

impl EGLDisplay {
    /// Obtains and initializes the platform display for `device`.
    ///
    /// Corresponds to step 6 of [`DisplayInstance::new`][ref]: the
    /// `eglInitialize` for the GPU device chosen by device selection (§4.1.4),
    /// not for the X display connection.
    ///
    /// [ref]: crate::backend::x11::display::DisplayInstance::new
    pub fn new(device: &EGLDevice) -> Result<EGLDisplay, Error> {
        let client_extensions = ffi::make_sure_egl_is_loaded()?;
        if !client_extensions.iter().any(|s| s == "EGL_EXT_platform_base") {
            return Err(Error::EglExtensionNotSupported(&["EGL_EXT_platform_base"]));
        }

        let display = wrap_egl_call_ptr(|| unsafe {
            ffi::egl::GetPlatformDisplayEXT(
                ffi::egl::PLATFORM_DEVICE_EXT,
                device.get_device_handle() as *mut _,
                std::ptr::null(),
            )
        })
        .map_err(|_| Error::DisplayNotSupported)? as ffi::egl::types::EGLDisplay;

        let mut major = 0;
        let mut minor = 0;
        wrap_egl_call_bool(|| unsafe { ffi::egl::Initialize(display, &mut major, &mut minor) })
            .map_err(|_| Error::InitFailed)?;

        let display = Arc::new(EGLDisplayHandle { handle: display });

        let extensions = {
            let raw = wrap_egl_call_ptr(|| unsafe {
                ffi::egl::QueryString(**display, ffi::egl::EXTENSIONS as EGLint)
            })
            .map_err(|_| Error::InitFailed)?;
            unsafe { std::ffi::CStr::from_ptr(raw as *const _) }
                .to_str()
                .expect("non-UTF8 EGL extension string")
                .split_whitespace()
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>()
        };

        let has = |name: &str| extensions.iter().any(|s| s == name);

        let has_fences = has("EGL_KHR_fence_sync");
        let supports_native_fences = has_fences && has("EGL_ANDROID_native_fence_sync");

        let (render_formats, texture_formats) = if has("EGL_EXT_image_dma_buf_import_modifiers") {
            (
                query_dmabuf_formats(&display, false)?,
                query_dmabuf_formats(&display, true)?,
            )
        } else {
            (Vec::new(), Vec::new())
        };

        Ok(EGLDisplay {
            display,
            extensions,
            egl_version: (major, minor),
            has_fences,
            supports_native_fences,
            render_formats,
            texture_formats,
        })
    }

    /// Formats (and per-format modifiers) the driver can render into.
    ///
    /// Feeds §4.1 step 8 (building the format registry) and the renderable
    /// half of §3's per-format modifier split.
    pub fn dmabuf_render_formats(&self) -> &[DmabufFormat] {
        &self.render_formats
    }

    /// Formats (and per-format modifiers) the driver can import for sampling
    /// only — the external-only half of the per-format modifier split.
    pub fn dmabuf_texture_formats(&self) -> &[DmabufFormat] {
        &self.texture_formats
    }

    /// The EGL extension strings this display advertises.
    pub fn get_extensions(&self) -> Vec<String> {
        self.extensions.clone()
    }

    /// The negotiated EGL version.
    pub fn get_egl_version(&self) -> (EGLint, EGLint) {
        self.egl_version
    }

    /// A cloneable, ref-counted handle to the raw `EGLDisplay`.
    pub fn get_display_handle(&self) -> Arc<EGLDisplayHandle> {
        self.display.clone()
    }

    /// Whether the driver can import the given (format, modifier) pair,
    /// either for rendering or sampling-only.
    ///
    /// Used by [`PixmapPresenter`](crate::backend::x11::pixmap_presenter::PixmapPresenter)
    /// to validate a server-owned dma-buf before treating it as a color
    /// buffer.
    pub fn can_import_dmabuf(&self, format: DrmFourcc, modifier: DrmModifier) -> bool {
        self.render_formats
            .iter()
            .chain(self.texture_formats.iter())
            .any(|f| f.format == format && f.modifier == modifier)
    }
}

fn query_dmabuf_formats(
    display: &Arc<EGLDisplayHandle>,
    external_only: bool,
) -> Result<Vec<DmabufFormat>, Error> {
    let mut num_formats = 0;
    wrap_egl_call_bool(|| unsafe {
        ffi::egl::QueryDmaBufFormatsEXT(***display, 0, std::ptr::null_mut(), &mut num_formats)
    })
    .map_err(Error::CreationFailed)?;

    let mut fourccs = vec![0i32; num_formats as usize];
    wrap_egl_call_bool(|| unsafe {
        ffi::egl::QueryDmaBufFormatsEXT(***display, num_formats, fourccs.as_mut_ptr(), &mut num_formats)
    })
    .map_err(Error::CreationFailed)?;

    let mut out = Vec::new();
    for fourcc in fourccs {
        let Ok(fourcc) = DrmFourcc::try_from(fourcc as u32) else {
            continue;
        };

        let mut num_mods = 0;
        wrap_egl_call_bool(|| unsafe {
            ffi::egl::QueryDmaBufModifiersEXT(
                ***display,
                fourcc as i32,
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut num_mods,
            )
        })
        .map_err(Error::CreationFailed)?;

        let mut mods = vec![0u64; num_mods as usize];
        let mut external = vec![0i32; num_mods as usize];
        wrap_egl_call_bool(|| unsafe {
            ffi::egl::QueryDmaBufModifiersEXT(
                ***display,
                fourcc as i32,
                num_mods,
                mods.as_mut_ptr(),
                external.as_mut_ptr(),
                &mut num_mods,
            )
        })
        .map_err(Error::CreationFailed)?;

        for (modifier, is_external) in mods.into_iter().zip(external.into_iter()) {
            if (is_external == ffi::egl::TRUE as i32) != external_only {
                continue;
            }
            out.push(DmabufFormat {
                format: fourcc,
                modifier: DrmModifier::from(modifier),
            });
        }
    }

    Ok(out)
}

/// Duplicates a fence fd for ownership transfer across the driver boundary.
///
/// The damage callback contract (§4.10, §6) requires dup'ing a received
/// `syncfd` before retaining it past the callback's return: the driver
/// closes its own copy once the callback returns.
pub fn dup_fence_fd(fd: &OwnedFd) -> Result<OwnedFd, Error> {
    use std::os::unix::io::AsFd;
    rustix::io::fcntl_dupfd_cloexec(fd.as_fd(), 3).map_err(|_| Error::CreationFailed(super::EGLError(0)))
}

#[allow(dead_code)]
fn owned_fd_into_raw(fd: OwnedFd) -> i32 {
    fd.into_raw_fd()
}
