//! The slice of EGL this crate needs for itself.
//!
//! This is deliberately not a general-purpose EGL/GL binding: the driver
//! owns context creation, surfaces and rendering. What lives here is device
//! enumeration ([`device`]), the driver's internal platform display
//! ([`display`]), and native-fence-sync ([`fence`]) — the three things
//! [`crate::backend::x11::display::DisplayInstance`] needs during
//! initialization and [`crate::backend::x11::window`] needs for the
//! explicit/implicit sync paths.

use std::{ffi::CString, fmt};

pub mod device;
pub mod display;
mod error;
pub mod fence;
#[allow(non_camel_case_types, dead_code, unused_mut, non_upper_case_globals)]
pub mod ffi;

pub use device::EGLDevice;
pub use display::{EGLDisplay, EGLDisplayHandle};
pub use error::Error;
pub use fence::EGLFence;

/// A raw EGL error code, as returned by `eglGetError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EGLError(pub u32);

impl EGLError {
    fn current() -> Self {
        EGLError(unsafe { ffi::egl::GetError() } as u32)
    }
}

impl fmt::Display for EGLError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            ffi::egl::SUCCESS => "EGL_SUCCESS",
            ffi::egl::NOT_INITIALIZED => "EGL_NOT_INITIALIZED",
            ffi::egl::BAD_ACCESS => "EGL_BAD_ACCESS",
            ffi::egl::BAD_ALLOC => "EGL_BAD_ALLOC",
            ffi::egl::BAD_ATTRIBUTE => "EGL_BAD_ATTRIBUTE",
            ffi::egl::BAD_CONTEXT => "EGL_BAD_CONTEXT",
            ffi::egl::BAD_CONFIG => "EGL_BAD_CONFIG",
            ffi::egl::BAD_CURRENT_SURFACE => "EGL_BAD_CURRENT_SURFACE",
            ffi::egl::BAD_DISPLAY => "EGL_BAD_DISPLAY",
            ffi::egl::BAD_SURFACE => "EGL_BAD_SURFACE",
            ffi::egl::BAD_MATCH => "EGL_BAD_MATCH",
            ffi::egl::BAD_PARAMETER => "EGL_BAD_PARAMETER",
            ffi::egl::BAD_NATIVE_PIXMAP => "EGL_BAD_NATIVE_PIXMAP",
            ffi::egl::BAD_NATIVE_WINDOW => "EGL_BAD_NATIVE_WINDOW",
            ffi::egl::CONTEXT_LOST => "EGL_CONTEXT_LOST",
            _ => "unknown EGL error",
        };
        write!(f, "{} (0x{:x})", name, self.0)
    }
}

/// Returns the address of an EGL/GL function, independent of any display.
pub fn get_proc_address(symbol: &str) -> *const std::ffi::c_void {
    let addr = CString::new(symbol.as_bytes()).unwrap();
    unsafe { ffi::egl::GetProcAddress(addr.as_ptr()) as *const _ }
}

/// Runs `f`, mapping an `EGL_FALSE`/0 return into the current `eglGetError()`.
pub(crate) fn wrap_egl_call_bool<F: FnOnce() -> ffi::egl::types::EGLBoolean>(
    f: F,
) -> Result<(), EGLError> {
    ffi::make_sure_egl_is_loaded().ok();
    let result = f();
    if result == ffi::egl::TRUE {
        Ok(())
    } else {
        Err(EGLError::current())
    }
}

/// Runs `f`, mapping a null pointer return into the current `eglGetError()`.
pub(crate) fn wrap_egl_call_ptr<T, F: FnOnce() -> *const T>(f: F) -> Result<*const T, EGLError> {
    let result = f();
    if result.is_null() {
        Err(EGLError::current())
    } else {
        Ok(result)
    }
}

/// Runs `f`, mapping a return equal to `failure` into the current `eglGetError()`.
pub(crate) fn wrap_egl_call<T: PartialEq, F: FnOnce() -> T>(f: F, failure: T) -> Result<T, EGLError> {
    let result = f();
    if result == failure {
        Err(EGLError::current())
    } else {
        Ok(result)
    }
}
