//! Raw EGL bindings used by this crate.
//!
//! Only the handful of entry points the bridge itself calls are generated
//! (see `build.rs`): device enumeration, platform-display creation, dma-buf
//! import modifiers and `EGL_ANDROID_native_fence_sync`. Everything GL/GLES
//! (contexts, surfaces, draw calls) belongs to the driver, not here.

#![allow(missing_docs)]

use libc::c_void;

pub type khronos_utime_nanoseconds_t = khronos_uint64_t;
pub type khronos_uint64_t = u64;
pub type khronos_ssize_t = isize;
pub type EGLint = i32;
pub type EGLNativeDisplayType = *const c_void;
pub type EGLNativePixmapType = *const c_void;
pub type EGLNativeWindowType = *const c_void;

#[allow(clippy::all)]
pub mod egl {
    use super::*;
    use std::sync::Once;

    lazy_static::lazy_static! {
        pub static ref LIB: libloading::Library =
            unsafe { libloading::Library::new("libEGL.so.1") }.expect("failed to load libEGL.so.1");
    }

    pub static LOAD: Once = Once::new();

    include!(concat!(env!("OUT_DIR"), "/egl_bindings.rs"));
}

/// Loads `libEGL.so.1` (once) and returns the space-separated
/// `EGL_EXTENSIONS` client string, split into owned tokens.
pub fn make_sure_egl_is_loaded() -> Result<Vec<String>, super::Error> {
    use std::ffi::{CStr, CString};

    egl::LOAD.call_once(|| unsafe {
        egl::load_with(|sym| {
            let name = CString::new(sym).unwrap();
            match egl::LIB.get::<*mut c_void>(name.as_bytes()) {
                Ok(x) => *x as *const _,
                Err(_) => std::ptr::null(),
            }
        });
    });

    let raw = unsafe { egl::QueryString(egl::NO_DISPLAY, egl::EXTENSIONS as EGLint) };
    if raw.is_null() {
        return Ok(Vec::new());
    }

    // SAFETY: `eglQueryString` with `EGL_NO_DISPLAY` and `EGL_EXTENSIONS` returns
    // a static, NUL-terminated, ASCII string naming the client extensions.
    let list = unsafe { CStr::from_ptr(raw) }
        .to_str()
        .expect("non-UTF8 EGL extension string")
        .split_whitespace()
        .map(ToOwned::to_owned)
        .collect();
    Ok(list)
}
