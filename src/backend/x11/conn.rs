//! The optional Xlib connection variant and its close-notification hook
//! (spec §1 "optionally via an Xlib connection", §6 "the Xlib
//! close-notification hook", §9 "Process-wide flags").
//!
//! [`DisplayInstance`](super::display::DisplayInstance) itself always talks
//! the wire protocol through a pure-Rust [`x11rb::rust_connection::RustConnection`]
//! it opens or is handed a `DISPLAY` name for (see [`super::display`]). This
//! module exists for the loader glue path where the caller's
//! `native_display` is an `Xlib::Display*` rather than null or an XCB
//! connection: the platform needs to know when *that* Xlib connection goes
//! away, since the caller may close it out from under an in-flight surface.
//!
//! Real NVIDIA-style drivers hook this via the private `XESetCloseDisplay`
//! extension callback. That entry point isn't part of any public Xlib
//! binding (it takes an `XExtCodes*` obtained through `XAddExtension`, which
//! `x11-dl` doesn't expose either), so this crate instead owns the
//! `Display*` for its lifetime and treats `Drop` as the close notification:
//! every caller interested in "this Xlib connection is going away" registers
//! through [`register_close_callback`], and [`XlibConnection::drop`] runs
//! them before calling `XCloseDisplay`.
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use x11_dl::xlib::{Display, Xlib};
use x11_dl::xlib_xcb::{XEventQueueOwner, Xlib_xcb};

use super::error::X11Error;

/// Process-wide table of close-notification callbacks, keyed by the raw
/// `Display*` address (spec §9 "the list of closed-display callbacks
/// (Xlib-only)" — module-scoped state with explicit registration instead of
/// a free global).
static CLOSE_CALLBACKS: Lazy<Mutex<HashMap<usize, Vec<Box<dyn FnMut() + Send>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Registers `callback` to run once, just before `display`'s underlying
/// Xlib connection is closed.
///
/// Used by the loader glue to tear down a [`WindowPresenter`](super::window::WindowPresenter)
/// cleanly if the caller closes its own Xlib `Display` while a surface is
/// still alive, rather than leaving the presenter to discover the
/// connection is gone the next time it round-trips (spec §7
/// `server-termination`).
pub fn register_close_callback(display: &XlibConnection, callback: impl FnMut() + Send + 'static) {
    let key = display.raw.as_ptr() as usize;
    CLOSE_CALLBACKS
        .lock()
        .unwrap()
        .entry(key)
        .or_default()
        .push(Box::new(callback));
}

/// A connection opened through Xlib rather than XCB directly, for callers
/// that hand this crate a native `Display*` (spec §1 "optionally via an
/// Xlib connection").
///
/// Event-queue ownership is handed to XCB immediately after opening so the
/// rest of this crate can still dispatch events the normal XCB way; only the
/// close-notification hook and the underlying fd are this module's concern.
pub struct XlibConnection {
    raw: NonNull<Display>,
    xlib: Xlib,
}

// Xlib is thread-safe once `XInitThreads` has run, which `XlibConnection::open` does.
unsafe impl Send for XlibConnection {}
unsafe impl Sync for XlibConnection {}

impl XlibConnection {
    /// Opens `display_name` (or `$DISPLAY` if `None`) through Xlib, hands
    /// event-queue ownership to XCB, and returns the connection along with
    /// the default screen number Xlib resolved.
    pub fn open(display_name: Option<&str>) -> Result<(XlibConnection, usize), X11Error> {
        let xlib = Xlib::open().map_err(|err| X11Error::NotAvailable(err.to_string()))?;
        let xlib_xcb = Xlib_xcb::open().map_err(|err| X11Error::NotAvailable(err.to_string()))?;

        unsafe { (xlib.XInitThreads)() };

        let name_cstr = display_name.map(|n| std::ffi::CString::new(n).unwrap());
        let name_ptr = name_cstr.as_ref().map(|c| c.as_ptr()).unwrap_or(std::ptr::null());

        let raw = unsafe { (xlib.XOpenDisplay)(name_ptr) };
        let raw = NonNull::new(raw)
            .ok_or_else(|| X11Error::NotAvailable("XOpenDisplay returned NULL".into()))?;

        let screen = unsafe { (xlib.XDefaultScreen)(raw.as_ptr()) };

        unsafe {
            (xlib_xcb.XSetEventQueueOwner)(raw.as_ptr(), XEventQueueOwner::XCBOwnsEventQueue);
        }

        Ok((XlibConnection { raw, xlib }, screen as usize))
    }

    /// The underlying `xcb_connection_t*`, for handing to an XCB-based
    /// transport. Borrowing this out does not transfer ownership: the
    /// connection is still closed by this struct's `Drop`.
    pub fn xcb_connection_ptr(&self) -> *mut x11_dl::xlib_xcb::xcb_connection_t {
        let xlib_xcb = Xlib_xcb::open().expect("already opened successfully in XlibConnection::open");
        unsafe { (xlib_xcb.XGetXCBConnection)(self.raw.as_ptr()) }
    }

    /// The raw `Display*`, for passing to `eglGetPlatformDisplay` with
    /// `EGL_PLATFORM_X11_EXT` in the loader glue.
    pub fn raw(&self) -> *mut Display {
        self.raw.as_ptr()
    }
}

impl Drop for XlibConnection {
    fn drop(&mut self) {
        let key = self.raw.as_ptr() as usize;
        if let Some(mut callbacks) = CLOSE_CALLBACKS.lock().unwrap().remove(&key) {
            for callback in callbacks.iter_mut() {
                callback();
            }
        }
        unsafe {
            (self.xlib.XCloseDisplay)(self.raw.as_ptr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn close_callback_table_is_keyed_by_pointer_and_drained_once() {
        // Exercise the table directly, without an actual X server: insert a
        // callback under a synthetic key and confirm `remove` drains it.
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        CLOSE_CALLBACKS
            .lock()
            .unwrap()
            .entry(0xdead_beef)
            .or_default()
            .push(Box::new(move || fired2.store(true, Ordering::SeqCst)));

        let mut callbacks = CLOSE_CALLBACKS.lock().unwrap().remove(&0xdead_beef).unwrap();
        for cb in callbacks.iter_mut() {
            cb();
        }
        assert!(fired.load(Ordering::SeqCst));
        assert!(!CLOSE_CALLBACKS.lock().unwrap().contains_key(&0xdead_beef));
    }
}
