//! The driver interface (spec §6 "Driver interface (the callback contract)")
//! and the loader/entrypoint glue (spec §4 table, §6 "Entry-point glue (out
//! of core)").
//!
//! This module is intentionally thin: `eglGetPlatformDisplay`,
//! `eglInitialize`/`Terminate`, `eglCreate{Window,Pixmap}Surface`,
//! `eglSwapBuffers`/`WithDamage`, `eglSwapInterval` and `eglChooseConfig`
//! live outside the core (spec §1 "Surrounding concerns... §6 gives only the
//! interfaces they expose") and forward into
//! [`DisplayInstance`](super::display::DisplayInstance),
//! [`WindowPresenter`](super::window::WindowPresenter) and
//! [`PixmapPresenter`](super::pixmap_presenter::PixmapPresenter).
//!
//! What *is* in scope here is the capability split the design notes call
//! for: two marker traits so the type system, not a code review, rejects a
//! callback that reaches for a driver entry point it isn't allowed to call
//! (spec §9 "Deep callback-driven locking").

use std::os::unix::io::OwnedFd;
use std::path::PathBuf;

use crate::backend::allocator::dmabuf::Dmabuf;

/// Opaque driver color-buffer handle, as returned by
/// [`DriverColorBufferOps::alloc`]/`import`.
pub type DriverColorBuffer = usize;

/// Opaque driver surface handle, as returned when a
/// [`DriverSurfaceOps::create_window_surface`]/`create_pixmap_surface` call
/// succeeds.
pub type DriverSurfaceHandle = usize;

/// The subset of driver entry points safe to call from the update/damage
/// callbacks, which run on the driver's own thread while it holds its
/// internal window-system lock (spec §4.10, §9).
///
/// Every method here must not re-enter a path that would re-acquire that
/// lock. The driver documents this set explicitly; this trait is this
/// crate's half of that contract — callback code is statically limited to
/// these methods and cannot reach [`RequiresCurrentSurface`].
pub trait SafeInCallback {
    /// Error type for every operation below.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Imports a dma-buf as a driver color buffer (pixmap presenter import,
    /// PRIME intermediate import).
    fn import_color_buffer(&self, dmabuf: &Dmabuf) -> Result<DriverColorBuffer, Self::Error>;
    /// Allocates a driver-owned color buffer of the given size/format.
    fn alloc_color_buffer(
        &self,
        width: u32,
        height: u32,
        fourcc: drm_fourcc::DrmFourcc,
    ) -> Result<DriverColorBuffer, Self::Error>;
    /// Frees a color buffer previously imported or allocated.
    fn free_color_buffer(&self, buffer: DriverColorBuffer) -> Result<(), Self::Error>;
    /// Exports a color buffer's backing memory as a dma-buf (used only for
    /// PRIME intermediates, spec §3 "Color buffer").
    fn export_color_buffer(&self, buffer: DriverColorBuffer) -> Result<Dmabuf, Self::Error>;
    /// Blits `src` into `dst` (the PRIME blit path, spec §4.6 step 2).
    fn copy_color_buffer(&self, src: DriverColorBuffer, dst: DriverColorBuffer) -> Result<(), Self::Error>;
}

/// The subset of driver entry points that require the calling thread's
/// *current* surface — i.e. they are only reachable from `eglSwapBuffers`
/// and friends, never from a callback (spec §5 "Deadlock avoidance").
pub trait RequiresCurrentSurface: SafeInCallback {
    /// Replaces a surface's front/back/prime color-buffer attachments.
    fn set_color_buffers(
        &self,
        surface: DriverSurfaceHandle,
        front: DriverColorBuffer,
        back: DriverColorBuffer,
        prime: Option<DriverColorBuffer>,
    ) -> Result<(), Self::Error>;
    /// Creates a native fence sync object and immediately exports it as a
    /// fence fd (spec §4.8 "Explicit" row).
    fn create_native_fence_fd(&self) -> Result<OwnedFd, Self::Error>;
    /// Blocks the driver's client API context until `fence` is signalled
    /// (the CPU fallback in spec §4.6 step 4, "no-sync" row of §4.8).
    fn wait_fence(&self, fence: &OwnedFd) -> Result<(), Self::Error>;
    /// `glFinish`-equivalent full client API synchronization (spec §4.8
    /// "None" row).
    fn finish(&self) -> Result<(), Self::Error>;
}

/// Parameters the driver passes when creating a surface (spec §6 "create
/// surface with buffer attachments and two callback pointers").
pub struct SurfaceCreateParams<P> {
    /// Opaque parameter handed back verbatim to both callbacks.
    pub callback_param: P,
    /// Invoked before the driver starts using the surface (spec §4.10
    /// "Update").
    pub update: fn(&P),
    /// Invoked after the driver flushes rendering to the front/single
    /// buffer (spec §4.10 "Damage"). Receives a borrowed fence fd the
    /// implementation must dup if it wants to retain it past return (spec
    /// §6 "must take ownership of `syncfd` by dup-ing if retained").
    pub damage: fn(&P, Option<&OwnedFd>),
}

/// Caller-facing parameters for the loader's device-selection policy (spec
/// §6 "Environment variables consumed by the glue").
#[derive(Debug, Clone, Default)]
pub struct LoaderOptions {
    /// `__NV_PRIME_RENDER_OFFLOAD` — any non-empty value enables offload.
    pub allow_offload: bool,
    /// `__NV_PRIME_RENDER_OFFLOAD_PROVIDER` — a device node path.
    pub requested_device: Option<PathBuf>,
}

impl LoaderOptions {
    /// Reads the environment variables the loader glue consumes (spec §6).
    /// Does not touch `DISPLAY` — that is
    /// [`DisplayOptions`](super::display::DisplayOptions)'s responsibility,
    /// since a caller-provided native display pointer wins over it.
    pub fn from_env() -> LoaderOptions {
        let allow_offload = std::env::var_os("__NV_PRIME_RENDER_OFFLOAD")
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        let requested_device = std::env::var_os("__NV_PRIME_RENDER_OFFLOAD_PROVIDER")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        LoaderOptions {
            allow_offload,
            requested_device,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_options_default_to_no_offload() {
        // SAFETY: single-threaded test process, no other test reads/writes
        // these particular variables concurrently.
        unsafe {
            std::env::remove_var("__NV_PRIME_RENDER_OFFLOAD");
            std::env::remove_var("__NV_PRIME_RENDER_OFFLOAD_PROVIDER");
        }
        let opts = LoaderOptions::from_env();
        assert!(!opts.allow_offload);
        assert!(opts.requested_device.is_none());
    }

    #[test]
    fn loader_options_reads_offload_provider() {
        // SAFETY: see above.
        unsafe {
            std::env::set_var("__NV_PRIME_RENDER_OFFLOAD", "1");
            std::env::set_var("__NV_PRIME_RENDER_OFFLOAD_PROVIDER", "/dev/dri/renderD129");
        }
        let opts = LoaderOptions::from_env();
        assert!(opts.allow_offload);
        assert_eq!(
            opts.requested_device,
            Some(PathBuf::from("/dev/dri/renderD129"))
        );
        // SAFETY: see above.
        unsafe {
            std::env::remove_var("__NV_PRIME_RENDER_OFFLOAD");
            std::env::remove_var("__NV_PRIME_RENDER_OFFLOAD_PROVIDER");
        }
    }
}
