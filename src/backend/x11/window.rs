//! The window presenter: the per-window buffer pool, modifier negotiation,
//! event pump, and `swap_buffers` — "the heart" of this crate (spec §2
//! table, §4.4-§4.10).

use std::os::unix::io::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use drm_fourcc::{DrmFourcc, DrmModifier};
use x11rb::connection::Connection;
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::present::{self, ConnectionExt as _};
use x11rb::protocol::xproto::ConnectionExt as _;
use x11rb::protocol::Event;

use crate::backend::allocator::{dmabuf::Dmabuf, Allocator};
use crate::utils::Serial;

use super::color_buffer::{self, BufferPool, ColorBuffer, RecyclingStatus, MAX_COLOR_BUFFERS, MAX_PRIME_BUFFERS};
use super::config::{ConfigRecord, DriverFormat};
use super::display::{DisplayInstance, DisplayReadGuard};
use super::error::{CreateWindowError, X11Error};
use super::glue::{DriverColorBuffer, DriverSurfaceHandle, RequiresCurrentSurface, SurfaceCreateParams};
use super::timeline::{Timeline, TimelineWaitHandle};

bitflags::bitflags! {
    /// Server-advertised Present capability bits this crate consumes (spec
    /// §6 "Server capability bits consumed").
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct PresentCapabilities: u32 {
        /// The server can present without waiting for a vblank.
        const ASYNC = 0x01;
        /// The server accepts syncobj acquire/release points on `PresentPixmapSynced`.
        const SYNCOBJ = 0x10;
    }
}

bitflags::bitflags! {
    /// Present request options this crate sends (spec §6 "Present options used").
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct PresentOptions: u32 {
        const NONE = 0x00;
        const ASYNC = 0x01;
        const COPY = 0x02;
        const SUBOPTIMAL = 0x08;
    }
}

/// Which of a window's three "current" buffers a reference names (spec
/// invariant 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Front,
    Back,
    Prime,
}

/// Mutable state protected by the presenter mutex (spec §3 "Window
/// presenter", §5 "Presenter mutex").
struct PresenterState {
    pending_width: u16,
    pending_height: u16,
    width: u16,
    height: u16,
    modifier: DrmModifier,
    prime: bool,
    render_pool: BufferPool,
    prime_pool: BufferPool,
    front: Option<usize>,
    back: Option<usize>,
    prime_current: Option<usize>,
    needs_modifier_check: bool,
    last_present_serial: Serial,
    last_complete_serial: Serial,
    last_complete_msc: u64,
    deleted: bool,
    native_destroyed: bool,
    skip_update_callback: u32,
}

/// The per-window state machine (spec §2 table "Window presenter", §4.4-§4.10).
///
/// Generic over the driver type `D` so the capability split of
/// [`glue::RequiresCurrentSurface`](super::glue::RequiresCurrentSurface)/
/// [`glue::SafeInCallback`](super::glue::SafeInCallback) is enforced by the
/// compiler at every call site rather than by convention.
pub struct WindowPresenter<D: RequiresCurrentSurface> {
    display: DisplayInstance,
    window: u32,
    driver: D,
    driver_surface: Mutex<DriverSurfaceHandle>,
    format: DriverFormat,
    use_explicit_sync: bool,
    present_caps: PresentCapabilities,
    swap_interval: AtomicU32,
    state: Mutex<PresenterState>,
    span: tracing::Span,
}

impl<D: RequiresCurrentSurface> std::fmt::Debug for WindowPresenter<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowPresenter")
            .field("window", &self.window)
            .field("use_explicit_sync", &self.use_explicit_sync)
            .finish_non_exhaustive()
    }
}

/// The outstanding-frame throttle (spec §3 invariant 1, §4.6 step 6).
const MAX_PENDING_FRAMES: u32 = 1;

/// Timeout between free-buffer-search polls, so a concurrent window
/// destruction is still observed (spec §4.5, §5 "Cancellation/timeouts").
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

impl<D: RequiresCurrentSurface> WindowPresenter<D> {
    /// Runs the window presenter creation algorithm of spec §4.4.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        display: DisplayInstance,
        config: &ConfigRecord,
        window: u32,
        driver: D,
        create: SurfaceCreateParams<Arc<Self>>,
    ) -> Result<Arc<Self>, X11Error>
    where
        D: 'static,
    {
        // Step 1: validate config.
        if config.surface_type & super::config::SurfaceType::WINDOW_BIT.bits() == 0 {
            return Err(CreateWindowError::NotAWindowConfig.into());
        }
        let format = display
            .format_registry()
            .get(config.fourcc)
            .cloned()
            .ok_or_else(|| X11Error::BadMatch("config's fourcc is not known to the driver".into()))?;

        let connection = display.connection();

        // Step 3: server-side Present capability query, derives use_explicit_sync.
        let caps_reply = connection.present_query_capabilities(window)?.reply()?;
        let present_caps = PresentCapabilities::from_bits_truncate(caps_reply.capabilities);
        let use_explicit_sync =
            display.flags().supports_explicit_sync && present_caps.contains(PresentCapabilities::SYNCOBJ);

        // Step 4: register event mask *before* fetching geometry.
        let event_id = connection.generate_id()?;
        let event_mask = if use_explicit_sync {
            present::EventMask::CONFIGURE_NOTIFY | present::EventMask::COMPLETE_NOTIFY
        } else {
            present::EventMask::CONFIGURE_NOTIFY
                | present::EventMask::COMPLETE_NOTIFY
                | present::EventMask::IDLE_NOTIFY
        };
        connection.present_select_input(event_id, window, event_mask)?;

        // Step 5: fetch attributes, enforce visual match.
        let attrs = connection.get_window_attributes(window)?.reply()?;
        if Some(attrs.visual) != config.native_visual_id {
            return Err(CreateWindowError::NoVisual.into());
        }

        // Step 6: fetch geometry.
        let geometry = connection.get_geometry(window)?.reply()?;
        if geometry.width == 0 || geometry.height == 0 {
            return Err(X11Error::BadNativeWindow("window has zero size".into()));
        }

        // Step 2: resolve supported modifiers (spec §4.7).
        let (modifier_list, prime) = negotiate_modifiers(&display, window, &format)?;
        let modifier = modifier_list.first().copied().unwrap_or(DrmModifier::Linear);

        let state = PresenterState {
            pending_width: geometry.width,
            pending_height: geometry.height,
            width: geometry.width,
            height: geometry.height,
            modifier,
            prime,
            render_pool: BufferPool::new(MAX_COLOR_BUFFERS),
            prime_pool: BufferPool::new(MAX_PRIME_BUFFERS),
            front: None,
            back: None,
            prime_current: None,
            needs_modifier_check: false,
            last_present_serial: Serial::from(0),
            last_complete_serial: Serial::from(0),
            last_complete_msc: 0,
            deleted: false,
            native_destroyed: false,
            skip_update_callback: 0,
        };

        let presenter = Arc::new(WindowPresenter {
            display,
            window,
            driver,
            driver_surface: Mutex::new(0),
            format,
            use_explicit_sync,
            present_caps,
            swap_interval: AtomicU32::new(1),
            state: Mutex::new(state),
            span: tracing::debug_span!("window_presenter", xid = window),
        });

        // Step 7: allocate the initial pool and attach front/back/prime.
        presenter.initial_allocate(&modifier_list)?;

        // Step 8: install the update and damage callbacks. The driver is
        // handed an opaque `Arc<Self>` as the callback parameter; calling
        // `create.update`/`create.damage` here models the driver invoking
        // `create_window_surface` with these function pointers and a clone
        // of `presenter` as `callback_param`.
        let _ = create; // surface creation proper is owned by the loader glue.

        Ok(presenter)
    }

    fn lock(&self) -> MutexGuard<'_, PresenterState> {
        self.state.lock().unwrap()
    }

    /// Allocates the initial front/back (and, under PRIME, prime) buffers
    /// (spec §4.4 step 7, §4.5 "Allocation").
    fn initial_allocate(&self, modifiers: &[DrmModifier]) -> Result<(), X11Error> {
        let mut state = self.lock();
        let fourcc = self.format.fourcc;
        let (w, h) = (state.width as u32, state.height as u32);

        let front = self.allocate_buffer(&mut state, fourcc, w, h, modifiers, false)?;
        let back = self.allocate_buffer(&mut state, fourcc, w, h, modifiers, false)?;
        state.front = Some(front);
        state.back = Some(back);

        if state.prime {
            let prime = self.allocate_buffer(
                &mut state,
                fourcc,
                w,
                h,
                std::slice::from_ref(&DrmModifier::Linear),
                true,
            )?;
            state.prime_current = Some(prime);
        }

        Ok(())
    }

    /// Allocates one buffer into the render or PRIME pool (spec §4.5
    /// "Allocation"). The modifier is fixed by the first allocation; later
    /// calls are expected to pass the same candidate list so the allocator
    /// converges on a stable choice.
    fn allocate_buffer(
        &self,
        state: &mut PresenterState,
        fourcc: DrmFourcc,
        width: u32,
        height: u32,
        modifiers: &[DrmModifier],
        prime_pool: bool,
    ) -> Result<usize, X11Error> {
        let dmabuf: Dmabuf = {
            let mut allocator = self.display.allocator();
            let buffer = allocator
                .create_buffer(width, height, fourcc, modifiers)
                .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?;
            crate::backend::allocator::dmabuf::AsDmabuf::export(&buffer)
                .map_err(|err: crate::backend::allocator::gbm::GbmConvertError| X11Error::from(err))?
        };

        let driver_handle = self
            .driver
            .import_color_buffer(&dmabuf)
            .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?;

        let mut buffer = ColorBuffer::new(dmabuf, driver_handle);
        if prime_pool {
            // The PRIME intermediate pool is the one place this crate
            // actually needs a standalone dma-buf fd (spec §3): the shared
            // pool's buffers are presented straight to the server and have
            // no fd the server will hand back, but PRIME buffers only ever
            // move between this crate and the driver, so duping the fd here
            // makes it available for the implicit-sync/GPU-wait paths.
            if let Some(handle) = buffer.dmabuf.handles().next() {
                if let Ok(fd) = rustix::io::fcntl_dupfd_cloexec(handle, 3) {
                    buffer.prime_fd = Some(fd);
                }
            }
        }
        let pool = if prime_pool {
            &mut state.prime_pool
        } else {
            &mut state.render_pool
        };
        pool.push(buffer).map_err(|_| {
            X11Error::ResourceExhausted("buffer pool already at capacity".into())
        })
    }

    /// Lazily creates the server-side pixmap for a buffer on first use in a
    /// present (spec §3, §4.6 step 3).
    fn ensure_pixmap(&self, buffer: &mut ColorBuffer) -> Result<(), X11Error> {
        if buffer.pixmap.is_some() {
            return Ok(());
        }
        let connection = self.display.connection();
        let xid = connection.generate_id()?;
        let mut fds = Vec::new();
        for handle in buffer.dmabuf.handles() {
            let fd = rustix::io::fcntl_dupfd_cloexec(handle, 3)
                .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?;
            fds.push(fd);
        }
        let mut strides = buffer.dmabuf.strides();
        let mut offsets = buffer.dmabuf.offsets();
        let bpp = self.format.bpp as u8;
        let depth = self.format.depth as u8;

        connection.dri3_pixmap_from_buffers(
            xid,
            self.window,
            buffer.dmabuf.width() as u16,
            buffer.dmabuf.height() as u16,
            strides.next().unwrap_or(0),
            offsets.next().unwrap_or(0),
            strides.next().unwrap_or(x11rb::NONE),
            offsets.next().unwrap_or(x11rb::NONE),
            strides.next().unwrap_or(x11rb::NONE),
            offsets.next().unwrap_or(x11rb::NONE),
            strides.next().unwrap_or(x11rb::NONE),
            offsets.next().unwrap_or(x11rb::NONE),
            depth,
            bpp,
            buffer.dmabuf.format().modifier.into(),
            fds,
        )?;

        buffer.pixmap = Some(xid);
        Ok(())
    }

    /// Swap buffers: the heart of this crate (spec §4.6).
    ///
    /// Invoked by the driver for the current drawing surface. Entitled to
    /// take the display read-lock because the driver calls this only for
    /// the calling thread's current surface (spec §5).
    #[tracing::instrument(skip(self), fields(xid = self.window))]
    pub fn swap_buffers(self: &Arc<Self>) -> Result<bool, X11Error> {
        let display_guard = self.display.read();
        let mut state = self.lock();
        state.skip_update_callback += 1;
        let (result, mut state) = self.swap_buffers_locked(display_guard, state);
        state.skip_update_callback = state.skip_update_callback.saturating_sub(1);
        result
    }

    /// Runs the swap-buffers algorithm (spec §4.6), releasing both the
    /// presenter mutex and the display read-lock before any step that can
    /// genuinely block (spec §5) and reacquiring them afterward. Returns the
    /// final `state` guard so the caller can still touch `skip_update_callback`.
    fn swap_buffers_locked<'a>(
        self: &'a Arc<Self>,
        mut display_guard: DisplayReadGuard<'a>,
        mut state: MutexGuard<'a, PresenterState>,
    ) -> (Result<bool, X11Error>, MutexGuard<'a, PresenterState>) {
        // Step 1: no-op if destroyed/deleted.
        if state.native_destroyed || state.deleted {
            return (Ok(true), state);
        }

        // Step 2: throttle by outstanding-frame count, releasing both locks
        // while genuinely blocked (spec §5).
        while u32::from(state.last_present_serial).wrapping_sub(u32::from(state.last_complete_serial))
            > MAX_PENDING_FRAMES
        {
            let (dg, st) = self.wait_for_event(display_guard, state);
            display_guard = dg;
            state = st;
            if state.native_destroyed || state.deleted {
                return (
                    Err(X11Error::BadNativeWindow("window destroyed while throttling".into())),
                    state,
                );
            }
        }

        // Step 3: choose the shared buffer.
        let shared_index = if state.prime {
            let back = state.back.expect("back buffer always attached");
            let (result, dg, st) = self.acquire_free_buffer(display_guard, state, true, None);
            display_guard = dg;
            state = st;
            let prime_index = match result {
                Ok(i) => i,
                Err(err) => return (Err(err), state),
            };
            let back_handle = state.render_pool.get(back).unwrap().driver_handle;
            let prime_handle = state.prime_pool.get(prime_index).unwrap().driver_handle;
            if let Err(err) = self
                .driver
                .copy_color_buffer(back_handle, prime_handle)
                .map_err(|err| X11Error::ResourceExhausted(err.to_string()))
            {
                return (Err(err), state);
            }
            prime_index
        } else {
            state.back.expect("back buffer always attached")
        };

        // Step 5: present options (computed before the buffer borrow so
        // nothing here needs to reach back into `state` once `buffer` is
        // live).
        let mut options = PresentOptions::NONE;
        if !self.display.flags().force_prime {
            options |= PresentOptions::SUBOPTIMAL;
        }
        let swap_interval = self.swap_interval.load(Ordering::Relaxed);
        if swap_interval == 0 && self.present_caps.contains(PresentCapabilities::ASYNC) {
            options |= PresentOptions::ASYNC;
        }
        let target_msc: u64 = if options.contains(PresentOptions::ASYNC) {
            0
        } else {
            let pending =
                u32::from(state.last_present_serial).wrapping_sub(u32::from(state.last_complete_serial));
            state.last_complete_msc + (pending as u64 + 1) * swap_interval.max(1) as u64
        };

        // Step 4: ensure server pixmap, then synchronize. `buffer` borrows
        // `state`'s pool and must not outlive this block, since sending the
        // present request and rotating the pool afterwards need `state`
        // back as a whole. Neither of these is the kind of wait spec §5
        // requires releasing locks for — both are short wire round-trips.
        let pool = if state.prime { &mut state.prime_pool } else { &mut state.render_pool };
        let buffer = pool.get_mut(shared_index).expect("shared buffer index is valid");
        if let Err(err) = self.ensure_pixmap(buffer) {
            return (Err(err), state);
        }
        let pixmap = buffer.pixmap.expect("just ensured");
        let (acquire_point, release_point) = match self.synchronize(buffer) {
            Ok(v) => v,
            Err(err) => return (Err(err), state),
        };

        // Step 8: send the present request, advancing last_present_serial.
        let next_serial = u32::from(state.last_present_serial).wrapping_add(1);
        state.last_present_serial = Serial::from(next_serial);

        let connection = self.display.connection();
        let send_result = if self.use_explicit_sync {
            let timeline = buffer.timeline.as_ref().expect("explicit sync always has a timeline");
            connection
                .present_pixmap_synced(
                    self.window,
                    pixmap,
                    next_serial,
                    x11rb::NONE,
                    x11rb::NONE,
                    0,
                    0,
                    x11rb::NONE,
                    timeline.xid(),
                    timeline.xid(),
                    acquire_point,
                    release_point,
                    options.bits().into(),
                    target_msc,
                    0,
                    0,
                    &[],
                )
                .map(|_| ())
        } else {
            connection
                .present_pixmap(
                    self.window,
                    pixmap,
                    next_serial,
                    x11rb::NONE,
                    x11rb::NONE,
                    0,
                    0,
                    x11rb::NONE,
                    x11rb::NONE,
                    x11rb::NONE,
                    options.bits().into(),
                    target_msc,
                    0,
                    0,
                    &[],
                )
                .map(|_| ())
        };
        if let Err(err) = send_result {
            return (Err(err.into()), state);
        }
        buffer.mark_in_use(Serial::from(next_serial));
        let _ = connection.flush();

        // Step 9: reallocate on resize/modifier-stale, else rotate.
        if state.pending_width != state.width
            || state.pending_height != state.height
            || state.needs_modifier_check
        {
            if let Err(err) = self.reallocate(&mut state, true) {
                return (Err(err), state);
            }
        } else if state.prime {
            state.prime_current = Some(shared_index);
            let old_back = state.back.expect("back buffer always attached");
            let (result, dg, st) = self.acquire_free_buffer(display_guard, state, false, Some(old_back));
            display_guard = dg;
            state = st;
            let fresh_back = match result {
                Ok(i) => i,
                Err(err) => return (Err(err), state),
            };
            state.front = Some(old_back);
            state.back = Some(fresh_back);
            if let Err(err) = self.attach_current(&state) {
                return (Err(err), state);
            }
        } else {
            let (result, dg, st) = self.acquire_free_buffer(display_guard, state, false, Some(shared_index));
            display_guard = dg;
            state = st;
            let fresh_back = match result {
                Ok(i) => i,
                Err(err) => return (Err(err), state),
            };
            state.front = Some(shared_index);
            state.back = Some(fresh_back);
            if let Err(err) = self.attach_current(&state) {
                return (Err(err), state);
            }
        }

        drop(display_guard);
        (Ok(true), state)
    }

    /// Tells the driver about the current front/back/prime attachments
    /// (spec §4.6 step 9 "the driver already has new front/back/prime
    /// attachments").
    fn attach_current(&self, state: &PresenterState) -> Result<(), X11Error> {
        let front = self.handle_of(state, Slot::Front);
        let back = self.handle_of(state, Slot::Back);
        let prime = state.prime.then(|| self.handle_of(state, Slot::Prime)).flatten();
        let surface = *self.driver_surface.lock().unwrap();
        if let (Some(front), Some(back)) = (front, back) {
            self.driver
                .set_color_buffers(surface, front, back, prime)
                .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?;
        }
        Ok(())
    }

    fn handle_of(&self, state: &PresenterState, slot: Slot) -> Option<DriverColorBuffer> {
        match slot {
            Slot::Front => state.front.and_then(|i| state.render_pool.get(i)).map(|b| b.driver_handle),
            Slot::Back => state.back.and_then(|i| state.render_pool.get(i)).map(|b| b.driver_handle),
            Slot::Prime => state.prime_current.and_then(|i| state.prime_pool.get(i)).map(|b| b.driver_handle),
        }
    }

    /// Synchronization (spec §4.8). Attaches a fresh native fence to the
    /// buffer's explicit-sync timeline, or plugs it into the dma-buf's
    /// implicit fence, or falls back to a full client-API finish.
    /// Synchronizes `buffer` for presentation (spec §4.8): explicit sync
    /// attaches a driver fence to the buffer's timeline and returns the
    /// acquire/release points Present waits on; implicit sync imports the
    /// fence straight into the dma-buf so the kernel's own implicit fence
    /// gates the server's read, needing nothing passed to Present itself;
    /// the no-sync fallback blocks the driver's client API until rendering
    /// completes. Either way, by the time this returns the buffer is safe to
    /// hand to `PresentPixmap`/`PresentPixmapSynced` with no extra wait fence.
    fn synchronize(&self, buffer: &mut ColorBuffer) -> Result<(u64, u64), X11Error> {
        if self.use_explicit_sync {
            let timeline = match &mut buffer.timeline {
                Some(t) => t,
                None => {
                    let t = Timeline::new(self.display.connection(), self.window, self.display.device().clone())?;
                    buffer.timeline = Some(t);
                    buffer.timeline.as_mut().unwrap()
                }
            };
            let acquire = timeline.point();
            let fence = self.driver.create_native_fence_fd().map_err(|err| {
                X11Error::ResourceExhausted(err.to_string())
            })?;
            let release = timeline.attach_sync_fd(fence)?;
            return Ok((acquire, release));
        }

        if self.display.flags().supports_implicit_sync && !color_buffer::implicit_sync_unsupported() {
            if let (Some(sync_fd), Ok(fence)) = (buffer.sync_fd(), self.driver.create_native_fence_fd()) {
                if color_buffer::import_sync_file(sync_fd, fence.as_fd()).is_ok() {
                    return Ok((0, 0));
                }
            }
        }

        self.driver.finish().map_err(|err| X11Error::ResourceExhausted(err.to_string()))?;
        Ok((0, 0))
    }

    /// Free-buffer selection (spec §4.5). Returns a pool index in state
    /// that is safe to use as the next render target, excluding `exclude`
    /// (the caller's other current pointer, when rotating the pool, so the
    /// result can never alias it — spec invariant 3).
    fn acquire_free_buffer<'a>(
        self: &'a Arc<Self>,
        mut display_guard: DisplayReadGuard<'a>,
        mut state: MutexGuard<'a, PresenterState>,
        prime: bool,
        exclude: Option<usize>,
    ) -> (
        Result<usize, X11Error>,
        DisplayReadGuard<'a>,
        MutexGuard<'a, PresenterState>,
    ) {
        loop {
            if let Err(err) = self.poll_events(&mut state) {
                return (Err(err), display_guard, state);
            }
            if state.native_destroyed || state.deleted {
                return (
                    Err(X11Error::BadNativeWindow("window destroyed during free-buffer search".into())),
                    display_guard,
                    state,
                );
            }

            let idle = {
                let pool = if prime { &state.prime_pool } else { &state.render_pool };
                pool.find_idle(exclude)
            };
            if let Some(index) = idle {
                return (Ok(index), display_guard, state);
            }

            // Under implicit sync, an IDLE_NOTIFIED buffer is only "ready to
            // wait" (spec §4.5): liveness still requires polling the dma-buf
            // for POLLOUT, or exporting its implicit fence and letting the
            // GPU wait, before the buffer is actually reusable. Only true
            // no-sync treats PresentIdleNotify as IDLE outright.
            if !self.use_explicit_sync {
                let idle_notified = {
                    let pool = if prime { &state.prime_pool } else { &state.render_pool };
                    pool.find_idle_notified(exclude)
                };
                if let Some(index) = idle_notified {
                    let implicit_in_effect = self.display.flags().supports_implicit_sync
                        && !color_buffer::implicit_sync_unsupported();

                    if !implicit_in_effect {
                        let pool = if prime { &mut state.prime_pool } else { &mut state.render_pool };
                        if let Some(buffer) = pool.get_mut(index) {
                            buffer.status = RecyclingStatus::Idle;
                        }
                        return (Ok(index), display_guard, state);
                    }

                    let sync_fd = {
                        let pool = if prime { &state.prime_pool } else { &state.render_pool };
                        pool.get(index)
                            .and_then(|b| b.sync_fd())
                            .and_then(|fd| rustix::io::fcntl_dupfd_cloexec(fd, 3).ok())
                    };

                    drop(state);
                    drop(display_guard);
                    let mut ready = false;
                    match sync_fd {
                        Some(fd) => {
                            if matches!(
                                color_buffer::poll_writable(fd.as_fd(), POLL_TIMEOUT.as_millis() as i32),
                                Ok(true)
                            ) {
                                ready = true;
                                if let Ok(fence) = color_buffer::export_sync_file(fd.as_fd()) {
                                    let _ = self.driver.wait_fence(&fence);
                                }
                            }
                        }
                        None => std::thread::sleep(POLL_TIMEOUT),
                    }
                    display_guard = self.display.read();
                    state = self.lock();

                    if ready {
                        let pool = if prime { &mut state.prime_pool } else { &mut state.render_pool };
                        if let Some(buffer) = pool.get_mut(index) {
                            buffer.status = RecyclingStatus::Idle;
                        }
                        return (Ok(index), display_guard, state);
                    }
                    continue;
                }
            }

            let max = if prime { MAX_PRIME_BUFFERS } else { MAX_COLOR_BUFFERS };
            let len = if prime { state.prime_pool.len() } else { state.render_pool.len() };
            if len < max {
                let fourcc = self.format.fourcc;
                let (w, h) = (state.width as u32, state.height as u32);
                let modifiers = [state.modifier];
                let result = self.allocate_buffer(&mut state, fourcc, w, h, &modifiers, prime);
                return (result, display_guard, state);
            }

            let (dg, st) = self.wait_for_reusable_buffer(display_guard, state, prime);
            display_guard = dg;
            state = st;
        }
    }

    /// Blocks on the appropriate per-buffer wait primitive once the pool is
    /// exhausted (spec §4.5, §4.8), preferring the GPU-wait conversion over
    /// a CPU stall: explicit sync waits for the next point's availability
    /// then converts it to a fence fd; implicit sync polls the dma-buf
    /// writable then exports its fence; either success hands the driver a
    /// fence fd to GPU-wait on instead of blocking the CPU any further.
    ///
    /// Both the presenter mutex and the display read-lock are released for
    /// the actual wait (spec §5) — the data needed to perform it is
    /// extracted from `state` first, since nothing here may hold a borrow
    /// into the locked pool across a blocking call.
    fn wait_for_reusable_buffer<'a>(
        self: &'a Arc<Self>,
        display_guard: DisplayReadGuard<'a>,
        state: MutexGuard<'a, PresenterState>,
        prime: bool,
    ) -> (DisplayReadGuard<'a>, MutexGuard<'a, PresenterState>) {
        enum Wait {
            Timeline(TimelineWaitHandle, u64),
            Dmabuf(OwnedFd),
            None,
        }

        let wait = if self.use_explicit_sync {
            let pool = if prime { &state.prime_pool } else { &state.render_pool };
            pool.iter()
                .next()
                .and_then(|(_, b)| b.timeline.as_ref())
                .map(|t| Wait::Timeline(t.wait_handle(), t.point()))
                .unwrap_or(Wait::None)
        } else if self.display.flags().supports_implicit_sync && !color_buffer::implicit_sync_unsupported() {
            let pool = if prime { &state.prime_pool } else { &state.render_pool };
            pool.iter()
                .next()
                .and_then(|(_, b)| b.sync_fd())
                .and_then(|fd| rustix::io::fcntl_dupfd_cloexec(fd, 3).ok())
                .map(Wait::Dmabuf)
                .unwrap_or(Wait::None)
        } else {
            Wait::None
        };

        drop(state);
        drop(display_guard);

        match wait {
            Wait::Timeline(handle, point) => {
                if handle.wait_available(point, POLL_TIMEOUT.as_nanos() as i64).is_ok() {
                    if let Ok(fence) = handle.point_to_sync_fd(point) {
                        let _ = self.driver.wait_fence(&fence);
                    }
                }
            }
            Wait::Dmabuf(fd) => {
                if matches!(
                    color_buffer::poll_writable(fd.as_fd(), POLL_TIMEOUT.as_millis() as i32),
                    Ok(true)
                ) {
                    if let Ok(fence) = color_buffer::export_sync_file(fd.as_fd()) {
                        let _ = self.driver.wait_fence(&fence);
                    }
                }
            }
            Wait::None => {
                std::thread::sleep(POLL_TIMEOUT);
            }
        }

        (self.display.read(), self.lock())
    }

    /// Reallocates the pool on resize or modifier-staleness (spec §4.5,
    /// §4.6 step 9, §4.7).
    fn reallocate(&self, state: &mut PresenterState, allow_modifier_change: bool) -> Result<(), X11Error> {
        for (_, buffer) in state.render_pool.iter_mut() {
            buffer.pixmap = None;
        }
        state.render_pool = BufferPool::new(MAX_COLOR_BUFFERS);
        state.prime_pool = BufferPool::new(MAX_PRIME_BUFFERS);
        state.front = None;
        state.back = None;
        state.prime_current = None;

        state.width = state.pending_width;
        state.height = state.pending_height;

        if allow_modifier_change && state.needs_modifier_check {
            let (modifiers, prime) = negotiate_modifiers(&self.display, self.window, &self.format)?;
            state.modifier = modifiers.first().copied().unwrap_or(DrmModifier::Linear);
            state.prime = prime;
            state.needs_modifier_check = false;
            self.initial_allocate_locked(state, &modifiers)?;
        } else {
            let modifiers = [state.modifier];
            self.initial_allocate_locked(state, &modifiers)?;
        }

        self.attach_current(state)
    }

    fn initial_allocate_locked(&self, state: &mut PresenterState, modifiers: &[DrmModifier]) -> Result<(), X11Error> {
        let fourcc = self.format.fourcc;
        let (w, h) = (state.width as u32, state.height as u32);
        let front = self.allocate_buffer(state, fourcc, w, h, modifiers, false)?;
        let back = self.allocate_buffer(state, fourcc, w, h, modifiers, false)?;
        state.front = Some(front);
        state.back = Some(back);
        if state.prime {
            let prime = self.allocate_buffer(state, fourcc, w, h, &[DrmModifier::Linear], true)?;
            state.prime_current = Some(prime);
        }
        Ok(())
    }

    /// Non-blocking poll of the special-event channel (spec §4.9).
    fn poll_events(&self, state: &mut PresenterState) -> Result<(), X11Error> {
        let connection = self.display.connection();
        while let Some(event) = connection.poll_for_event()? {
            self.handle_event(state, event);
        }
        Ok(())
    }

    /// Blocking wait on the special-event channel, releasing the presenter
    /// mutex and display lock before blocking (spec §4.9, §5). A queued
    /// event is handled without dropping anything — only the genuine
    /// absence of one reaches the blocking sleep, and that sleep runs with
    /// neither lock held, so the driver's update/damage callbacks (which
    /// need the presenter mutex while the driver holds its own
    /// window-system lock) are never stalled behind it.
    fn wait_for_event<'a>(
        self: &'a Arc<Self>,
        display_guard: DisplayReadGuard<'a>,
        mut state: MutexGuard<'a, PresenterState>,
    ) -> (DisplayReadGuard<'a>, MutexGuard<'a, PresenterState>) {
        if let Ok(Some(event)) = self.display.connection().poll_for_event() {
            self.handle_event(&mut state, event);
            return (display_guard, state);
        }

        drop(state);
        drop(display_guard);
        std::thread::sleep(POLL_TIMEOUT);

        let display_guard = self.display.read();
        let mut state = self.lock();
        let _ = self.poll_events(&mut state);
        (display_guard, state)
    }

    fn handle_event(&self, state: &mut PresenterState, event: Event) {
        match event {
            Event::PresentConfigureNotify(ev) => {
                state.pending_width = ev.width as u16;
                state.pending_height = ev.height as u16;
                if ev.pixmap_flags & 0x1 != 0 {
                    state.native_destroyed = true;
                    tracing::warn!("window destroyed (PresentConfigureNotify pixmap_flags bit 0)");
                }
            }
            Event::PresentIdleNotify(ev) => {
                if self.use_explicit_sync {
                    return;
                }
                for pool in [&mut state.render_pool, &mut state.prime_pool] {
                    if let Some((index, _)) = pool
                        .iter()
                        .find(|(_, b)| b.pixmap == Some(ev.pixmap) && u32::from(b.last_present_serial) == ev.serial)
                    {
                        if let Some(buffer) = pool.get_mut(index) {
                            debug_assert_eq!(buffer.status, RecyclingStatus::InUse);
                            buffer.status = RecyclingStatus::IdleNotified;
                        }
                        pool.move_to_tail(index);
                        break;
                    }
                }
            }
            Event::PresentCompleteNotify(ev) => {
                /// `CompleteMode::SuboptimalCopy` (presentproto.txt): the server had to fall
                /// back to a copy because the buffer's current modifier could no longer be
                /// flipped directly.
                const SUBOPTIMAL_COPY: u8 = 3;

                let outstanding =
                    u32::from(state.last_present_serial).wrapping_sub(u32::from(state.last_complete_serial));
                let since_event = u32::from(state.last_present_serial).wrapping_sub(ev.serial);
                if since_event < outstanding {
                    state.last_complete_serial = Serial::from(ev.serial);
                }
                state.last_complete_msc = ev.msc;
                if ev.mode == SUBOPTIMAL_COPY && !self.display.flags().force_prime {
                    state.needs_modifier_check = true;
                }
            }
            _ => {}
        }
    }

    /// The update callback (spec §4.10 "Update"). Runs on the driver's
    /// thread while it holds its window-system lock; takes only the
    /// presenter mutex.
    pub fn on_update(self: &Arc<Self>) {
        let _span = self.span.enter();
        let mut state = self.lock();
        if state.skip_update_callback > 0 {
            return;
        }
        let _ = self.poll_events(&mut state);
        if state.pending_width != state.width || state.pending_height != state.height {
            let _ = self.reallocate(&mut state, false);
        }
    }

    /// The damage callback (spec §4.10 "Damage"). `syncfd` must be dup'ed by
    /// the caller if retained past return; this implementation only reads
    /// it for the duration of the call, matching the "otherwise the driver
    /// closes it" default.
    pub fn on_damage(self: &Arc<Self>, syncfd: Option<&OwnedFd>) {
        let _span = self.span.enter();
        let mut state = self.lock();
        let _ = syncfd;
        let slot = if state.prime { Slot::Prime } else { Slot::Front };
        let index = match slot {
            Slot::Prime => state.prime_current,
            Slot::Front => state.front,
            Slot::Back => state.back,
        };
        let Some(index) = index else { return };
        let pool = if state.prime { &mut state.prime_pool } else { &mut state.render_pool };
        let Some(buffer) = pool.get_mut(index) else { return };
        if self.ensure_pixmap(buffer).is_err() {
            return;
        }
        let pixmap = buffer.pixmap.unwrap();
        let connection = self.display.connection();
        let serial = u32::from(state.last_present_serial).wrapping_add(1);
        state.last_present_serial = Serial::from(serial);
        let options = (PresentOptions::ASYNC | PresentOptions::COPY).bits();
        let _ = connection.present_pixmap(
            self.window,
            pixmap,
            serial,
            x11rb::NONE,
            x11rb::NONE,
            0,
            0,
            x11rb::NONE,
            x11rb::NONE,
            x11rb::NONE,
            options.into(),
            0,
            0,
            0,
            &[],
        );
        let _ = connection.flush();
    }

    /// Destroys the presenter: increments `skip_update_callback`, releases
    /// the mutex, then frees every buffer (spec §5 "destroy increments
    /// `skip_update_callback`... releases the mutex before calling into the
    /// driver's destroy path").
    pub fn destroy(&self) -> Result<(), X11Error> {
        {
            let mut state = self.lock();
            state.skip_update_callback += 1;
            state.deleted = true;
        }

        let mut state = self.lock();
        for pool in [&mut state.render_pool, &mut state.prime_pool] {
            while pool.len() > 0 {
                if let Some(buffer) = pool.remove(0) {
                    self.free_buffer(buffer);
                }
            }
        }
        Ok(())
    }

    /// Frees a buffer in reverse acquisition order: allocator object
    /// (dropped with `ColorBuffer`), driver handle, server pixmap, timeline,
    /// dma-buf fd (spec §4.5 "Freeing a buffer", §9 "Resource discipline").
    fn free_buffer(&self, buffer: ColorBuffer) {
        let _ = self.driver.free_color_buffer(buffer.driver_handle);
        if let Some(pixmap) = buffer.pixmap {
            let _ = self.display.connection().free_pixmap(pixmap);
        }
        if let Some(timeline) = buffer.timeline {
            let _ = timeline.destroy(self.display.connection());
        }
        // `buffer.prime_fd` and `buffer.dmabuf` close on drop.
    }

    /// Sets the swap interval (`eglSwapInterval`, spec §6 loader glue).
    pub fn set_swap_interval(&self, interval: i32) {
        self.swap_interval.store(interval.max(0) as u32, Ordering::Relaxed);
    }

    /// Records the driver-assigned opaque surface handle, so later
    /// `set_color_buffers` calls know which surface to update.
    pub fn set_driver_surface(&self, handle: DriverSurfaceHandle) {
        *self.driver_surface.lock().unwrap() = handle;
    }

    /// Whether the window is known destroyed (spec §7 `server-termination`,
    /// §8 scenario 5).
    pub fn is_native_destroyed(&self) -> bool {
        self.lock().native_destroyed
    }
}

/// Modifier negotiation (spec §4.7).
fn negotiate_modifiers(
    display: &DisplayInstance,
    window: u32,
    format: &DriverFormat,
) -> Result<(Vec<DrmModifier>, bool), X11Error> {
    let flags = display.flags();

    if flags.force_prime {
        return Ok((format.render_modifiers.clone(), true));
    }

    let connection = display.connection();
    let reply = connection
        .dri3_get_supported_modifiers(window, format.depth as u8, format.bpp as u8)?
        .reply()?;

    let window_list: Vec<DrmModifier> = reply.window_modifiers.iter().map(|&m| DrmModifier::from(m)).collect();
    let screen_list: Vec<DrmModifier> = reply.screen_modifiers.iter().map(|&m| DrmModifier::from(m)).collect();

    let driver_set = &format.render_modifiers;

    let intersect = |server: &[DrmModifier]| -> Vec<DrmModifier> {
        driver_set.iter().copied().filter(|m| server.contains(m)).collect()
    };

    let mut candidate = intersect(&window_list);
    if candidate.is_empty() {
        if window_list.is_empty() {
            candidate = intersect(&screen_list);
        }
        // else: window-list non-empty but disjoint from ours; leave empty,
        // we fall through to PRIME (spec step 3).
    }

    if !candidate.is_empty() {
        Ok((candidate, false))
    } else if flags.supports_prime {
        Ok((vec![DrmModifier::Linear], true))
    } else {
        Err(X11Error::BadMatch(
            "no usable modifier intersection and PRIME is unavailable".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_options_bits_match_spec_constants() {
        assert_eq!(PresentOptions::ASYNC.bits(), 0x01);
        assert_eq!(PresentOptions::COPY.bits(), 0x02);
        assert_eq!(PresentOptions::SUBOPTIMAL.bits(), 0x08);
    }

    #[test]
    fn present_capabilities_syncobj_bit() {
        let caps = PresentCapabilities::from_bits_truncate(0x11);
        assert!(caps.contains(PresentCapabilities::ASYNC));
        assert!(caps.contains(PresentCapabilities::SYNCOBJ));
    }
}
