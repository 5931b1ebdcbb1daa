//! Per-window color buffer pool (spec §3 "Color buffer", §4.5) and the
//! implicit-sync dma-buf ioctls it relies on (spec §4.8, §6 "Kernel surface").

use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use x11rb::protocol::xproto::Pixmap;

use crate::backend::allocator::dmabuf::Dmabuf;
use crate::utils::Serial;

use super::error::X11Error;
use super::timeline::Timeline;

/// Maximum number of buffers in the shared/render pool (spec invariant 2).
pub const MAX_COLOR_BUFFERS: usize = 4;
/// Maximum number of buffers in the PRIME linear intermediate pool (spec invariant 2).
pub const MAX_PRIME_BUFFERS: usize = 2;

/// Lifecycle state of a [`ColorBuffer`] (spec §3, invariant 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecyclingStatus {
    /// Free to be chosen as a render target.
    Idle,
    /// Attached to an outstanding Present request.
    InUse,
    /// Released by the server (`PresentIdleNotify`) but not yet confirmed
    /// idle client-side; implicit-sync and no-sync modes only — explicit
    /// sync never produces this state (spec invariant 5).
    IdleNotified,
}

/// One GPU buffer owned by a window (spec §3 "Color buffer").
#[derive(Debug)]
pub struct ColorBuffer {
    /// The exported dma-buf this buffer is backed by.
    pub dmabuf: Dmabuf,
    /// Opaque driver color-buffer handle, as returned by the driver's
    /// "alloc color buffer" entry point (see [`super::glue`]).
    pub driver_handle: usize,
    /// Server-side pixmap XID, created lazily on first use in a present.
    pub pixmap: Option<Pixmap>,
    /// dma-buf fd, populated only for PRIME intermediate buffers — the
    /// server side cannot expose the fd for a regular shared buffer.
    pub prime_fd: Option<OwnedFd>,
    /// Per-buffer explicit-sync timeline, present only once explicit sync
    /// has attached a point to this buffer at least once.
    pub timeline: Option<Timeline>,
    /// Recycling state (spec invariant 5).
    pub status: RecyclingStatus,
    /// The `last_present_serial` value this buffer was attached under.
    pub last_present_serial: Serial,
    /// Age-ordering key used by [`BufferPool::find_idle`]/[`BufferPool::find_idle_notified`]
    /// to favor the oldest-freed buffer without physically moving this
    /// buffer's pool index (stable indices are load-bearing: a window
    /// presenter's front/back/prime pointers are raw pool positions).
    seq: u64,
}

impl ColorBuffer {
    /// Wraps a freshly allocated buffer as `IDLE`, not yet attached to any
    /// present.
    pub fn new(dmabuf: Dmabuf, driver_handle: usize) -> ColorBuffer {
        ColorBuffer {
            dmabuf,
            driver_handle,
            pixmap: None,
            prime_fd: None,
            timeline: None,
            status: RecyclingStatus::Idle,
            last_present_serial: Serial::from(0),
            seq: 0,
        }
    }

    /// The fd to use for implicit-sync dma-buf ioctls and PRIME GPU-wait
    /// conversions: the dedicated PRIME fd when one has been populated
    /// (spec §3 "per-buffer dma-buf fd populated for PRIME buffers"), else
    /// the backing dma-buf's own handle.
    pub fn sync_fd(&self) -> Option<BorrowedFd<'_>> {
        self.prime_fd.as_ref().map(|fd| fd.as_fd()).or_else(|| self.dmabuf.handles().next())
    }

    /// Marks this buffer in-use under `serial`, as done by every Present
    /// request (spec invariant 5).
    pub fn mark_in_use(&mut self, serial: Serial) {
        self.status = RecyclingStatus::InUse;
        self.last_present_serial = serial;
    }
}

/// A fixed-capacity pool of [`ColorBuffer`]s, shared by the render pool
/// (capacity [`MAX_COLOR_BUFFERS`]) and the PRIME pool (capacity
/// [`MAX_PRIME_BUFFERS`]).
#[derive(Debug)]
pub struct BufferPool {
    buffers: Vec<ColorBuffer>,
    max: usize,
    next_seq: u64,
}

impl BufferPool {
    /// A new, empty pool with the given capacity.
    pub fn new(max: usize) -> BufferPool {
        BufferPool {
            buffers: Vec::with_capacity(max),
            max,
            next_seq: 0,
        }
    }

    /// Number of buffers currently allocated.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the pool has no buffers.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Whether the pool has reached its capacity (spec invariant 2).
    pub fn is_full(&self) -> bool {
        self.buffers.len() >= self.max
    }

    /// Adds a newly allocated buffer. Fails (returning the buffer back) if
    /// the pool is already at capacity.
    pub fn push(&mut self, mut buffer: ColorBuffer) -> Result<usize, ColorBuffer> {
        if self.is_full() {
            return Err(buffer);
        }
        buffer.seq = self.next_seq;
        self.next_seq += 1;
        self.buffers.push(buffer);
        Ok(self.buffers.len() - 1)
    }

    /// Immutable access by index.
    pub fn get(&self, index: usize) -> Option<&ColorBuffer> {
        self.buffers.get(index)
    }

    /// Mutable access by index.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut ColorBuffer> {
        self.buffers.get_mut(index)
    }

    /// Iterates `(index, buffer)` pairs, oldest-allocated first.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ColorBuffer)> {
        self.buffers.iter().enumerate()
    }

    /// Iterates mutable `(index, buffer)` pairs.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut ColorBuffer)> {
        self.buffers.iter_mut().enumerate()
    }

    /// Index of the oldest (lowest-`seq`) buffer in state
    /// [`RecyclingStatus::Idle`], excluding `exclude` if given (spec §4.5
    /// free-buffer selection, first step of the scan).
    ///
    /// Scans by age rather than by Vec position: pool indices are the
    /// window presenter's front/back/prime pointers, so they must stay
    /// stable across this scan, and age ordering is tracked separately via
    /// each buffer's `seq` (see [`Self::move_to_tail`]).
    pub fn find_idle(&self, exclude: Option<usize>) -> Option<usize> {
        self.buffers
            .iter()
            .enumerate()
            .filter(|(i, b)| b.status == RecyclingStatus::Idle && Some(*i) != exclude)
            .min_by_key(|(_, b)| b.seq)
            .map(|(i, _)| i)
    }

    /// Index of the oldest (lowest-`seq`) buffer in state
    /// [`RecyclingStatus::IdleNotified`], excluding `exclude` if given — the
    /// implicit/no-sync equivalent of [`find_idle`](Self::find_idle).
    pub fn find_idle_notified(&self, exclude: Option<usize>) -> Option<usize> {
        self.buffers
            .iter()
            .enumerate()
            .filter(|(i, b)| b.status == RecyclingStatus::IdleNotified && Some(*i) != exclude)
            .min_by_key(|(_, b)| b.seq)
            .map(|(i, _)| i)
    }

    /// Marks buffer `index` as most-recently-freed, so other idle buffers
    /// are preferred on the next scan (spec §4.8, no-sync mode: "move buffer
    /// to the tail of the list to favor the oldest-enqueued buffer").
    ///
    /// This never physically reorders the underlying storage — doing so
    /// would shift every subsequent index down by one, silently aliasing
    /// whatever pool positions the window presenter has cached as its
    /// current front/back/prime pointers. Instead it bumps the buffer's age
    /// key to the newest value, which is equivalent for `find_idle`'s
    /// oldest-first scan and leaves every index untouched.
    pub fn move_to_tail(&mut self, index: usize) {
        if let Some(buffer) = self.buffers.get_mut(index) {
            buffer.seq = self.next_seq;
            self.next_seq += 1;
        }
    }

    /// Removes and returns buffer `index` for teardown. Destruction order
    /// (allocator object, driver handle, server pixmap, timeline, dma-buf
    /// fd) is the caller's responsibility (spec §4.5 "Freeing a buffer"),
    /// since the server pixmap and driver handle require a live connection.
    pub fn remove(&mut self, index: usize) -> Option<ColorBuffer> {
        if index >= self.buffers.len() {
            return None;
        }
        Some(self.buffers.remove(index))
    }
}

/// A process-wide, conservative latch: once implicit-sync dma-buf ioctls
/// are observed unsupported, never attempt them again (spec §4.8, §9
/// "Process-wide flags").
static IMPLICIT_SYNC_UNSUPPORTED: AtomicBool = AtomicBool::new(false);

/// Whether the implicit-sync ioctl latch has tripped.
pub fn implicit_sync_unsupported() -> bool {
    IMPLICIT_SYNC_UNSUPPORTED.load(Ordering::Acquire)
}

/// Test-only: resets the latch so unrelated tests don't observe state left
/// behind by a previous one.
#[cfg(test)]
pub(crate) fn reset_implicit_sync_latch() {
    IMPLICIT_SYNC_UNSUPPORTED.store(false, Ordering::Release);
}

fn trip_if_unsupported(err: rustix::io::Errno) -> X11Error {
    if matches!(
        err,
        rustix::io::Errno::NOTTY | rustix::io::Errno::BADF | rustix::io::Errno::NOSYS
    ) {
        IMPLICIT_SYNC_UNSUPPORTED.store(true, Ordering::Release);
        tracing::warn!("implicit-sync dma-buf ioctls unsupported by this kernel; latching to CPU wait");
        X11Error::IoctlUnsupported
    } else {
        X11Error::ResourceExhausted(err.to_string())
    }
}

const DMA_BUF_BASE: u32 = b'b' as u32;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u32, size: usize) -> libc::c_ulong {
    ((dir << 30) | (DMA_BUF_BASE << 8) | nr | ((size as u32) << 16)) as libc::c_ulong
}

#[repr(C)]
struct DmaBufImportSyncFile {
    flags: u32,
    fd: i32,
}

#[repr(C)]
struct DmaBufExportSyncFile {
    flags: u32,
    fd: i32,
}

/// Both read and write access, matching the conservative flag set Mesa
/// itself uses for this ioctl pair.
const DMA_BUF_SYNC_RW: u32 = 0b11;

/// `DMA_BUF_IOCTL_IMPORT_SYNC_FILE`: plugs `fence` into `dmabuf`'s implicit
/// reservation object (spec §4.8 "Implicit" row).
pub fn import_sync_file(dmabuf: BorrowedFd<'_>, fence: BorrowedFd<'_>) -> Result<(), X11Error> {
    if implicit_sync_unsupported() {
        return Err(X11Error::IoctlUnsupported);
    }

    let request = ioc(IOC_WRITE, 3, std::mem::size_of::<DmaBufImportSyncFile>());
    let mut arg = DmaBufImportSyncFile {
        flags: DMA_BUF_SYNC_RW,
        fd: fence.as_raw_fd(),
    };

    let ret = unsafe { libc::ioctl(dmabuf.as_raw_fd(), request, &mut arg as *mut _) };
    if ret == 0 {
        Ok(())
    } else {
        Err(trip_if_unsupported(rustix::io::Errno::from_raw_os_error(
            errno::errno().0,
        )))
    }
}

/// `DMA_BUF_IOCTL_EXPORT_SYNC_FILE`: exports `dmabuf`'s implicit fence as a
/// fence fd, for a buffer that has already received `PresentIdleNotify`
/// (spec §4.8 "Implicit" row).
pub fn export_sync_file(dmabuf: BorrowedFd<'_>) -> Result<OwnedFd, X11Error> {
    if implicit_sync_unsupported() {
        return Err(X11Error::IoctlUnsupported);
    }

    let request = ioc(
        IOC_WRITE | IOC_READ,
        2,
        std::mem::size_of::<DmaBufExportSyncFile>(),
    );
    let mut arg = DmaBufExportSyncFile {
        flags: DMA_BUF_SYNC_RW,
        fd: -1,
    };

    let ret = unsafe { libc::ioctl(dmabuf.as_raw_fd(), request, &mut arg as *mut _) };
    if ret == 0 {
        use std::os::unix::io::FromRawFd;
        Ok(unsafe { OwnedFd::from_raw_fd(arg.fd) })
    } else {
        Err(trip_if_unsupported(rustix::io::Errno::from_raw_os_error(
            errno::errno().0,
        )))
    }
}

/// Polls a dma-buf fd for `POLLOUT`, the no-native-fence fallback wait from
/// spec §4.5's implicit-sync row.
pub fn poll_writable(dmabuf: BorrowedFd<'_>, timeout_ms: i32) -> Result<bool, X11Error> {
    let mut fds = [rustix::event::PollFd::new(&dmabuf, rustix::event::PollFlags::OUT)];
    let n = rustix::event::poll(&mut fds, timeout_ms)
        .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?;
    Ok(n > 0 && fds[0].revents().contains(rustix::event::PollFlags::OUT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use drm_fourcc::{DrmFourcc, DrmModifier};

    fn dummy_dmabuf() -> Dmabuf {
        use crate::backend::allocator::{dmabuf::DmabufFlags, Format};
        let format = Format {
            code: DrmFourcc::Xrgb8888,
            modifier: DrmModifier::Linear,
        };
        let mut builder = Dmabuf::builder(4, 4, format, DmabufFlags::empty());
        let fd: OwnedFd = std::fs::File::open("/dev/null").unwrap().into();
        builder.add_plane(fd, 0, 0, 16);
        builder.build().unwrap()
    }

    #[test]
    fn pool_rejects_past_capacity() {
        let mut pool = BufferPool::new(1);
        assert!(pool.push(ColorBuffer::new(dummy_dmabuf(), 1)).is_ok());
        assert!(pool.push(ColorBuffer::new(dummy_dmabuf(), 2)).is_err());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn find_idle_skips_in_use_buffers() {
        let mut pool = BufferPool::new(MAX_COLOR_BUFFERS);
        let idx0 = pool.push(ColorBuffer::new(dummy_dmabuf(), 0)).unwrap();
        pool.get_mut(idx0).unwrap().mark_in_use(Serial::from(1));
        let idx1 = pool.push(ColorBuffer::new(dummy_dmabuf(), 1)).unwrap();

        assert_eq!(pool.find_idle(None), Some(idx1));
    }

    #[test]
    fn find_idle_honors_exclusion() {
        let mut pool = BufferPool::new(MAX_COLOR_BUFFERS);
        let idx0 = pool.push(ColorBuffer::new(dummy_dmabuf(), 0)).unwrap();
        let idx1 = pool.push(ColorBuffer::new(dummy_dmabuf(), 1)).unwrap();

        assert_eq!(pool.find_idle(Some(idx0)), Some(idx1));
        assert_eq!(pool.find_idle(Some(idx1)), Some(idx0));
    }

    #[test]
    fn move_to_tail_keeps_indices_stable_but_changes_scan_order() {
        let mut pool = BufferPool::new(MAX_COLOR_BUFFERS);
        let idx0 = pool.push(ColorBuffer::new(dummy_dmabuf(), 0)).unwrap();
        let idx1 = pool.push(ColorBuffer::new(dummy_dmabuf(), 1)).unwrap();
        let idx2 = pool.push(ColorBuffer::new(dummy_dmabuf(), 2)).unwrap();

        // Before touching anything, the oldest (lowest-seq) buffer is idx0.
        assert_eq!(pool.find_idle(None), Some(idx0));

        // Moving idx0 to the tail must not disturb any index...
        pool.move_to_tail(idx0);
        let handles: Vec<usize> = pool.iter().map(|(_, b)| b.driver_handle).collect();
        assert_eq!(handles, vec![0, 1, 2]);

        // ...but idx0 is no longer preferred: idx1 is now the oldest.
        assert_eq!(pool.find_idle(None), Some(idx1));
        assert_eq!(idx0, 0);
        assert_eq!(idx1, 1);
        assert_eq!(idx2, 2);
    }

    #[test]
    fn latch_trips_on_notty_and_stays_tripped() {
        reset_implicit_sync_latch();
        assert!(!implicit_sync_unsupported());
        let _ = trip_if_unsupported(rustix::io::Errno::NOTTY);
        assert!(implicit_sync_unsupported());
        reset_implicit_sync_latch();
    }
}
