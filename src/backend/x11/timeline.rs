//! Per-buffer DRM timeline syncobj (spec §3 "Timeline", §4.3).
//!
//! A [`Timeline`] pairs a kernel syncobj handle with the XID the server
//! knows it by and a monotonically increasing point counter. It backs the
//! explicit-sync path: [`WindowPresenter::swap_buffers`](super::window::WindowPresenter)
//! attaches the next point from a freshly created native fence before
//! sending `PresentPixmapSynced`, and the free-buffer search waits on a
//! buffer's previous point before reusing it.

use std::os::unix::io::{AsFd, OwnedFd};

use drm::control::{syncobj, Device as ControlDevice};
use x11rb::connection::Connection;
use x11rb::protocol::dri3::ConnectionExt as _;

use crate::backend::drm::DrmDeviceFd;

use super::error::X11Error;

/// A kernel DRM timeline syncobj shared with the server.
#[derive(Debug)]
pub struct Timeline {
    device: DrmDeviceFd,
    handle: syncobj::Handle,
    xid: u32,
    point: u64,
}

impl Timeline {
    /// Creates a kernel syncobj, exports it as a handle fd, and shares it
    /// with the server as an XID via DRI3 `ImportSyncobj`. The fd is
    /// consumed by the wire send — ownership crosses the X11 boundary
    /// exactly once.
    pub fn new<C: Connection>(
        connection: &C,
        drawable: u32,
        device: DrmDeviceFd,
    ) -> Result<Timeline, X11Error> {
        let handle = device
            .create_syncobj(false)
            .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?;

        let result = (|| -> Result<u32, X11Error> {
            let fd = device
                .syncobj_to_fd(handle, false)
                .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?;

            let xid = connection.generate_id()?;
            connection
                .dri3_import_syncobj(xid, drawable, fd)?
                .check()?;
            Ok(xid)
        })();

        match result {
            Ok(xid) => Ok(Timeline {
                device,
                handle,
                xid,
                point: 0,
            }),
            Err(err) => {
                let _ = device.destroy_syncobj(handle);
                Err(err)
            }
        }
    }

    /// The XID the server knows this timeline by, for use in
    /// `PresentPixmapSynced`'s acquire/release timeline fields.
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// The current ("last attached") point.
    pub fn point(&self) -> u64 {
        self.point
    }

    /// Imports `fence_fd` (a sync-file fd from native-fence-sync) into a
    /// temporary syncobj and transfers it onto `self.point + 1`, advancing
    /// the point. Returns the new point (the release point to give the
    /// server alongside `self.point()` as the acquire point).
    pub fn attach_sync_fd(&mut self, fence_fd: OwnedFd) -> Result<u64, X11Error> {
        let temp = self
            .device
            .fd_to_syncobj(fence_fd.as_fd(), true)
            .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?;

        let next = self.point + 1;
        let result = self
            .device
            .syncobj_timeline_transfer(temp, self.handle, 0, next)
            .map_err(X11Error::from);
        let _ = self.device.destroy_syncobj(temp);
        result?;

        self.point = next;
        Ok(next)
    }

    /// Transfers `timeline@point` to a fresh temporary syncobj and exports
    /// it as a sync-file fence fd, for the driver to GPU-wait on.
    pub fn point_to_sync_fd(&self, point: u64) -> Result<OwnedFd, X11Error> {
        self.wait_handle().point_to_sync_fd(point)
    }

    /// Waits for `point` to become available (submitted), without
    /// necessarily being signalled — the semantics the free-buffer search
    /// needs from `WAIT_AVAILABLE` (spec §4.5, §4.8).
    pub fn wait_available(&self, point: u64, timeout_nsec: i64) -> Result<(), X11Error> {
        self.wait_handle().wait_available(point, timeout_nsec)
    }

    /// Captures the device/handle this timeline waits through, without
    /// borrowing `self` — for callers that must release a lock guarding the
    /// buffer this timeline lives in before blocking on it (spec §5).
    pub(crate) fn wait_handle(&self) -> TimelineWaitHandle {
        TimelineWaitHandle {
            device: self.device.clone(),
            handle: self.handle,
        }
    }

    /// Frees the server-side XID, then the kernel syncobj, in that order
    /// (spec §4.3 "Destroy").
    pub fn destroy<C: Connection>(self, connection: &C) -> Result<(), X11Error> {
        connection.dri3_free_syncobj(self.xid)?.check()?;
        self.device
            .destroy_syncobj(self.handle)
            .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?;
        Ok(())
    }
}

/// An owned snapshot of a [`Timeline`]'s device and syncobj handle (spec §4.8
/// "preferred" GPU-wait conversion), usable after the `Timeline`'s own borrow
/// has been released — the free-buffer search extracts one of these before
/// dropping the presenter mutex so the actual wait can happen lock-free.
#[derive(Debug, Clone)]
pub(crate) struct TimelineWaitHandle {
    device: DrmDeviceFd,
    handle: syncobj::Handle,
}

impl TimelineWaitHandle {
    /// Waits for `point` to become available, as [`Timeline::wait_available`].
    pub(crate) fn wait_available(&self, point: u64, timeout_nsec: i64) -> Result<(), X11Error> {
        self.device
            .syncobj_timeline_wait(&[self.handle], &[point], timeout_nsec, false, true, false)
            .map_err(X11Error::from)?;
        Ok(())
    }

    /// Converts `point` to a fence fd for the driver to GPU-wait on, as
    /// [`Timeline::point_to_sync_fd`].
    pub(crate) fn point_to_sync_fd(&self, point: u64) -> Result<OwnedFd, X11Error> {
        let temp = self
            .device
            .create_syncobj(false)
            .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?;

        let result = (|| -> Result<OwnedFd, X11Error> {
            self.device
                .syncobj_timeline_transfer(self.handle, temp, point, 0)
                .map_err(X11Error::from)?;
            self.device
                .syncobj_to_fd(temp, true)
                .map_err(|err| X11Error::ResourceExhausted(err.to_string()))
        })();

        let _ = self.device.destroy_syncobj(temp);
        result
    }
}
