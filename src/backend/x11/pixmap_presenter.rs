//! The pixmap presenter: imports a caller-owned, already-created X pixmap as
//! a single driver color buffer (spec §4.11).
//!
//! Unlike [`WindowPresenter`](super::window::WindowPresenter), there is no
//! pool, no resize, and no Present extension traffic — the native pixmap's
//! lifetime is entirely the caller's, and damage is flushed with a plain
//! `CopyArea` (or, when the backing dma-buf differs from the server's GPU, a
//! PRIME blit followed by `CopyArea` from the intermediate).

use x11rb::connection::Connection;
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::xproto::{ConnectionExt as _, CreateGCAux, Gcontext, Pixmap};

use crate::backend::allocator::dmabuf::{AsDmabuf, Dmabuf};
use crate::backend::allocator::Allocator;

use super::config::{ConfigRecord, DriverFormat};
use super::display::DisplayInstance;
use super::error::{CreateWindowError, X11Error};
use super::glue::{DriverColorBuffer, SafeInCallback};

/// The PRIME path this presenter was set up with at creation (spec §4.11
/// "Creation"): chosen once, since a pixmap presenter never un-PRIMEs or
/// re-PRIMEs after the fact.
enum PrimeState {
    /// The server's own dma-buf is linear and single-plane, so it doubles
    /// as the blit target directly — no intermediate pixmap needed.
    BlitReuse {
        /// The driver-owned buffer actually rendered into.
        internal: DriverColorBuffer,
    },
    /// The server's dma-buf cannot be blitted into directly (not linear),
    /// so rendering lands in a linear buffer allocated on the server and is
    /// flushed to the caller's pixmap with `CopyArea`.
    Intermediate {
        /// The driver-owned buffer actually rendered into.
        internal: DriverColorBuffer,
        /// The linear scratch pixmap allocated on the server.
        pixmap: Pixmap,
        /// The driver's import of `pixmap`'s dma-buf, i.e. the blit target.
        blit_target: DriverColorBuffer,
        /// A graphics context scoped to this presenter's `CopyArea` calls.
        gc: Gcontext,
    },
}

/// A single-buffer presenter over a caller-owned native pixmap (spec §3
/// "Pixmap presenter", §4.11).
pub struct PixmapPresenter<D: SafeInCallback> {
    display: DisplayInstance,
    pixmap: Pixmap,
    driver: D,
    /// The imported color buffer backing `pixmap` directly. Under
    /// [`PrimeState::Intermediate`] this is still held (and freed) but never
    /// rendered into or blitted from — the intermediate pixmap stands in
    /// for it.
    driver_handle: DriverColorBuffer,
    width: u32,
    height: u32,
    depth: u8,
    /// `None` while the server's pixmap can be rendered into directly.
    prime: Option<PrimeState>,
}

impl<D: SafeInCallback> std::fmt::Debug for PixmapPresenter<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixmapPresenter")
            .field("pixmap", &self.pixmap)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl<D: SafeInCallback> PixmapPresenter<D> {
    /// Imports a server-owned pixmap as a driver color buffer (spec §4.11
    /// "Creation"): `DRI3 BuffersFromPixmap`, then either render into it
    /// directly, or — if `force_prime` is set or the server's modifier is
    /// outside the driver's renderable set — allocate an internal buffer to
    /// render into and set up the PRIME blit path, reusing the server's
    /// dma-buf as the blit target when it is linear and single-plane,
    /// otherwise allocating a linear intermediate pixmap on the server.
    pub fn new(
        display: DisplayInstance,
        config: &ConfigRecord,
        pixmap: Pixmap,
        driver: D,
    ) -> Result<PixmapPresenter<D>, X11Error> {
        if config.surface_type & super::config::SurfaceType::PIXMAP_BIT.bits() == 0 {
            return Err(CreateWindowError::NotAWindowConfig.into());
        }

        let connection = display.connection();
        let geometry = connection.get_geometry(pixmap)?.reply()?;
        if geometry.width == 0 || geometry.height == 0 {
            return Err(X11Error::BadNativePixmap("pixmap has zero size".into()));
        }

        let reply = connection.dri3_buffers_from_pixmap(pixmap)?.reply()?;
        if reply.width == 0 || reply.height == 0 {
            return Err(X11Error::BadNativePixmap("BuffersFromPixmap returned an empty buffer".into()));
        }
        if reply.buffers.len() != 1 {
            return Err(X11Error::BadNativePixmap("multi-plane pixmap".into()));
        }

        let format = display
            .format_registry()
            .get(config.fourcc)
            .ok_or_else(|| X11Error::BadMatch("config's fourcc is not known to the driver".into()))?
            .clone();
        if reply.depth != format.depth as u8 || reply.bpp != format.bpp as u8 {
            return Err(X11Error::BadNativePixmap(
                "pixmap depth/bpp does not match the chosen config".into(),
            ));
        }

        let modifier = drm_fourcc::DrmModifier::from(reply.modifier);
        let mut builder = Dmabuf::builder(
            reply.width as u32,
            reply.height as u32,
            drm_fourcc::DrmFormat {
                code: config.fourcc,
                modifier,
            },
            crate::backend::allocator::dmabuf::DmabufFlags::empty(),
        );
        for ((fd, stride), offset) in reply
            .buffers
            .into_iter()
            .zip(reply.strides.iter())
            .zip(reply.offsets.iter())
        {
            builder.add_plane(fd, 0, *offset, *stride);
        }
        let dmabuf = builder
            .build()
            .map_err(|err| X11Error::BadNativePixmap(err.to_string()))?;

        let driver_handle = driver
            .import_color_buffer(&dmabuf)
            .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?;

        let width = reply.width as u32;
        let height = reply.height as u32;
        let depth = reply.depth;

        let need_prime = display.flags().force_prime || !format.render_modifiers.contains(&modifier);

        let prime = if need_prime {
            let internal = Self::allocate_internal(&display, &driver, &format, width, height)?;
            if modifier == drm_fourcc::DrmModifier::Linear {
                Some(PrimeState::BlitReuse { internal })
            } else {
                let (intermediate_pixmap, blit_target, gc) =
                    Self::allocate_intermediate(&display, &driver, pixmap, &format, width, height)?;
                Some(PrimeState::Intermediate {
                    internal,
                    pixmap: intermediate_pixmap,
                    blit_target,
                    gc,
                })
            }
        } else {
            None
        };

        Ok(PixmapPresenter {
            display,
            pixmap,
            driver,
            driver_handle,
            width,
            height,
            depth,
            prime,
        })
    }

    /// The driver color buffer to render into for this pixmap.
    pub fn color_buffer(&self) -> DriverColorBuffer {
        match &self.prime {
            Some(PrimeState::BlitReuse { internal }) => *internal,
            Some(PrimeState::Intermediate { internal, .. }) => *internal,
            None => self.driver_handle,
        }
    }

    /// The damage callback (spec §4.10 "Damage", §4.11): for a direct
    /// import, rendering already landed on the pixmap's own backing memory
    /// and there is nothing further to do. Under PRIME, blits the internal
    /// render target into the blit target, following up with a server-side
    /// `CopyArea` when that blit target is a separate intermediate pixmap.
    pub fn on_damage(&self) -> Result<(), X11Error> {
        match &self.prime {
            None => Ok(()),
            Some(PrimeState::BlitReuse { internal }) => self
                .driver
                .copy_color_buffer(*internal, self.driver_handle)
                .map_err(|err| X11Error::ResourceExhausted(err.to_string())),
            Some(PrimeState::Intermediate {
                internal,
                pixmap,
                blit_target,
                gc,
            }) => {
                self.driver
                    .copy_color_buffer(*internal, *blit_target)
                    .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?;
                self.display
                    .connection()
                    .copy_area(*pixmap, self.pixmap, *gc, 0, 0, 0, 0, self.width as u16, self.height as u16)?
                    .check()?;
                Ok(())
            }
        }
    }

    /// Allocates the driver-owned buffer actually rendered into under
    /// PRIME (spec §4.11 "allocate an internal buffer").
    fn allocate_internal(
        display: &DisplayInstance,
        driver: &D,
        format: &DriverFormat,
        width: u32,
        height: u32,
    ) -> Result<DriverColorBuffer, X11Error> {
        let dmabuf = {
            let mut allocator = display.allocator();
            let buffer = allocator
                .create_buffer(width, height, format.fourcc, &[drm_fourcc::DrmModifier::Linear])
                .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?;
            buffer
                .export()
                .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?
        };
        driver
            .import_color_buffer(&dmabuf)
            .map_err(|err| X11Error::ResourceExhausted(err.to_string()))
    }

    /// Allocates a linear scratch pixmap on the server and imports its
    /// dma-buf as the blit target (spec §4.11 "allocate a linear
    /// intermediate pixmap on the server and CopyArea on damage"), mirroring
    /// the window presenter's own server-pixmap creation
    /// (`WindowPresenter::ensure_pixmap`).
    fn allocate_intermediate(
        display: &DisplayInstance,
        driver: &D,
        reference: Pixmap,
        format: &DriverFormat,
        width: u32,
        height: u32,
    ) -> Result<(Pixmap, DriverColorBuffer, Gcontext), X11Error> {
        let dmabuf = {
            let mut allocator = display.allocator();
            let buffer = allocator
                .create_buffer(width, height, format.fourcc, &[drm_fourcc::DrmModifier::Linear])
                .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?;
            buffer
                .export()
                .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?
        };

        let connection = display.connection();
        let xid = connection.generate_id()?;
        let mut fds = Vec::new();
        for handle in dmabuf.handles() {
            let fd = rustix::io::fcntl_dupfd_cloexec(handle, 3)
                .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?;
            fds.push(fd);
        }
        let mut strides = dmabuf.strides();
        let mut offsets = dmabuf.offsets();

        connection.dri3_pixmap_from_buffers(
            xid,
            reference,
            dmabuf.width() as u16,
            dmabuf.height() as u16,
            strides.next().unwrap_or(0),
            offsets.next().unwrap_or(0),
            strides.next().unwrap_or(x11rb::NONE),
            offsets.next().unwrap_or(x11rb::NONE),
            strides.next().unwrap_or(x11rb::NONE),
            offsets.next().unwrap_or(x11rb::NONE),
            strides.next().unwrap_or(x11rb::NONE),
            offsets.next().unwrap_or(x11rb::NONE),
            format.depth as u8,
            format.bpp as u8,
            dmabuf.format().modifier.into(),
            fds,
        )?;

        let blit_target = driver
            .import_color_buffer(&dmabuf)
            .map_err(|err| X11Error::ResourceExhausted(err.to_string()))?;

        let gc = connection.generate_id()?;
        connection.create_gc(gc, xid, &CreateGCAux::default())?.check()?;

        Ok((xid, blit_target, gc))
    }
}

impl<D: SafeInCallback> Drop for PixmapPresenter<D> {
    fn drop(&mut self) {
        let _ = self.driver.free_color_buffer(self.driver_handle);
        match &self.prime {
            Some(PrimeState::BlitReuse { internal }) => {
                let _ = self.driver.free_color_buffer(*internal);
            }
            Some(PrimeState::Intermediate {
                internal,
                pixmap,
                blit_target,
                gc,
            }) => {
                let _ = self.driver.free_color_buffer(*internal);
                let _ = self.driver.free_color_buffer(*blit_target);
                let connection = self.display.connection();
                let _ = connection.free_gc(*gc);
                let _ = connection.free_pixmap(*pixmap);
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blit_reuse_has_no_intermediate_pixmap() {
        let state = PrimeState::BlitReuse { internal: 7 };
        assert!(matches!(state, PrimeState::BlitReuse { internal: 7 }));
    }
}
