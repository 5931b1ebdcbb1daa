//! The X11 presentation core: the thin bridge between a GPU driver and an
//! X11 display server over DRI3/Present (spec §2).
//!
//! [`display`] models a single `eglInitialize`'d connection: wire transport,
//! server capability probe, GPU device selection and the format/modifier
//! catalog. [`window`] is the heart of the crate — the per-window buffer
//! pool, modifier negotiation, event pump and `swap_buffers`.
//! [`pixmap_presenter`] is the single-buffer variant for pixmap surfaces.
//! [`timeline`] wraps a DRM timeline syncobj for the explicit-sync path;
//! [`color_buffer`] is the per-buffer record and pool, and the dma-buf
//! implicit-sync ioctls. [`config`] is the driver format/EGL config
//! registry. [`glue`] is the driver callback contract and the loader
//! entry-point glue's interfaces (spec §6). [`conn`] is the optional
//! Xlib connection variant and its close-notification hook. [`extension`]
//! probes DRI3/Present versions and the NV-GLX gate. [`error`] is the
//! crate-level error enum.
//!
//! A note for future contributors and maintainers:
//!
//! Do take a look at some useful reading in order to understand this
//! backend more deeply:
//!
//! DRI3 protocol documentation: <https://gitlab.freedesktop.org/xorg/proto/xorgproto/-/blob/master/dri3proto.txt>
//!
//! Present protocol documentation: <https://gitlab.freedesktop.org/xorg/proto/xorgproto/-/blob/master/presentproto.txt>

pub mod color_buffer;
pub mod config;
pub mod conn;
pub mod display;
pub mod error;
pub mod extension;
pub mod glue;
pub mod pixmap_presenter;
pub mod timeline;
pub mod window;

pub use error::X11Error;
