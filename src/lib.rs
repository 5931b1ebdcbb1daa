#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_debug_implementations, rust_2018_idioms)]
#![allow(clippy::upper_case_acronyms)]

//! A thin bridge between an OpenGL/EGL driver and an X11 display server.
//!
//! This crate lets a GPU driver present color buffers it rendered into X11
//! windows and pixmaps. It shares GPU memory as dma-buf file descriptors,
//! coordinates synchronization with the server over DRI3/Present, and
//! handles window resize, buffer recycling, cross-GPU PRIME offload and
//! format-modifier negotiation. The driver itself owns all OpenGL rendering;
//! this crate never issues a GL draw call.
//!
//! ## Structure
//!
//! [`backend::x11`] is the core: [`backend::x11::display::DisplayInstance`]
//! models a single `eglInitialize`'d connection, and
//! [`backend::x11::window::WindowPresenter`] is the per-window state machine
//! that drives presentation. [`backend::allocator`] wraps GBM buffer
//! allocation and dma-buf export/import. [`backend::egl`] wraps the EGL
//! entry points this crate itself needs (device enumeration, format-modifier
//! queries, native-fence-sync) — it is not a general-purpose EGL/GL binding.
//! [`backend::drm`] wraps DRM node identification and kernel timeline
//! syncobjs.
//!
//! Logging goes through [`tracing`]; install a subscriber in the host
//! application to see it.

pub mod backend;
pub mod utils;
