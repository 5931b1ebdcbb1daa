//! Backend modules: GPU buffer allocation, DRM node/syncobj access, EGL
//! device/format/fence queries, and the X11 presentation core.

pub mod allocator;
pub mod drm;
pub mod egl;
pub mod x11;
