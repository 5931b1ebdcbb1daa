use super::EGLError;

/// Errors this crate's EGL helpers can produce.
///
/// These cover only the EGL surface this crate actually touches — device
/// enumeration, platform display creation and native-fence-sync. Rendering,
/// context creation and surface/swapchain management belong to the driver.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// `eglInitialize` failed.
    #[error("failed to initialize EGL")]
    InitFailed,
    /// `eglGetPlatformDisplay`/`eglGetDisplay` returned `EGL_NO_DISPLAY`.
    #[error("unable to obtain a valid EGL display")]
    DisplayNotSupported,
    /// One of a set of required EGL extensions is missing.
    #[error("none of the following EGL extensions is supported, at least one is required: {0:?}")]
    EglExtensionNotSupported(&'static [&'static str]),
    /// `eglQueryDevicesEXT` failed.
    #[error("failed to query EGL devices: {0}")]
    QueryDevices(#[source] EGLError),
    /// `eglQueryDeviceStringEXT`/`eglQueryDisplayAttribEXT` failed.
    #[error("failed to query an EGL device property: {0}")]
    QueryDeviceProperty(#[source] EGLError),
    /// An EGL device property query succeeded but returned an empty string.
    #[error("EGL device property query returned no value")]
    EmptyDeviceProperty,
    /// Sync object creation or a sync wait call failed.
    #[error("failed to create or wait on an EGL sync object: {0}")]
    CreationFailed(#[source] EGLError),
}
