//! The per-`eglInitialize` display instance (spec §3 "Display instance",
//! §4.1 "Display instance creation", §4.2 "Config list").

use std::os::unix::io::{AsFd, OwnedFd};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use drm::Device as _;
use drm_fourcc::DrmFourcc;
use x11rb::connection::Connection;
use x11rb::protocol::dri3::ConnectionExt as _;
use x11rb::protocol::xproto::{ConnectionExt as _, Screen};
use x11rb::rust_connection::RustConnection;

use crate::backend::allocator::gbm::{GbmAllocator, GbmBufferFlags, GbmDevice};
use crate::backend::drm::node::{DrmNode, NodeType};
use crate::backend::drm::DrmDeviceFd;
use crate::backend::egl::{device::EGLDevice, display::EGLDisplay};
use crate::utils::fd::DeviceFd;

use super::config::{build_config_list, ConfigRecord, FormatRegistry, RawDriverConfig};
use super::error::X11Error;
use super::extension::{self, Extensions};

/// Caller-provided parameters to [`DisplayInstance::new`] (spec §4.1 "Inputs").
#[derive(Debug, Default)]
pub struct DisplayOptions {
    /// A native display name to connect to. `None` reads `DISPLAY` from the
    /// environment, matching Xlib's own default.
    pub display_name: Option<String>,
    /// An explicit screen index. Wins over any screen parsed out of
    /// `display_name`.
    pub screen: Option<usize>,
    /// A caller-requested render device path (`__NV_PRIME_RENDER_OFFLOAD_PROVIDER`
    /// in the loader glue).
    pub requested_device: Option<std::path::PathBuf>,
    /// Whether cross-GPU PRIME offload is allowed at all (the loader glue's
    /// `__NV_PRIME_RENDER_OFFLOAD` reading).
    pub allow_offload: bool,
}

/// The set of driver-exposed EGL configs, handed in by the loader glue
/// before [`DisplayInstance::new`] builds the final [`ConfigRecord`] list
/// (step 11).
pub type RawConfigs = Vec<RawDriverConfig>;

/// Immutable feature flags derived during initialization (spec §3).
#[derive(Debug, Clone, Copy, Default)]
pub struct DisplayFlags {
    /// Set when the server's device differs from the allocator's device
    /// (spec step 4.1.4): every shared buffer must go through a PRIME blit.
    pub force_prime: bool,
    /// Whether PRIME offload is usable at all (spec step 4.1.7, 4.1.9).
    pub supports_prime: bool,
    /// Whether buffer reuse must wait on the dma-buf's implicit fence
    /// (spec step 4.1.4).
    pub supports_implicit_sync: bool,
    /// Whether the DRM timeline-syncobj explicit-sync path is available
    /// (spec step 4.1.10).
    pub supports_explicit_sync: bool,
    /// Whether the driver's EGL display exposes `EGL_ANDROID_native_fence_sync`.
    pub supports_native_fence_sync: bool,
    /// Client and server modifier sets intersect for the probe format
    /// (spec step 4.1.9).
    pub supports_direct: bool,
    /// The server advertises the linear modifier for the probe format.
    pub supports_linear: bool,
}

struct DisplayInstanceInner {
    connection: RustConnection,
    owned: bool,
    screen_num: usize,
    screen: Screen,
    device: DrmDeviceFd,
    allocator: std::sync::Mutex<GbmAllocator<DrmDeviceFd>>,
    egl_display: EGLDisplay,
    flags: DisplayFlags,
    format_registry: FormatRegistry,
    configs: Vec<ConfigRecord>,
    extensions: Extensions,
    /// Per-display init-lock (spec §5): readers are every call except
    /// `Initialize`/`Terminate`, so teardown can wait for in-flight work.
    init_lock: RwLock<()>,
}

/// A single initialized display: wire connection, server capability probe,
/// GPU device selection, format/modifier catalogs, and feature flags (spec
/// §2 table, §3 "Display instance (reference-counted)").
///
/// Lives from [`DisplayInstance::new`] until the last [`Arc`] clone is
/// dropped, which may outlive the external display handle while a surface
/// callback on another thread still references it.
#[derive(Clone)]
pub struct DisplayInstance(Arc<DisplayInstanceInner>);

impl std::fmt::Debug for DisplayInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayInstance")
            .field("screen_num", &self.0.screen_num)
            .field("flags", &self.0.flags)
            .finish_non_exhaustive()
    }
}

/// RAII read guard over the per-display init-lock, held for the duration of
/// any operation other than `Initialize`/`Terminate`.
pub struct DisplayReadGuard<'a>(#[allow(dead_code)] RwLockReadGuard<'a, ()>);

impl DisplayInstance {
    /// Runs the full initialization algorithm of spec §4.1.
    #[tracing::instrument(skip(raw_configs), fields(screen))]
    pub fn new(options: DisplayOptions, raw_configs: RawConfigs) -> Result<DisplayInstance, X11Error> {
        // Step 1: connection, screen resolution.
        let (connection, owned, x11_default_screen) = connect(options.display_name.as_deref())?;
        let screen_num = options.screen.unwrap_or(x11_default_screen);
        let screen = connection
            .setup()
            .roots
            .get(screen_num)
            .cloned()
            .ok_or_else(|| X11Error::BadNativeWindow("screen index out of range".into()))?;
        tracing::Span::current().record("screen", screen_num);

        // Step 2: server capability probe.
        let extensions = extension::probe(&connection)?;

        // Step 3: DRI3Open, device identification.
        let server_fd = dri3_open(&connection, screen.root)?;
        let server_node = DrmNode::from_file(&server_fd)?;
        let server_is_nvidia = is_nvidia_device(&server_node) || is_tegra_device(&server_node);

        let mut egl_devices: Vec<EGLDevice> = EGLDevice::enumerate()?.collect();
        let server_egl_device = egl_devices.iter().find(|dev| {
            dev.render_device_path()
                .or_else(|_| dev.drm_device_path())
                .ok()
                .and_then(|path| DrmNode::from_path(path).ok())
                .map(|node| node.dev_id() == server_node.dev_id())
                .unwrap_or(false)
        });

        // Step 4: device selection.
        let (chosen_device, mut flags) = if server_is_nvidia {
            if let Some(requested) = &options.requested_device {
                let requested_node = DrmNode::from_path(requested)?;
                if requested_node.dev_id() != server_node.dev_id() {
                    return Err(X11Error::DeviceMismatch(
                        "NV to NV offload is not supported".into(),
                    ));
                }
            }
            let device = server_egl_device.cloned().ok_or_else(|| {
                X11Error::DeviceMismatch("server's NVIDIA device was not enumerated by EGL".into())
            })?;
            (device, DisplayFlags { supports_implicit_sync: false, ..Default::default() })
        } else {
            let chosen = if let Some(requested) = &options.requested_device {
                let requested_node = DrmNode::from_path(requested)?;
                egl_devices
                    .iter()
                    .find(|dev| {
                        dev.render_device_path()
                            .or_else(|_| dev.drm_device_path())
                            .ok()
                            .and_then(|path| DrmNode::from_path(path).ok())
                            .map(|node| node.dev_id() == requested_node.dev_id())
                            .unwrap_or(false)
                    })
                    .cloned()
                    .ok_or_else(|| X11Error::DeviceMismatch("requested device not found".into()))?
            } else if options.allow_offload {
                egl_devices
                    .drain(..)
                    .find(|dev| {
                        dev.render_device_path()
                            .or_else(|_| dev.drm_device_path())
                            .ok()
                            .and_then(|path| DrmNode::from_path(path).ok())
                            .map(|node| is_nvidia_device(&node))
                            .unwrap_or(false)
                    })
                    .ok_or_else(|| X11Error::DeviceMismatch("no NVIDIA device available for offload".into()))?
            } else {
                return Err(X11Error::NotAvailable(
                    "server device is not NVIDIA and offload was not requested".into(),
                ));
            };
            (
                chosen,
                DisplayFlags {
                    supports_implicit_sync: true,
                    force_prime: true,
                    ..Default::default()
                },
            )
        };

        // Step 5: open the chosen device if it differs from the server fd.
        let chosen_node = chosen_device
            .try_get_render_node()?
            .ok_or_else(|| X11Error::DeviceMismatch("chosen device exposes no render node".into()))?;
        let device = if chosen_node.dev_id() == server_node.dev_id() {
            DrmDeviceFd::new(DeviceFd::from(server_fd))
        } else {
            let path = chosen_node
                .dev_path()
                .ok_or_else(|| X11Error::DeviceMismatch("chosen device has no path".into()))?;
            let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
            DrmDeviceFd::new(DeviceFd::from(OwnedFd::from(file)))
        };
        let allocator = GbmAllocator::new(
            GbmDevice::new(device.clone()).map_err(|err| X11Error::ResourceExhausted(err.to_string()))?,
            GbmBufferFlags::RENDERING | GbmBufferFlags::SCANOUT,
        );

        // Step 6: the driver's internal EGL display.
        let egl_display = EGLDisplay::new(&chosen_device)?;

        // Step 7: PRIME support from the driver's capabilities.
        flags.supports_native_fence_sync = egl_display.get_extensions().iter().any(|e| e == "EGL_ANDROID_native_fence_sync");
        flags.supports_prime = flags.supports_native_fence_sync && !server_is_nvidia;

        // Step 8: format registry.
        let format_registry = FormatRegistry::build(
            egl_display.dmabuf_render_formats(),
            egl_display.dmabuf_texture_formats(),
        );

        // Step 9: probe the server's modifier capabilities for XRGB8888.
        let (supports_direct, supports_linear) =
            probe_server_modifiers(&connection, screen.root, &format_registry)?;
        flags.supports_direct = supports_direct;
        flags.supports_linear = supports_linear;
        if !supports_linear {
            flags.supports_prime = false;
        }
        if !supports_direct {
            flags.force_prime = true;
        }
        if flags.force_prime && !flags.supports_prime {
            return Err(X11Error::NotAvailable(
                "window cannot be presented without PRIME, but PRIME is unsupported".into(),
            ));
        }

        // Step 10: explicit sync capability.
        flags.supports_explicit_sync = flags.supports_native_fence_sync
            && extensions.supports_explicit_sync_versions()
            && supports_syncobj_timeline(&device);

        // Step 11: config list.
        let configs = build_config_list(&raw_configs, &format_registry, &screen);

        tracing::debug!(?flags, "display instance initialized");

        Ok(DisplayInstance(Arc::new(DisplayInstanceInner {
            connection,
            owned,
            screen_num,
            screen,
            device,
            allocator: std::sync::Mutex::new(allocator),
            egl_display,
            flags,
            format_registry,
            configs,
            extensions,
            init_lock: RwLock::new(()),
        })))
    }

    /// Acquires the per-display init-lock for reading; every operation
    /// other than initialization/teardown holds this for its duration
    /// (spec §5).
    pub fn read(&self) -> DisplayReadGuard<'_> {
        DisplayReadGuard(self.0.init_lock.read().unwrap())
    }

    /// The wire connection.
    pub fn connection(&self) -> &RustConnection {
        &self.0.connection
    }

    /// Whether the connection was opened by this crate (vs. borrowed from
    /// the caller).
    pub fn owns_connection(&self) -> bool {
        self.0.owned
    }

    /// The resolved screen number.
    pub fn screen_num(&self) -> usize {
        self.0.screen_num
    }

    /// The screen descriptor.
    pub fn screen(&self) -> &Screen {
        &self.0.screen
    }

    /// The DRM device backing the allocator.
    pub fn device(&self) -> &DrmDeviceFd {
        &self.0.device
    }

    /// Locked access to the buffer allocator.
    pub fn allocator(&self) -> std::sync::MutexGuard<'_, GbmAllocator<DrmDeviceFd>> {
        self.0.allocator.lock().unwrap()
    }

    /// The driver's internal EGL display for the chosen device.
    pub fn egl_display(&self) -> &EGLDisplay {
        &self.0.egl_display
    }

    /// Feature flags derived during initialization.
    pub fn flags(&self) -> DisplayFlags {
        self.0.flags
    }

    /// The driver format registry.
    pub fn format_registry(&self) -> &FormatRegistry {
        &self.0.format_registry
    }

    /// The built config list (spec §4.2).
    pub fn configs(&self) -> &[ConfigRecord] {
        &self.0.configs
    }

    /// Negotiated DRI3/Present versions.
    pub fn extensions(&self) -> Extensions {
        self.0.extensions
    }
}

fn connect(display_name: Option<&str>) -> Result<(RustConnection, bool, usize), X11Error> {
    let owned = display_name.is_some() || std::env::var_os("DISPLAY").is_some();
    let (connection, screen) = RustConnection::connect(display_name)?;
    Ok((connection, owned, screen))
}

fn dri3_open<C: Connection>(connection: &C, root: u32) -> Result<OwnedFd, X11Error> {
    use x11rb::protocol::dri3::ConnectionExt as _;
    let reply = connection.dri3_open(root, 0)?.reply()?;
    reply
        .device_fd
        .try_into()
        .map_err(|_| X11Error::ResourceExhausted("DRI3Open returned no device fd".into()))
}

fn is_nvidia_device(node: &DrmNode) -> bool {
    driver_name(node).map(|name| name.eq_ignore_ascii_case("nvidia-drm")).unwrap_or(false)
}

fn is_tegra_device(node: &DrmNode) -> bool {
    driver_name(node)
        .map(|name| matches!(name.to_ascii_lowercase().as_str(), "tegra" | "tegra_drm" | "host1x"))
        .unwrap_or(false)
}

fn driver_name(node: &DrmNode) -> Option<String> {
    let path = node.dev_path_with_type(NodeType::Primary).or_else(|| node.dev_path())?;
    let file = std::fs::OpenOptions::new().read(true).write(true).open(path).ok()?;
    let device = DrmDeviceFd::new(DeviceFd::from(OwnedFd::from(file)));
    let driver = device.get_driver().ok()?;
    Some(driver.name().to_string_lossy().into_owned())
}

fn supports_syncobj_timeline(device: &DrmDeviceFd) -> bool {
    device
        .get_driver_capability(drm::DriverCapability::SyncObjTimeline)
        .unwrap_or(0)
        == 1
}

/// Queries the server's per-format/modifier capability for `XRGB8888` (spec
/// step 4.1.9) and derives `supports_direct`/`supports_linear`.
fn probe_server_modifiers<C: Connection>(
    connection: &C,
    window: u32,
    registry: &FormatRegistry,
) -> Result<(bool, bool), X11Error> {
    let Some(driver_format) = registry.get(DrmFourcc::Xrgb8888) else {
        return Ok((false, false));
    };

    let reply = connection
        .dri3_get_supported_modifiers(window, 24, 32)?
        .reply()?;

    let server_modifiers: Vec<drm_fourcc::DrmModifier> = reply
        .window_modifiers
        .iter()
        .chain(reply.screen_modifiers.iter())
        .map(|&m| drm_fourcc::DrmModifier::from(m))
        .collect();

    let supports_direct = driver_format
        .all_modifiers()
        .any(|m| server_modifiers.contains(&m));
    let supports_linear = server_modifiers.contains(&drm_fourcc::DrmModifier::Linear);

    Ok((supports_direct, supports_linear))
}
