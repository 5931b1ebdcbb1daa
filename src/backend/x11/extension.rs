//! Server capability probe (spec step 4.1.2): transport, DRI3/Present
//! versions, and the NV-GLX gate.

use std::os::unix::io::AsFd;

use x11rb::connection::Connection;

use super::error::{MissingExtensionError, X11Error};

/// Environment variable that disables the NV-GLX guard. Set when the caller
/// knows the server's private `NV-GLX` extension does not actually conflict
/// with this bridge (e.g. a patched XWayland).
pub const FORCE_NVGLX_ENV: &str = "X11_EGL_BRIDGE_FORCE_NVGLX";

/// DRI3/Present versions negotiated against the server.
#[derive(Debug, Copy, Clone)]
pub struct Extensions {
    /// `(major, minor)` of DRI3 as accepted by the server.
    pub dri3: (u32, u32),
    /// `(major, minor)` of Present as accepted by the server.
    pub present: (u32, u32),
}

fn is_unix_socket<Fd: AsFd>(fd: Fd) -> bool {
    matches!(
        rustix::net::getsockname(&fd),
        Ok(rustix::net::SocketAddrAny::Unix(_))
    )
}

/// Runs the full server capability probe described in spec step 4.1.2.
///
/// Requires a UNIX-domain socket (fd passing is mandatory), DRI3 with major
/// exactly 1 and minor ≥ 2 (requesting up to 1.4), Present with major
/// exactly 1 and minor ≥ 2 (requesting up to 1.4), and the absence of the
/// server's private `NV-GLX` extension unless [`FORCE_NVGLX_ENV`] is set.
pub fn probe<C: Connection + AsFd>(connection: &C) -> Result<Extensions, X11Error> {
    if !is_unix_socket(connection) {
        return Err(X11Error::NotAvailable(
            "the X11 connection is not a UNIX-domain socket; dma-buf fd passing is not possible"
                .into(),
        ));
    }

    if connection.extension_information("NV-GLX")?.is_some()
        && std::env::var_os(FORCE_NVGLX_ENV).is_none()
    {
        return Err(X11Error::NotAvailable(
            "server advertises the NV-GLX extension; this path is reserved for the native driver \
             unless X11_EGL_BRIDGE_FORCE_NVGLX is set"
                .into(),
        ));
    }

    let dri3 = query_dri3(connection)?;
    let present = query_present(connection)?;

    Ok(Extensions { dri3, present })
}

fn query_dri3<C: Connection>(connection: &C) -> Result<(u32, u32), X11Error> {
    use x11rb::protocol::dri3::{ConnectionExt as _, X11_EXTENSION_NAME};

    if connection.extension_information(X11_EXTENSION_NAME)?.is_none() {
        return Err(MissingExtensionError::NotFound {
            name: X11_EXTENSION_NAME,
        }
        .into());
    }

    let version = connection.dri3_query_version(1, 4)?.reply()?;
    if version.major_version != 1 || version.minor_version < 2 {
        tracing::warn!(
            major = version.major_version,
            minor = version.minor_version,
            "server DRI3 version does not satisfy 1.2+"
        );
        return Err(MissingExtensionError::WrongVersion {
            name: X11_EXTENSION_NAME,
            required_major: 1,
            required_minor: 2,
            available_major: version.major_version,
            available_minor: version.minor_version,
        }
        .into());
    }

    tracing::debug!(
        major = version.major_version,
        minor = version.minor_version,
        "negotiated DRI3 version"
    );
    Ok((version.major_version, version.minor_version))
}

fn query_present<C: Connection>(connection: &C) -> Result<(u32, u32), X11Error> {
    use x11rb::protocol::present::{ConnectionExt as _, X11_EXTENSION_NAME};

    if connection.extension_information(X11_EXTENSION_NAME)?.is_none() {
        return Err(MissingExtensionError::NotFound {
            name: X11_EXTENSION_NAME,
        }
        .into());
    }

    let version = connection.present_query_version(1, 4)?.reply()?;
    if version.major_version != 1 || version.minor_version < 2 {
        tracing::warn!(
            major = version.major_version,
            minor = version.minor_version,
            "server Present version does not satisfy 1.2+"
        );
        return Err(MissingExtensionError::WrongVersion {
            name: X11_EXTENSION_NAME,
            required_major: 1,
            required_minor: 2,
            available_major: version.major_version,
            available_minor: version.minor_version,
        }
        .into());
    }

    tracing::debug!(
        major = version.major_version,
        minor = version.minor_version,
        "negotiated Present version"
    );
    Ok((version.major_version, version.minor_version))
}

impl Extensions {
    /// Whether the negotiated versions satisfy the explicit-sync requirement
    /// (DRI3 minor ≥ 4 and Present minor ≥ 4, spec step 4.1.10).
    pub fn supports_explicit_sync_versions(&self) -> bool {
        self.dri3.1 >= 4 && self.present.1 >= 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_sync_versions_require_minor_four() {
        let ext = Extensions {
            dri3: (1, 4),
            present: (1, 4),
        };
        assert!(ext.supports_explicit_sync_versions());

        let ext = Extensions {
            dri3: (1, 2),
            present: (1, 4),
        };
        assert!(!ext.supports_explicit_sync_versions());
    }
}
