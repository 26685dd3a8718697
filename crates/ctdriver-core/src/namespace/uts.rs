//! UTS namespace: the container's own hostname.

use ctdriver_common::error::{DriverError, Result};

/// Sets the hostname of the calling process's UTS namespace.
///
/// # Errors
///
/// Returns an error if `sethostname(2)` fails.
pub fn set_hostname(hostname: &str) -> Result<()> {
    nix::unistd::sethostname(hostname).map_err(|e| DriverError::PermissionDenied {
        message: format!("sethostname {hostname}: {e}"),
    })?;
    tracing::debug!(hostname, "container hostname set");
    Ok(())
}
