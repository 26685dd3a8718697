//! Linux capability management for least-privilege execution.
//!
//! Drops every capability outside an allowlist from the bounding set, then
//! narrows the effective, permitted and inheritable sets to match.

use caps::{CapSet, Capability, CapsHashSet};
use ctdriver_common::error::{DriverError, Result};

/// Parses capability names such as `CAP_CHOWN`.
///
/// # Errors
///
/// Returns a configuration error naming the first unknown capability.
pub fn parse_capabilities(names: &[&str]) -> Result<Vec<Capability>> {
    names
        .iter()
        .map(|name| {
            name.parse::<Capability>().map_err(|e| DriverError::Config {
                message: format!("unknown capability {name}: {e}"),
            })
        })
        .collect()
}

/// The capabilities kept by non-privileged containers.
///
/// # Errors
///
/// Returns an error if the built-in list names an unknown capability.
pub fn default_capabilities() -> Result<Vec<Capability>> {
    parse_capabilities(ctdriver_common::constants::DEFAULT_CAPABILITIES)
}

/// Drops all Linux capabilities except those in the allowlist.
///
/// # Errors
///
/// Returns an error if capability manipulation syscalls fail.
pub fn drop_capabilities(keep: &[Capability]) -> Result<()> {
    let keep: CapsHashSet = keep.iter().copied().collect();
    tracing::info!(retained = keep.len(), "dropping capabilities");

    for cap in caps::all() {
        if keep.contains(&cap) {
            continue;
        }
        // Capabilities newer than the running kernel are absent already.
        if caps::has_cap(None, CapSet::Bounding, cap).unwrap_or(false) {
            caps::drop(None, CapSet::Bounding, cap).map_err(|e| DriverError::PermissionDenied {
                message: format!("dropping {cap} from bounding set: {e}"),
            })?;
        }
    }

    for set in [CapSet::Effective, CapSet::Permitted, CapSet::Inheritable] {
        let current = caps::read(None, set).map_err(|e| DriverError::PermissionDenied {
            message: format!("reading {set:?} capabilities: {e}"),
        })?;
        let narrowed: CapsHashSet = current.intersection(&keep).copied().collect();
        caps::set(None, set, &narrowed).map_err(|e| DriverError::PermissionDenied {
            message: format!("setting {set:?} capabilities: {e}"),
        })?;
    }

    tracing::debug!("capabilities dropped");
    Ok(())
}
