//! Ambient host state probing.
//!
//! Read-only, side-effect-free checks of host configuration that decide
//! whether extra isolation steps are needed at launch. Read failures never
//! surface as errors: they collapse into the conservative answer.

use std::path::Path;

use ctdriver_common::constants::{APPARMOR_ENABLED, SELF_MOUNTINFO};

use crate::mountinfo;

/// Propagation verdict for the host's root mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// `/` belongs to a shared peer group.
    Shared,
    /// `/` is private or a slave.
    NotShared,
    /// The mount table could not be read or has no `/` row.
    Unknown,
}

impl Propagation {
    /// Whether launches must isolate mount propagation. `Unknown` is treated
    /// as shared.
    #[must_use]
    pub const fn is_shared(self) -> bool {
        !matches!(self, Self::NotShared)
    }
}

/// Derives the root propagation verdict from mountinfo contents.
#[must_use]
pub fn root_propagation(table: &str) -> Propagation {
    mountinfo::parse(table)
        .into_iter()
        .find(|m| m.mount_point == Path::new("/"))
        .map_or(Propagation::Unknown, |m| {
            if m.is_shared() {
                Propagation::Shared
            } else {
                Propagation::NotShared
            }
        })
}

/// Reads the mount table at `path` and derives the root propagation verdict.
#[must_use]
pub fn probe_root_propagation(path: &Path) -> Propagation {
    match std::fs::read_to_string(path) {
        Ok(table) => root_propagation(&table),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "mount table unreadable");
            Propagation::Unknown
        }
    }
}

/// Returns `true` unless this process's `/` is known not to be shared.
#[must_use]
pub fn root_is_shared() -> bool {
    let verdict = probe_root_propagation(Path::new(SELF_MOUNTINFO));
    tracing::debug!(?verdict, "probed root mount propagation");
    verdict.is_shared()
}

/// Returns `true` if the `AppArmor` switch file at `path` reads `Y`.
#[must_use]
pub fn apparmor_enabled_at(path: &Path) -> bool {
    std::fs::read_to_string(path).is_ok_and(|v| v.trim() == "Y")
}

/// Returns `true` if the kernel has `AppArmor` enabled.
#[must_use]
pub fn apparmor_enabled() -> bool {
    apparmor_enabled_at(Path::new(APPARMOR_ENABLED))
}
