//! Namespace masks for new container processes.
//!
//! The mask is consumed by `clone(2)`; each enabled facility gives the child
//! its own view of that kernel resource.

pub mod uts;

use std::fmt;

use nix::sched::CloneFlags;

/// Which namespaces a new container process is created in.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceConfig {
    /// Isolate PID namespace.
    pub pid: bool,
    /// Isolate mount namespace.
    pub mount: bool,
    /// Isolate network namespace.
    pub network: bool,
    /// Isolate user namespace.
    pub user: bool,
    /// Isolate IPC namespace.
    pub ipc: bool,
    /// Isolate UTS (hostname) namespace.
    pub uts: bool,
}

impl NamespaceConfig {
    /// Mount, PID and UTS isolation: a private mount view, its own PID 1,
    /// and a hostname that cannot leak to the host.
    #[must_use]
    pub const fn isolated() -> Self {
        Self {
            pid: true,
            mount: true,
            network: false,
            user: false,
            ipc: false,
            uts: true,
        }
    }

    /// Translates the mask into `clone(2)` flags.
    #[must_use]
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        let table = [
            (self.pid, CloneFlags::CLONE_NEWPID),
            (self.mount, CloneFlags::CLONE_NEWNS),
            (self.network, CloneFlags::CLONE_NEWNET),
            (self.user, CloneFlags::CLONE_NEWUSER),
            (self.ipc, CloneFlags::CLONE_NEWIPC),
            (self.uts, CloneFlags::CLONE_NEWUTS),
        ];
        for (enabled, flag) in table {
            if enabled {
                flags |= flag;
            }
        }
        flags
    }
}

impl fmt::Display for NamespaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.mount, "mnt"),
            (self.pid, "pid"),
            (self.network, "net"),
            (self.user, "user"),
            (self.ipc, "ipc"),
            (self.uts, "uts"),
        ];
        let enabled: Vec<&str> = names.iter().filter(|(on, _)| *on).map(|(_, n)| *n).collect();
        if enabled.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", enabled.join("|"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolated_mask_contains_mount_and_pid() {
        let flags = NamespaceConfig::isolated().clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn empty_mask_has_no_flags() {
        assert!(NamespaceConfig::default().clone_flags().is_empty());
        assert_eq!(NamespaceConfig::default().to_string(), "none");
    }

    #[test]
    fn display_lists_enabled_namespaces() {
        assert_eq!(NamespaceConfig::isolated().to_string(), "mnt|pid|uts");
    }
}
