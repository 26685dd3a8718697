//! Cgroup hierarchy discovery.
//!
//! Finds where the reference subsystem is mounted and which sub-path of that
//! hierarchy the calling process belongs to. Hosts without a v1 mount of the
//! subsystem fall back to the unified (v2) hierarchy.

use std::path::{Path, PathBuf};

use ctdriver_common::constants::{CGROUP_V1_TASKS, CGROUP_V2_PROCS};
use ctdriver_common::error::{DriverError, Result};

use crate::mountinfo;

/// Cgroup hierarchy flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    /// Per-subsystem hierarchy (`cgroup` filesystem).
    V1,
    /// Unified hierarchy (`cgroup2` filesystem).
    V2,
}

impl CgroupVersion {
    /// File listing the member processes of a cgroup directory.
    #[must_use]
    pub const fn task_file(self) -> &'static str {
        match self {
            Self::V1 => CGROUP_V1_TASKS,
            Self::V2 => CGROUP_V2_PROCS,
        }
    }
}

/// A mounted cgroup hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupMount {
    /// Mount point of the hierarchy.
    pub path: PathBuf,
    /// Hierarchy flavour.
    pub version: CgroupVersion,
}

/// Locates the hierarchy carrying `subsystem` in a mountinfo table.
///
/// A v1 mount whose super options list the subsystem wins; otherwise the
/// first `cgroup2` mount is returned.
#[must_use]
pub fn find_mountpoint(table: &str, subsystem: &str) -> Option<CgroupMount> {
    let mounts = mountinfo::parse(table);

    let v1 = mounts
        .iter()
        .find(|m| m.fs_type == "cgroup" && m.super_options().any(|o| o == subsystem));
    if let Some(m) = v1 {
        return Some(CgroupMount {
            path: m.mount_point.clone(),
            version: CgroupVersion::V1,
        });
    }

    mounts
        .iter()
        .find(|m| m.fs_type == "cgroup2")
        .map(|m| CgroupMount {
            path: m.mount_point.clone(),
            version: CgroupVersion::V2,
        })
}

/// Resolves this process's sub-path within a hierarchy from a
/// `/proc/self/cgroup` listing (`hierarchy-id:controllers:path` rows).
#[must_use]
pub fn this_cgroup_dir(listing: &str, version: CgroupVersion, subsystem: &str) -> Option<String> {
    listing.lines().find_map(|line| {
        let mut parts = line.splitn(3, ':');
        let hierarchy = parts.next()?;
        let controllers = parts.next()?;
        let path = parts.next()?;
        let matches = match version {
            CgroupVersion::V1 => controllers.split(',').any(|c| c == subsystem),
            CgroupVersion::V2 => hierarchy == "0" && controllers.is_empty(),
        };
        matches.then(|| path.to_string())
    })
}

/// Location of one container's cgroup directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerCgroup {
    /// Absolute path of the container's cgroup directory.
    pub dir: PathBuf,
    /// Hierarchy flavour.
    pub version: CgroupVersion,
}

impl ContainerCgroup {
    /// Joins `<mount>/<this cgroup dir>/<id>`.
    #[must_use]
    pub fn new(mount: &CgroupMount, this_dir: &str, id: &str) -> Self {
        Self {
            dir: mount.path.join(this_dir.trim_start_matches('/')).join(id),
            version: mount.version,
        }
    }

    /// Locates the cgroup of container `id` using the given process tables.
    ///
    /// # Errors
    ///
    /// Returns an error if either table cannot be read or does not mention
    /// the subsystem.
    pub fn locate_with(
        mountinfo_path: &Path,
        cgroup_path: &Path,
        subsystem: &str,
        id: &str,
    ) -> Result<Self> {
        let table = std::fs::read_to_string(mountinfo_path)
            .map_err(|e| DriverError::io(mountinfo_path, e))?;
        let mount = find_mountpoint(&table, subsystem).ok_or_else(|| DriverError::NotFound {
            kind: "cgroup mountpoint",
            id: subsystem.to_string(),
        })?;

        let listing =
            std::fs::read_to_string(cgroup_path).map_err(|e| DriverError::io(cgroup_path, e))?;
        let this_dir = this_cgroup_dir(&listing, mount.version, subsystem).ok_or_else(|| {
            DriverError::NotFound {
                kind: "cgroup membership",
                id: subsystem.to_string(),
            }
        })?;

        Ok(Self::new(&mount, &this_dir, id))
    }

    /// Locates the cgroup of container `id` for the calling process.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference subsystem cannot be located.
    pub fn locate(id: &str) -> Result<Self> {
        use ctdriver_common::constants::{REFERENCE_SUBSYSTEM, SELF_CGROUP, SELF_MOUNTINFO};

        Self::locate_with(
            Path::new(SELF_MOUNTINFO),
            Path::new(SELF_CGROUP),
            REFERENCE_SUBSYSTEM,
            id,
        )
    }

    /// Path of the member list file.
    #[must_use]
    pub fn task_file(&self) -> PathBuf {
        self.dir.join(self.version.task_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V1_TABLE: &str = "\
22 1 8:1 / / rw shared:1 - ext4 /dev/sda1 rw
30 22 0:26 / /sys/fs/cgroup/memory rw master:3 - cgroup cgroup rw,memory
31 22 0:27 / /sys/fs/cgroup/cpu,cpuacct rw master:4 - cgroup cgroup rw,cpu,cpuacct
";

    const V2_TABLE: &str = "\
22 1 8:1 / / rw shared:1 - ext4 /dev/sda1 rw
35 22 0:30 / /sys/fs/cgroup rw,nosuid shared:9 - cgroup2 cgroup2 rw,nsdelegate
";

    #[test]
    fn finds_v1_subsystem_mount() {
        let mount = find_mountpoint(V1_TABLE, "cpu").expect("cpu mount");
        assert_eq!(mount.path, PathBuf::from("/sys/fs/cgroup/cpu,cpuacct"));
        assert_eq!(mount.version, CgroupVersion::V1);
    }

    #[test]
    fn falls_back_to_unified_hierarchy() {
        let mount = find_mountpoint(V2_TABLE, "cpu").expect("unified mount");
        assert_eq!(mount.path, PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(mount.version, CgroupVersion::V2);
    }

    #[test]
    fn no_cgroup_mount_at_all() {
        let table = "22 1 8:1 / / rw shared:1 - ext4 /dev/sda1 rw\n";
        assert!(find_mountpoint(table, "cpu").is_none());
    }

    #[test]
    fn this_dir_for_v1_matches_controller_list() {
        let listing = "\
5:memory:/system.slice/ctd.service
4:cpu,cpuacct:/system.slice
0::/user.slice
";
        assert_eq!(
            this_cgroup_dir(listing, CgroupVersion::V1, "cpu").as_deref(),
            Some("/system.slice")
        );
        assert_eq!(
            this_cgroup_dir(listing, CgroupVersion::V2, "cpu").as_deref(),
            Some("/user.slice")
        );
    }

    #[test]
    fn container_dir_does_not_discard_mount_prefix() {
        let mount = CgroupMount {
            path: PathBuf::from("/sys/fs/cgroup/cpu"),
            version: CgroupVersion::V1,
        };
        let cg = ContainerCgroup::new(&mount, "/system.slice", "abc");
        assert_eq!(cg.dir, PathBuf::from("/sys/fs/cgroup/cpu/system.slice/abc"));
        assert_eq!(
            cg.task_file(),
            PathBuf::from("/sys/fs/cgroup/cpu/system.slice/abc/tasks")
        );
    }

    #[test]
    fn locate_with_reads_both_tables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mi = dir.path().join("mountinfo");
        let cg = dir.path().join("cgroup");
        std::fs::write(&mi, V2_TABLE).expect("write");
        std::fs::write(&cg, "0::/\n").expect("write");

        let located = ContainerCgroup::locate_with(&mi, &cg, "cpu", "abc").expect("locate");
        assert_eq!(located.dir, PathBuf::from("/sys/fs/cgroup/abc"));
        assert_eq!(
            located.task_file(),
            PathBuf::from("/sys/fs/cgroup/abc/cgroup.procs")
        );
    }

    #[test]
    fn locate_with_missing_mount_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mi = dir.path().join("mountinfo");
        let cg = dir.path().join("cgroup");
        std::fs::write(&mi, "22 1 8:1 / / rw - ext4 /dev/sda1 rw\n").expect("write");
        std::fs::write(&cg, "0::/\n").expect("write");

        let err = ContainerCgroup::locate_with(&mi, &cg, "cpu", "abc").unwrap_err();
        assert!(err.is_not_found());
    }
}
