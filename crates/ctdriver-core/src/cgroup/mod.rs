//! Cgroup discovery and per-container groups.
//!
//! Containers are grouped under the calling process's own cgroup in the
//! hierarchy of the reference subsystem: `<mount>/<this cgroup dir>/<id>`.

pub mod discovery;
pub mod tasks;

use std::io::ErrorKind;
use std::time::Duration;

use ctdriver_common::error::{DriverError, Result};

pub use discovery::{CgroupMount, CgroupVersion, ContainerCgroup};

/// How many times `destroy` checks for members before giving up.
const DRAIN_ATTEMPTS: u32 = 25;
/// Pause between those checks.
const DRAIN_INTERVAL: Duration = Duration::from_millis(20);

/// Handle to the cgroup of a specific container.
#[derive(Debug)]
pub struct CgroupManager {
    cgroup: ContainerCgroup,
}

impl CgroupManager {
    /// Creates the cgroup directory for the given container ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the hierarchy cannot be located or the directory
    /// cannot be created.
    pub fn create(container_id: &str) -> Result<Self> {
        Self::create_at(ContainerCgroup::locate(container_id)?)
    }

    /// Creates the cgroup directory at an already located path.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create_at(cgroup: ContainerCgroup) -> Result<Self> {
        std::fs::create_dir_all(&cgroup.dir).map_err(|e| DriverError::io(&cgroup.dir, e))?;
        tracing::info!(path = %cgroup.dir.display(), "cgroup created");
        Ok(Self { cgroup })
    }

    /// Location of this cgroup.
    #[must_use]
    pub const fn cgroup(&self) -> &ContainerCgroup {
        &self.cgroup
    }

    /// Adds a process to this cgroup by writing its PID to the task file.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to the task file fails.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        let path = self.cgroup.task_file();
        std::fs::write(&path, pid.to_string()).map_err(|e| DriverError::io(&path, e))?;
        tracing::debug!(pid, "added process to cgroup");
        Ok(())
    }

    /// Lists the processes currently in this cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the task file cannot be read or parsed.
    pub fn pids(&self) -> Result<Vec<u32>> {
        tasks::read_pids(&self.cgroup.task_file())
    }

    /// Removes the cgroup directory.
    ///
    /// The kernel refuses while members remain, and a reaped process can
    /// linger in the task file for a moment, so this waits for the group to
    /// drain before each attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed once
    /// the retries run out.
    pub fn destroy(&self) -> Result<()> {
        let dir = &self.cgroup.dir;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let exhausted = attempt >= DRAIN_ATTEMPTS;
            let members = self.pids().map_or(0, |pids| pids.len());
            if members == 0 || exhausted {
                match std::fs::remove_dir(dir) {
                    Ok(()) => break,
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                    Err(e) if !exhausted && still_populated(&e) => {}
                    Err(e) => return Err(DriverError::io(dir, e)),
                }
            }
            tracing::debug!(path = %dir.display(), members, attempt, "waiting for cgroup to drain");
            std::thread::sleep(DRAIN_INTERVAL);
        }
        tracing::info!(path = %dir.display(), "cgroup destroyed");
        Ok(())
    }
}

fn still_populated(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::ResourceBusy | ErrorKind::DirectoryNotEmpty
    )
}
