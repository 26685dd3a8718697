//! Configuration model for the execution driver.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

/// Root configuration for one driver instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Driver root: per-container files live under `<root>/containers/<id>`.
    pub root: PathBuf,
    /// Whether mandatory access control (`AppArmor`) integration is enabled.
    pub apparmor: bool,
    /// Path of the init program as seen from inside the container.
    pub init_path: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(crate::constants::DEFAULT_DRIVER_ROOT),
            apparmor: false,
            init_path: PathBuf::from(crate::constants::DEFAULT_INIT_PATH),
        }
    }
}

impl DriverConfig {
    /// Loads a configuration from a JSON file. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| DriverError::io(path, e))?;
        let config = serde_json::from_str(&data)?;
        Ok(config)
    }

    /// Directory holding the generated files of one container.
    #[must_use]
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.root.join(crate::constants::CONTAINERS_DIR).join(id)
    }

    /// Path of the unconfined launcher used for privileged containers.
    #[must_use]
    pub fn unconfined_launcher(&self) -> PathBuf {
        self.root.join(crate::constants::UNCONFINED_LAUNCHER)
    }
}
