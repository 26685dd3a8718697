//! `ctdriver probe` — Report what the driver sees of the host.

use std::path::Path;

use clap::Args;
use ctdriver_common::config::DriverConfig;
use ctdriver_common::constants::{DRIVER_NAME, REFERENCE_SUBSYSTEM, SELF_MOUNTINFO};
use ctdriver_core::cgroup::discovery::{self, CgroupVersion};
use ctdriver_core::host::{self, Propagation};

/// Arguments for the `probe` command.
#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Mount table to inspect.
    #[arg(long, default_value = SELF_MOUNTINFO)]
    pub mountinfo: std::path::PathBuf,
}

/// Builds the probe report from a mount table and the resolved config.
#[must_use]
pub fn report(table: Option<&str>, config: &DriverConfig) -> serde_json::Value {
    let propagation = table.map_or(Propagation::Unknown, host::root_propagation);
    let cgroup = table
        .and_then(|t| discovery::find_mountpoint(t, REFERENCE_SUBSYSTEM))
        .map(|m| {
            serde_json::json!({
                "path": m.path,
                "version": match m.version {
                    CgroupVersion::V1 => 1,
                    CgroupVersion::V2 => 2,
                },
            })
        });
    serde_json::json!({
        "driver": DRIVER_NAME,
        "root": config.root,
        "root_propagation": match propagation {
            Propagation::Shared => "shared",
            Propagation::NotShared => "private",
            Propagation::Unknown => "unknown",
        },
        "isolate_propagation": propagation.is_shared(),
        "apparmor": config.apparmor,
        "cgroup": cgroup,
    })
}

/// Executes the `probe` command.
///
/// # Errors
///
/// Returns an error if the report cannot be serialized.
pub fn execute(args: &ProbeArgs, config: &DriverConfig) -> anyhow::Result<()> {
    let table = read_table(&args.mountinfo);
    let value = report(table.as_deref(), config);
    let json = serde_json::to_string_pretty(&value)?;
    #[allow(clippy::print_stdout)]
    {
        println!("{json}");
    }
    Ok(())
}

fn read_table(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .map_err(|e| tracing::warn!(path = %path.display(), error = %e, "mount table unreadable"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
30 22 0:26 / /sys/fs/cgroup rw,nosuid shared:4 - cgroup2 cgroup2 rw
";

    #[test]
    fn report_reads_propagation_and_cgroup() {
        let value = report(Some(TABLE), &DriverConfig::default());
        assert_eq!(value["driver"], "native");
        assert_eq!(value["root_propagation"], "shared");
        assert_eq!(value["isolate_propagation"], true);
        assert_eq!(value["cgroup"]["path"], "/sys/fs/cgroup");
        assert_eq!(value["cgroup"]["version"], 2);
    }

    #[test]
    fn unreadable_table_reports_unknown() {
        let value = report(None, &DriverConfig::default());
        assert_eq!(value["root_propagation"], "unknown");
        assert_eq!(value["isolate_propagation"], true);
        assert!(value["cgroup"].is_null());
    }
}
