//! `ctdriver pids` — List the processes of a container's cgroup.

use clap::Args;
use ctdriver_common::config::DriverConfig;
use ctdriver_common::types::ContainerId;
use ctdriver_runtime::driver::Driver;

/// Arguments for the `pids` command.
#[derive(Args, Debug)]
pub struct PidsArgs {
    /// Container ID.
    pub id: String,
}

/// Renders one PID per line.
#[must_use]
pub fn render(pids: &[u32]) -> String {
    pids.iter().map(|p| format!("{p}\n")).collect()
}

/// Executes the `pids` command.
///
/// # Errors
///
/// Returns an error if the container's cgroup cannot be located or its
/// task file cannot be read.
pub fn execute(args: &PidsArgs, config: &DriverConfig) -> anyhow::Result<()> {
    let id = ContainerId::new(args.id.clone());
    let driver = Driver::new(config.clone());
    let pids = driver
        .pids_for_container(&id)
        .map_err(|e| anyhow::anyhow!("listing processes of {id}: {e}"))?;
    #[allow(clippy::print_stdout)]
    {
        print!("{}", render(&pids));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_lists_one_pid_per_line() {
        assert_eq!(render(&[1, 42]), "1\n42\n");
        assert_eq!(render(&[]), "");
    }
}
