//! CLI command definitions and dispatch.

pub mod pids;
pub mod probe;
pub mod run;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use ctdriver_common::config::DriverConfig;

/// ctdriver — run commands in isolated containers.
#[derive(Parser, Debug)]
#[command(name = "ctdriver", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Driver-wide settings.
    #[command(flatten)]
    pub global: GlobalArgs,
}

/// Settings shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Driver root directory for generated per-container files.
    #[arg(long, global = true, env = "CTDRIVER_ROOT")]
    pub root: Option<PathBuf>,

    /// JSON driver configuration file.
    #[arg(long, global = true, env = "CTDRIVER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Force `AppArmor` integration on or off instead of detecting it.
    #[arg(long, global = true)]
    pub apparmor: Option<bool>,
}

impl GlobalArgs {
    /// Builds the driver configuration: file, then flags, then detection.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be loaded.
    pub fn driver_config(&self) -> anyhow::Result<DriverConfig> {
        let mut config = match &self.config {
            Some(path) => DriverConfig::load(path)
                .map_err(|e| anyhow::anyhow!("loading {}: {e}", path.display()))?,
            None => DriverConfig::default(),
        };
        if let Some(root) = &self.root {
            config.root.clone_from(root);
        }
        config.apparmor = self
            .apparmor
            .unwrap_or_else(|| config.apparmor || ctdriver_core::host::apparmor_enabled());
        Ok(config)
    }
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command in a new container and wait for it.
    Run(run::RunArgs),
    /// List the processes of a container's cgroup.
    Pids(pids::PidsArgs),
    /// Report host propagation, cgroup and MAC probe results.
    Probe(probe::ProbeArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = cli.global.driver_config()?;
    match cli.command {
        Command::Run(args) => run::execute(args, config),
        Command::Pids(args) => pids::execute(&args, &config).map(|()| ExitCode::SUCCESS),
        Command::Probe(args) => probe::execute(&args, &config).map(|()| ExitCode::SUCCESS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_with_trailing_command() {
        let cli = Cli::try_parse_from([
            "ctdriver", "--root", "/tmp/ct", "run", "-e", "A=1", "/rootfs", "--", "sh", "-c",
            "echo hi",
        ])
        .expect("parse");
        assert_eq!(cli.global.root, Some(PathBuf::from("/tmp/ct")));
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.rootfs, PathBuf::from("/rootfs"));
                assert_eq!(args.command, vec!["sh", "-c", "echo hi"]);
                assert_eq!(args.env, vec!["A=1"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("driver.json");
        std::fs::write(&file, r#"{"root": "/from/file", "apparmor": true}"#).expect("write");

        let global = GlobalArgs {
            root: Some(PathBuf::from("/from/flag")),
            config: Some(file),
            apparmor: Some(false),
        };
        let config = global.driver_config().expect("config");
        assert_eq!(config.root, PathBuf::from("/from/flag"));
        assert!(!config.apparmor);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let global = GlobalArgs {
            config: Some(PathBuf::from("/no/such/driver.json")),
            ..GlobalArgs::default()
        };
        assert!(global.driver_config().is_err());
    }
}
