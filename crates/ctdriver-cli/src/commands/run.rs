//! `ctdriver run` — Run a command in a new container and wait for it.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Args;
use ctdriver_common::config::DriverConfig;
use ctdriver_common::types::{ContainerId, ExitStatus};
use ctdriver_runtime::command::{Command, Mount, Pipes};
use ctdriver_runtime::driver::Driver;

/// Name of the init binary shipped next to `ctdriver`.
const INIT_BINARY: &str = "ctinit";

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Container ID. A random one is generated when omitted.
    #[arg(long)]
    pub id: Option<String>,

    /// Environment variable, repeatable.
    #[arg(short, long, value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Bind mount, repeatable. Read-write unless suffixed with `:ro`.
    #[arg(short, long, value_name = "SRC:DEST[:ro|rw]")]
    pub volume: Vec<String>,

    /// Allocate a pseudo-terminal.
    #[arg(short, long)]
    pub tty: bool,

    /// User to run as (`name`, `uid`, `name:group` or `uid:gid`).
    #[arg(short, long)]
    pub user: Option<String>,

    /// Working directory inside the container.
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,

    /// Keep all capabilities.
    #[arg(long)]
    pub privileged: bool,

    /// Container hostname.
    #[arg(long)]
    pub hostname: Option<String>,

    /// Host path of the init binary. Defaults to `ctinit` next to this
    /// executable.
    #[arg(long, value_name = "PATH")]
    pub init: Option<PathBuf>,

    /// Directory that becomes the container's root.
    pub rootfs: PathBuf,

    /// Entrypoint and its arguments.
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Parses a `KEY=VALUE` pair.
///
/// # Errors
///
/// Returns an error if the `=` or the key is missing.
pub fn parse_env(raw: &str) -> anyhow::Result<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(anyhow::anyhow!("invalid environment variable '{raw}', expected KEY=VALUE")),
    }
}

/// Parses a `SRC:DEST[:ro|rw]` volume.
///
/// # Errors
///
/// Returns an error if either path is missing, the destination is relative
/// or the mode is unknown.
pub fn parse_volume(raw: &str) -> anyhow::Result<Mount> {
    let mut parts = raw.split(':');
    let (Some(source), Some(destination)) = (parts.next(), parts.next()) else {
        return Err(anyhow::anyhow!("invalid volume '{raw}', expected SRC:DEST"));
    };
    let writable = match parts.next() {
        None | Some("rw") => true,
        Some("ro") => false,
        Some(mode) => return Err(anyhow::anyhow!("invalid volume mode '{mode}' in '{raw}'")),
    };
    if parts.next().is_some() || source.is_empty() || !destination.starts_with('/') {
        return Err(anyhow::anyhow!("invalid volume '{raw}'"));
    }
    Ok(Mount::new(source, destination, writable))
}

fn default_init_binary() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe()
        .map_err(|e| anyhow::anyhow!("locating {INIT_BINARY}: {e}"))?;
    Ok(exe.with_file_name(INIT_BINARY))
}

/// Maps a container exit status onto a process exit byte. Codes outside
/// `0..=255` become 1.
#[must_use]
pub fn exit_byte(status: ExitStatus) -> u8 {
    u8::try_from(status.code()).unwrap_or(1)
}

/// Builds the launch request from the parsed arguments.
///
/// # Errors
///
/// Returns an error if an environment variable or volume is malformed.
pub fn build_command(args: RunArgs, config: &DriverConfig, init_binary: PathBuf) -> anyhow::Result<Command> {
    let id = args.id.map_or_else(ContainerId::generate, ContainerId::new);
    let mut argv = args.command.into_iter();
    let entrypoint = argv
        .next()
        .ok_or_else(|| anyhow::anyhow!("no command given"))?;

    let mut command = Command::new(id, args.rootfs, entrypoint, argv.collect());
    command.env = args
        .env
        .iter()
        .map(|e| parse_env(e))
        .collect::<anyhow::Result<_>>()?;
    if let Some(hostname) = args.hostname {
        command.env.push(("HOSTNAME".to_string(), hostname));
    }
    command.mounts = args
        .volume
        .iter()
        .map(|v| parse_volume(v))
        .collect::<anyhow::Result<_>>()?;
    command
        .mounts
        .push(Mount::new(init_binary, config.init_path.clone(), false));
    command.tty = args.tty;
    command.user = args.user;
    command.working_dir = args.workdir;
    command.privileged = args.privileged;
    Ok(command)
}

/// Executes the `run` command.
///
/// # Errors
///
/// Returns an error if the arguments are invalid or the launch fails.
pub fn execute(mut args: RunArgs, config: DriverConfig) -> anyhow::Result<ExitCode> {
    let init_binary = match args.init.take() {
        Some(path) => path,
        None => default_init_binary()?,
    };
    let mut command = build_command(args, &config, init_binary)?;
    let driver = Arc::new(Driver::new(config));

    let handler_driver = Arc::clone(&driver);
    let handler_id = command.id.clone();
    ctrlc::set_handler(move || {
        if let Err(e) = handler_driver.terminate(&handler_id) {
            tracing::warn!(id = %handler_id, error = %e, "could not terminate container");
        }
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;

    let on_start = |cmd: &Command| {
        tracing::info!(id = %cmd.id, pid = ?cmd.container_pid, args = ?cmd.args, "container running");
    };
    let status = driver
        .run(&mut command, Pipes::inherit(), Some(&on_start))
        .map_err(|e| anyhow::anyhow!("running container {}: {e}", command.id))?;
    if status.success() {
        tracing::info!(id = %command.id, %status, "container exited");
    } else {
        tracing::warn!(id = %command.id, %status, "container exited with failure");
    }
    Ok(ExitCode::from(exit_byte(status)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_splits_on_first_equals() {
        assert_eq!(
            parse_env("OPTS=a=b").expect("env"),
            ("OPTS".to_string(), "a=b".to_string())
        );
        assert_eq!(parse_env("EMPTY=").expect("env").1, "");
        assert!(parse_env("NOVALUE").is_err());
        assert!(parse_env("=x").is_err());
    }

    #[test]
    fn parse_volume_modes() {
        assert_eq!(
            parse_volume("/srv:/data").expect("volume"),
            Mount::new("/srv", "/data", true)
        );
        assert_eq!(
            parse_volume("/etc/hosts:/etc/hosts:ro").expect("volume"),
            Mount::new("/etc/hosts", "/etc/hosts", false)
        );
        assert!(parse_volume("/srv").is_err());
        assert!(parse_volume("/srv:data").is_err());
        assert!(parse_volume("/srv:/data:rx").is_err());
        assert!(parse_volume("/a:/b:ro:extra").is_err());
    }

    #[test]
    fn exit_codes_follow_shell_convention() {
        assert_eq!(exit_byte(ExitStatus::Exited(0)), 0);
        assert_eq!(exit_byte(ExitStatus::Exited(3)), 3);
        assert_eq!(exit_byte(ExitStatus::Signaled(9)), 137);
        assert_eq!(exit_byte(ExitStatus::Exited(-1)), 1);
    }

    #[test]
    fn build_command_mounts_init_last() {
        let args = RunArgs {
            id: Some("web".into()),
            env: vec!["A=1".into()],
            volume: vec!["/srv:/data:ro".into()],
            tty: false,
            user: Some("1000".into()),
            workdir: Some(PathBuf::from("/data")),
            privileged: false,
            hostname: Some("web".into()),
            init: None,
            rootfs: PathBuf::from("/rootfs"),
            command: vec!["nginx".into(), "-g".into(), "daemon off;".into()],
        };
        let config = DriverConfig::default();
        let cmd = build_command(args, &config, PathBuf::from("/usr/libexec/ctinit")).expect("build");

        assert_eq!(cmd.id.as_str(), "web");
        assert_eq!(cmd.entrypoint, "nginx");
        assert_eq!(cmd.arguments, vec!["-g", "daemon off;"]);
        assert_eq!(
            cmd.env,
            vec![
                ("A".to_string(), "1".to_string()),
                ("HOSTNAME".to_string(), "web".to_string()),
            ]
        );
        assert_eq!(
            cmd.mounts,
            vec![
                Mount::new("/srv", "/data", false),
                Mount::new("/usr/libexec/ctinit", "/.ctinit", false),
            ]
        );
        assert_eq!(cmd.user.as_deref(), Some("1000"));
    }
}
