//! The command descriptor handed to the driver for one launch.

use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;

use ctdriver_common::types::ContainerId;
use serde::{Deserialize, Serialize};

use crate::terminal::Terminal;

/// A host path exposed inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Host-side source path.
    pub source: PathBuf,
    /// Absolute in-container destination.
    pub destination: PathBuf,
    /// Whether the container may write through the mount.
    pub writable: bool,
    /// Whether the mount should not propagate to peers.
    pub private: bool,
}

impl Mount {
    /// Creates a private mount.
    #[must_use]
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>, writable: bool) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            writable,
            private: true,
        }
    }
}

/// Precomputed address of the container's interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Interface address.
    pub ip_address: String,
    /// Prefix length of the interface network.
    pub ip_prefix_len: u8,
    /// Default gateway.
    pub gateway: String,
}

/// Precomputed network parameters passed through to the init program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Interface address and gateway, if the container has its own interface.
    pub interface: Option<NetworkInterface>,
    /// Link MTU.
    pub mtu: Option<u32>,
}

/// Caller-side stdio endpoints.
pub struct Pipes {
    /// Source of the container's standard input, if any.
    pub stdin: Option<Box<dyn Read + Send>>,
    /// Sink for the container's standard output.
    pub stdout: Box<dyn Write + Send>,
    /// Sink for the container's standard error.
    pub stderr: Box<dyn Write + Send>,
}

impl Pipes {
    /// Bundles caller endpoints.
    #[must_use]
    pub fn new(
        stdin: Option<Box<dyn Read + Send>>,
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
        }
    }

    /// Endpoints wired to this process's own stdio.
    #[must_use]
    pub fn inherit() -> Self {
        Self::new(
            Some(Box::new(std::io::stdin())),
            Box::new(std::io::stdout()),
            Box::new(std::io::stderr()),
        )
    }
}

impl fmt::Debug for Pipes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipes")
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

/// One launch request.
///
/// Caller-owned; the driver only fills in [`Command::path`],
/// [`Command::args`], [`Command::container_pid`], [`Command::console`] and
/// [`Command::terminal`] while running it.
#[derive(Debug)]
pub struct Command {
    /// Container identifier.
    pub id: ContainerId,
    /// Directory that becomes the container's `/`.
    pub rootfs: PathBuf,
    /// Program to run once init completes.
    pub entrypoint: String,
    /// Arguments of the entrypoint.
    pub arguments: Vec<String>,
    /// Environment, in order.
    pub env: Vec<(String, String)>,
    /// Mounts, in order. Later entries may shadow earlier ones.
    pub mounts: Vec<Mount>,
    /// Whether the container gets a pseudo-terminal.
    pub tty: bool,
    /// Host path of the console device for interactive containers.
    pub console: Option<PathBuf>,
    /// `user[:group]` to run the entrypoint as.
    pub user: Option<String>,
    /// Working directory of the entrypoint.
    pub working_dir: Option<PathBuf>,
    /// Whether the container keeps all capabilities.
    pub privileged: bool,
    /// Precomputed network parameters.
    pub network: Option<NetworkSettings>,
    /// In-container path of the init program; the driver default if unset.
    pub init_path: Option<PathBuf>,
    /// Resolved executable that was launched.
    pub path: PathBuf,
    /// Full argument vector that was launched.
    pub args: Vec<String>,
    /// Host pid of the container's first process once launched.
    pub container_pid: Option<u32>,
    /// Stdio wiring for this launch.
    pub terminal: Option<Box<dyn Terminal>>,
}

impl Command {
    /// Creates a non-interactive, unprivileged command with no mounts.
    #[must_use]
    pub fn new(
        id: ContainerId,
        rootfs: impl Into<PathBuf>,
        entrypoint: impl Into<String>,
        arguments: Vec<String>,
    ) -> Self {
        Self {
            id,
            rootfs: rootfs.into(),
            entrypoint: entrypoint.into(),
            arguments,
            env: Vec::new(),
            mounts: Vec::new(),
            tty: false,
            console: None,
            user: None,
            working_dir: None,
            privileged: false,
            network: None,
            init_path: None,
            path: PathBuf::new(),
            args: Vec::new(),
            container_pid: None,
            terminal: None,
        }
    }

    /// The environment as `KEY=VALUE` strings.
    #[must_use]
    pub fn env_strings(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_command_has_no_outputs() {
        let cmd = Command::new(ContainerId::new("c1"), "/rootfs", "sh", vec!["-c".into()]);
        assert!(cmd.container_pid.is_none());
        assert!(cmd.args.is_empty());
        assert!(cmd.path.as_os_str().is_empty());
        assert!(cmd.terminal.is_none());
    }

    #[test]
    fn env_strings_keep_order() {
        let mut cmd = Command::new(ContainerId::new("c1"), "/rootfs", "sh", vec![]);
        cmd.env = vec![("B".into(), "2".into()), ("A".into(), "1=1".into())];
        assert_eq!(cmd.env_strings(), vec!["B=2", "A=1=1"]);
    }
}
