//! Driver facade: the container-lifecycle contract consumed by the daemon.
//!
//! [`Driver::run`] turns a [`Command`] into a configured container handle,
//! launches the init program inside it and blocks until it exits. The other
//! operations reopen the handle by ID and never block.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use ctdriver_common::config::DriverConfig;
use ctdriver_common::constants::{
    CONSOLE_MOUNT, DRIVER_NAME, ENV_FILE_MOUNT, ENV_FILE_NAME, REFERENCE_SUBSYSTEM, SELF_CGROUP,
    SELF_MOUNTINFO,
};
use ctdriver_common::error::{DriverError, Result};
use ctdriver_common::types::{ContainerId, ExitStatus, RunState};
use ctdriver_core::cgroup::ContainerCgroup;
use ctdriver_core::cgroup::tasks::read_pids;
use ctdriver_core::namespace::NamespaceConfig;
use serde::{Deserialize, Serialize};

use crate::backend::{ContainerHandle, CtOption, NativeSession, Session};
use crate::command::{Command, Mount, Pipes};
use crate::quote::shell_quote_arguments;
use crate::terminal::set_terminal;

/// Called once the container pid is known, before [`Driver::run`] blocks.
pub type StartCallback<'a> = &'a (dyn Fn(&Command) + Sync);

/// Snapshot of a container's run state. Never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Container identifier.
    pub id: ContainerId,
    /// State reported by the backend at query time.
    pub state: RunState,
}

impl ContainerInfo {
    /// Returns `true` if the container's process is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }
}

/// Host files consulted to locate container cgroups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    /// Mount table of this process.
    pub mountinfo: PathBuf,
    /// Cgroup membership of this process.
    pub cgroup: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            mountinfo: PathBuf::from(SELF_MOUNTINFO),
            cgroup: PathBuf::from(SELF_CGROUP),
        }
    }
}

/// The execution driver. Owns one backend session for its whole lifetime.
pub struct Driver {
    config: DriverConfig,
    session: Box<dyn Session>,
    shared_root: bool,
    host: HostPaths,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("config", &self.config)
            .field("shared_root", &self.shared_root)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Opens a native session and probes the host's root propagation once.
    #[must_use]
    pub fn new(config: DriverConfig) -> Self {
        let shared_root = ctdriver_core::host::root_is_shared();
        Self::with_session(config, Box::new(NativeSession::new()), shared_root)
    }

    /// Builds a driver over an existing session.
    #[must_use]
    pub fn with_session(config: DriverConfig, session: Box<dyn Session>, shared_root: bool) -> Self {
        tracing::info!(
            driver = DRIVER_NAME,
            root = %config.root.display(),
            apparmor = config.apparmor,
            shared_root,
            "driver initialized"
        );
        Self {
            config,
            session,
            shared_root,
            host: HostPaths::default(),
        }
    }

    /// Reads cgroup tables from `host` instead of this process's own.
    #[must_use]
    pub fn with_host_paths(mut self, host: HostPaths) -> Self {
        self.host = host;
        self
    }

    /// Configuration this driver runs with.
    #[must_use]
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Launches `command` and blocks until its process exits.
    ///
    /// Fills in the console, terminal, resolved path, argument vector and
    /// container pid of `command`. `on_start` runs once the pid is known.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration, the launch or the wait fails. No
    /// handle stays registered after an error.
    pub fn run(
        &self,
        command: &mut Command,
        pipes: Pipes,
        on_start: Option<StartCallback<'_>>,
    ) -> Result<ExitStatus> {
        // Claim the ID before writing anything under its container directory.
        let ct = self.session.create_ct(&command.id)?;
        let configured = set_terminal(command, pipes)
            .and_then(|()| self.generate_env_config(command))
            .and_then(|env_mount| configure(ct.as_ref(), command, &env_mount));
        if let Err(e) = configured {
            release(ct.as_ref());
            return Err(e);
        }

        let params = self.wrap_shared_root(self.init_params(command));
        let Some((name, rest)) = params.split_first() else {
            release(ct.as_ref());
            return Err(DriverError::Config {
                message: "empty launch command".into(),
            });
        };
        command.path = which::which(name).unwrap_or_else(|_| PathBuf::from(name));
        command.args = std::iter::once(name.clone())
            .chain(rest.iter().cloned())
            .collect();

        let launched = command
            .terminal
            .as_mut()
            .map_or(Ok(None), |terminal| terminal.attach())
            .and_then(|stdio| ct.run(&command.path, &command.args, &[], stdio));
        let pid = match launched {
            Ok(pid) => pid,
            Err(e) => {
                release(ct.as_ref());
                return Err(e);
            }
        };
        command.container_pid = Some(pid);
        tracing::info!(id = %command.id, pid, path = %command.path.display(), "container started");

        if let Some(on_start) = on_start {
            on_start(command);
        }

        let status = ct.wait();
        release(ct.as_ref());
        let status = status?;
        tracing::info!(id = %command.id, %status, "container finished");
        Ok(status)
    }

    /// Kills the container's process. The backend has a single kill
    /// primitive, so `signal` is only logged.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is unknown or the kill fails.
    pub fn kill(&self, id: &ContainerId, signal: i32) -> Result<()> {
        tracing::info!(id = %id, signal, "killing container");
        self.session.open_ct(id)?.kill()
    }

    /// Terminates the container's process.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is unknown or the kill fails.
    pub fn terminate(&self, id: &ContainerId) -> Result<()> {
        tracing::info!(id = %id, "terminating container");
        self.session.open_ct(id)?.kill()
    }

    /// Reports the container's run state. Unknown IDs and failed queries
    /// report [`RunState::Error`].
    #[must_use]
    pub fn info(&self, id: &ContainerId) -> ContainerInfo {
        let state = self
            .session
            .open_ct(id)
            .and_then(|ct| ct.state())
            .unwrap_or_else(|e| {
                tracing::debug!(id = %id, error = %e, "container state unavailable");
                RunState::Error
            });
        ContainerInfo {
            id: id.clone(),
            state,
        }
    }

    /// Lists the processes in the container's cgroup of the reference
    /// subsystem.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup cannot be located, the task file cannot
    /// be read, or a line of it is not a pid.
    pub fn pids_for_container(&self, id: &ContainerId) -> Result<Vec<u32>> {
        let cgroup = ContainerCgroup::locate_with(
            &self.host.mountinfo,
            &self.host.cgroup,
            REFERENCE_SUBSYSTEM,
            id.as_str(),
        )?;
        read_pids(&cgroup.task_file())
    }

    /// Writes the environment file and appends its mount to `command`.
    fn generate_env_config(&self, command: &mut Command) -> Result<Mount> {
        let data = serde_json::to_vec(&command.env_strings())?;
        let dir = self.config.container_dir(command.id.as_str());
        std::fs::create_dir_all(&dir).map_err(|e| DriverError::io(&dir, e))?;

        let path = dir.join(ENV_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| DriverError::io(&path, e))?;
        file.write_all(&data).map_err(|e| DriverError::io(&path, e))?;
        tracing::debug!(id = %command.id, path = %path.display(), "environment file written");

        Ok(Mount::new(path, ENV_FILE_MOUNT, false))
    }

    /// Argument vector of the init program.
    fn init_params(&self, command: &Command) -> Vec<String> {
        let init = command.init_path.as_ref().unwrap_or(&self.config.init_path);
        let mut params = vec![
            init.to_string_lossy().into_owned(),
            "-driver".to_string(),
            DRIVER_NAME.to_string(),
        ];

        if let Some(network) = &command.network {
            if let Some(interface) = &network.interface {
                params.extend([
                    "-g".to_string(),
                    interface.gateway.clone(),
                    "-i".to_string(),
                    format!("{}/{}", interface.ip_address, interface.ip_prefix_len),
                ]);
            }
            if let Some(mtu) = network.mtu {
                params.extend(["-mtu".to_string(), mtu.to_string()]);
            }
        }
        if let Some(user) = command.user.as_deref().filter(|u| !u.is_empty()) {
            params.extend(["-u".to_string(), user.to_string()]);
        }
        if command.privileged {
            if self.config.apparmor {
                params[0] = self.config.unconfined_launcher().to_string_lossy().into_owned();
            }
            params.push("-privileged".to_string());
        }
        if let Some(dir) = command
            .working_dir
            .as_deref()
            .filter(|d| !d.as_os_str().is_empty())
        {
            params.extend(["-w".to_string(), dir.to_string_lossy().into_owned()]);
        }

        params.push("--".to_string());
        params.push(command.entrypoint.clone());
        params.extend(command.arguments.iter().cloned());
        params
    }

    /// Re-executes `params` through a shell that first turns `/` into a
    /// slave mount in a fresh mount namespace. Only applies when the host
    /// root is shared.
    fn wrap_shared_root(&self, params: Vec<String>) -> Vec<String> {
        if !self.shared_root {
            return params;
        }
        let script = format!("mount --make-rslave /; exec {}", shell_quote_arguments(&params));
        ["unshare", "-m", "--", "/bin/sh", "-c"]
            .into_iter()
            .map(String::from)
            .chain(std::iter::once(script))
            .collect()
    }
}

/// Replays mounts, console last, then sets options, root and namespace mask.
fn configure(ct: &dyn ContainerHandle, command: &Command, env_mount: &Mount) -> Result<()> {
    for mount in command.mounts.iter().chain(std::iter::once(env_mount)) {
        tracing::debug!(
            id = %command.id,
            source = %mount.source.display(),
            destination = %mount.destination.display(),
            "adding mount"
        );
        ct.add_mount(mount)?;
    }
    if command.tty {
        let console = command.console.as_ref().ok_or_else(|| DriverError::Terminal {
            message: "interactive command without console".into(),
        })?;
        ct.add_mount(&Mount::new(console, CONSOLE_MOUNT, true))?;
    }
    ct.set_option(CtOption::AutoProcMount)?;
    ct.set_fs_root(&command.rootfs)?;
    ct.set_ns_mask(namespace_mask(command))?;
    Ok(())
}

/// Namespaces for `command`. Network parameters are only ever applied
/// inside a network namespace of the container's own.
fn namespace_mask(command: &Command) -> NamespaceConfig {
    NamespaceConfig {
        network: command.network.is_some(),
        ..NamespaceConfig::isolated()
    }
}

/// Tears down a handle after a failed or finished launch.
fn release(ct: &dyn ContainerHandle) {
    if let Err(e) = ct.destroy() {
        tracing::warn!(id = %ct.id(), error = %e, "container handle not released");
    }
}

/// Reads the environment file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a JSON array of
/// strings.
pub fn read_env_file(path: &Path) -> Result<Vec<String>> {
    let data = std::fs::read(path).map_err(|e| DriverError::io(path, e))?;
    Ok(serde_json::from_slice(&data)?)
}
