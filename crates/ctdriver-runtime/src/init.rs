//! The in-container init sequence.
//!
//! Runs as the first action of the container process: environment,
//! hostname, network, capabilities, working directory, identity, and
//! finally `execve(2)` of the real entrypoint. Each step's failure aborts
//! the sequence.

use std::convert::Infallible;
use std::ffi::CString;
use std::path::{Path, PathBuf};

use ctdriver_common::constants::{DEFAULT_SEARCH_PATH, ENV_FILE_MOUNT, EXIT_COMMAND_NOT_FOUND};
use ctdriver_common::error::{DriverError, Result};
use ctdriver_core::network::InterfaceConfig;

use crate::driver::read_env_file;

/// Parsed init flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitConfig {
    /// Driver that launched the container.
    pub driver: String,
    /// `user[:group]` to switch to.
    pub user: Option<String>,
    /// Keep every capability.
    pub privileged: bool,
    /// Directory to start the entrypoint in.
    pub working_dir: Option<PathBuf>,
    /// Interface parameters.
    pub network: InterfaceConfig,
    /// Entrypoint followed by its arguments.
    pub args: Vec<String>,
    /// Environment file written by the driver.
    pub env_file: PathBuf,
}

impl InitConfig {
    /// A config that only runs `args`.
    #[must_use]
    pub fn new(driver: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            driver: driver.into(),
            user: None,
            privileged: false,
            working_dir: None,
            network: InterfaceConfig::default(),
            args,
            env_file: PathBuf::from(ENV_FILE_MOUNT),
        }
    }
}

/// Overlays `KEY=VALUE` entries onto `base`, replacing existing keys in
/// place and appending new ones.
#[must_use]
pub fn overlay_env(base: Vec<(String, String)>, entries: &[String]) -> Vec<(String, String)> {
    let mut env = base;
    for entry in entries {
        let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        if key.is_empty() {
            continue;
        }
        match env.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value.to_string(),
            None => env.push((key.to_string(), value.to_string())),
        }
    }
    env
}

fn lookup<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
    env.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Resolves `program` on the `PATH` of `env`, relative to `cwd`.
#[must_use]
pub fn resolve_program(program: &str, env: &[(String, String)], cwd: &Path) -> Option<PathBuf> {
    let search = lookup(env, "PATH").unwrap_or(DEFAULT_SEARCH_PATH);
    which::which_in(program, Some(search), cwd).ok()
}

fn c_string(value: String) -> Result<CString> {
    CString::new(value).map_err(|e| DriverError::Config {
        message: format!("invalid exec string: {e}"),
    })
}

fn c_strings<I: IntoIterator<Item = String>>(items: I) -> Result<Vec<CString>> {
    items.into_iter().map(c_string).collect()
}

/// Runs the init sequence and replaces the process with the entrypoint.
///
/// Exits with status 127 if the entrypoint cannot be found.
///
/// # Errors
///
/// Returns the first failing step. Never returns on success.
pub fn run(config: &InitConfig) -> Result<Infallible> {
    tracing::debug!(driver = %config.driver, args = ?config.args, "init starting");
    let program = config.args.first().ok_or_else(|| DriverError::Config {
        message: "no entrypoint given".into(),
    })?;

    let entries = read_env_file(&config.env_file)?;
    let inherited = std::env::vars_os()
        .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
        .collect();
    let env = overlay_env(inherited, &entries);

    if let Some(hostname) = lookup(&env, "HOSTNAME").filter(|h| !h.is_empty()) {
        ctdriver_core::namespace::uts::set_hostname(hostname)?;
    }

    ctdriver_core::network::configure_interface(&config.network)?;

    if !config.privileged {
        let keep = ctdriver_core::capability::default_capabilities()?;
        ctdriver_core::capability::drop_capabilities(&keep)?;
    }

    if let Some(dir) = &config.working_dir {
        std::env::set_current_dir(dir).map_err(|e| DriverError::io(dir, e))?;
    }

    if let Some(user) = config.user.as_deref().filter(|u| !u.is_empty()) {
        let identity = ctdriver_core::user::resolve_identity(user)?;
        ctdriver_core::user::switch_identity(&identity)?;
    }

    let cwd = std::env::current_dir().map_err(|e| DriverError::io(".", e))?;
    let Some(path) = resolve_program(program, &env, &cwd) else {
        tracing::error!(program = %program, "unable to locate entrypoint");
        std::process::exit(EXIT_COMMAND_NOT_FOUND);
    };

    let c_path = c_string(path.to_string_lossy().into_owned())?;
    let argv = c_strings(config.args.iter().cloned())?;
    let envp = c_strings(env.into_iter().map(|(k, v)| format!("{k}={v}")))?;
    tracing::debug!(path = %path.display(), "executing entrypoint");

    let errno = match nix::unistd::execve(&c_path, &argv, &envp) {
        Ok(never) => match never {},
        Err(errno) => errno,
    };
    Err(DriverError::Backend {
        operation: "exec",
        message: format!("unable to execute {}: {errno}", path.display()),
    })
}
