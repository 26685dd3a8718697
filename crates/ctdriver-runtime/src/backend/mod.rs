//! Isolation backend contract.
//!
//! A [`Session`] is the driver's single handle to the backend; every
//! [`ContainerHandle`] is created or reopened through it. Handles accumulate
//! configuration, then [`ContainerHandle::run`] is the only call that spawns
//! a process.

pub mod native;

use std::path::Path;

use ctdriver_common::error::Result;
use ctdriver_common::types::{ContainerId, ExitStatus, RunState};
use ctdriver_core::namespace::NamespaceConfig;

use crate::command::Mount;
use crate::terminal::ChildStdio;

pub use native::NativeSession;

/// Coarse launch options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtOption {
    /// Mount a fresh `/proc` inside the container root before exec.
    AutoProcMount,
}

/// One container's isolation configuration and, once launched, its process.
pub trait ContainerHandle: Send + Sync {
    /// Identifier the handle is registered under.
    fn id(&self) -> &ContainerId;

    /// Appends a mount. Mounts are applied in the order they were added.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle was already launched or the mount is
    /// invalid.
    fn add_mount(&self, mount: &Mount) -> Result<()>;

    /// Enables a launch option.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle was already launched.
    fn set_option(&self, option: CtOption) -> Result<()>;

    /// Sets the directory that becomes the container's `/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle was already launched.
    fn set_fs_root(&self, root: &Path) -> Result<()>;

    /// Sets the namespaces the process is created in.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle was already launched.
    fn set_ns_mask(&self, mask: NamespaceConfig) -> Result<()>;

    /// Launches `path` with `argv` and `env` inside the configured
    /// isolation. Without `stdio`, the process uses the mounted console as
    /// its controlling terminal.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is not fully configured, was already
    /// launched, or the process fails before exec.
    fn run(&self, path: &Path, argv: &[String], env: &[String], stdio: Option<ChildStdio>)
    -> Result<u32>;

    /// Blocks until the launched process exits.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing was launched or reaping fails.
    fn wait(&self) -> Result<ExitStatus>;

    /// Reports whether the launched process is alive.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be determined.
    fn state(&self) -> Result<RunState>;

    /// Kills the launched process.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing was launched or the signal fails.
    fn kill(&self) -> Result<()>;

    /// Unregisters the handle and releases its resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle's resources cannot be released.
    fn destroy(&self) -> Result<()>;
}

/// Process-wide handle to the isolation backend.
pub trait Session: Send + Sync {
    /// Registers a new handle for `id`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if a handle for `id` is registered.
    fn create_ct(&self, id: &ContainerId) -> Result<Box<dyn ContainerHandle>>;

    /// Reopens the handle registered for `id`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no handle is registered for `id`.
    fn open_ct(&self, id: &ContainerId) -> Result<Box<dyn ContainerHandle>>;
}
