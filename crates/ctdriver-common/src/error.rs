//! Unified error types for the ctdriver workspace.
//!
//! Every fallible operation in the isolation layer, the backend and the
//! driver facade reports one of these variants so that callers can tell a
//! missing container apart from a failed syscall.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum DriverError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A resource with the same identifier is already registered.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Type of the duplicated resource.
        kind: &'static str,
        /// Identifier of the duplicated resource.
        id: String,
    },

    /// A permission or capability error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// The isolation backend rejected an operation.
    #[error("{operation} failed: {message}")]
    Backend {
        /// Backend operation that failed.
        operation: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// A cgroup task list contained something other than a process id.
    #[error("invalid pid '{value}': {source}")]
    InvalidPid {
        /// The offending line of the task file.
        value: String,
        /// Underlying parse error.
        source: std::num::ParseIntError,
    },

    /// Terminal or stdio wiring failed.
    #[error("terminal error: {message}")]
    Terminal {
        /// Description of the failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl DriverError {
    /// Shorthand for an I/O error tied to a path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` when the error reports an unknown resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, DriverError>;
