//! Filesystem setup for container isolation.
//!
//! Mount-table changes and root switching performed inside a freshly cloned
//! mount namespace, plus the host-side preparation of mount targets.

pub mod mount;
pub mod root;
