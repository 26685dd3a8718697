//! # ctdriver-core
//!
//! Low-level Linux isolation primitives for the ctdriver execution driver.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: the clone mask applied to a new container process.
//! - **Filesystem**: bind mounts, propagation changes, `/proc` and root change.
//! - **Capabilities**: bounding/effective set reduction for least privilege.
//! - **Identity**: user/group resolution and switching.
//! - **Network**: in-container interface configuration.
//! - **Cgroups**: hierarchy discovery and per-container task lists.
//! - **Host probing**: mount propagation of `/` and MAC detection.
//!
//! The [`nix::Result`] functions in [`filesystem`] are meant to run between
//! `clone(2)` and `execve(2)`, so they report bare errnos and never log.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capability;
pub mod cgroup;
pub mod filesystem;
pub mod host;
pub mod mountinfo;
pub mod namespace;
pub mod network;
pub mod user;
