//! Container execution driver for the ctdriver workspace.
//!
//! Data flow: the [`driver::Driver`] receives a [`command::Command`], builds a
//! container handle through a [`backend::Session`], wires stdio with a
//! [`terminal::Terminal`], launches the init program inside the new
//! namespaces and blocks until it exits. The init program itself runs
//! [`init::run`] before replacing itself with the real entrypoint.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod command;
pub mod driver;
pub mod init;
pub mod quote;
pub mod terminal;
