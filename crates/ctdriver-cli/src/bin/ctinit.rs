//! # ctinit
//!
//! First program run inside every container. Applies the environment file,
//! hostname, network, capabilities, working directory and user, then
//! replaces itself with the entrypoint given after `--`.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

use std::convert::Infallible;
use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use ctdriver_common::constants::{DRIVER_NAME, ENV_FILE_MOUNT};
use ctdriver_core::network::InterfaceConfig;
use ctdriver_runtime::init::{self, InitConfig};
use tracing_subscriber::EnvFilter;

/// Single-dash long flags emitted by the driver.
const LONG_FLAGS: &[&str] = &["-driver", "-privileged", "-mtu"];

/// ctinit — container init.
#[derive(Parser, Debug)]
#[command(name = "ctinit", version, about, long_about = None)]
struct InitArgs {
    /// Driver that launched this container.
    #[arg(long, default_value = DRIVER_NAME)]
    driver: String,

    /// User to run as.
    #[arg(short = 'u')]
    user: Option<String>,

    /// Keep every capability.
    #[arg(long)]
    privileged: bool,

    /// Working directory.
    #[arg(short = 'w')]
    workdir: Option<PathBuf>,

    /// Interface address in `ip/prefix` form.
    #[arg(short = 'i')]
    ip: Option<String>,

    /// Default gateway.
    #[arg(short = 'g')]
    gateway: Option<String>,

    /// Interface MTU.
    #[arg(long)]
    mtu: Option<u32>,

    /// Environment file written by the driver.
    #[arg(long, default_value = ENV_FILE_MOUNT)]
    env_file: PathBuf,

    /// Entrypoint and its arguments.
    #[arg(last = true, required = true)]
    args: Vec<String>,
}

impl InitArgs {
    fn into_config(self) -> InitConfig {
        let mut config = InitConfig::new(self.driver, self.args);
        config.user = self.user;
        config.privileged = self.privileged;
        config.working_dir = self.workdir;
        config.network = InterfaceConfig {
            address: self.ip,
            gateway: self.gateway,
            mtu: self.mtu,
        };
        config.env_file = self.env_file;
        config
    }
}

/// Rewrites the driver's `-name` long flags to `--name` up to the `--`
/// separator.
fn normalize_flags<I: IntoIterator<Item = OsString>>(raw: I) -> Vec<OsString> {
    let mut past_separator = false;
    raw.into_iter()
        .map(|arg| {
            if past_separator {
                return arg;
            }
            if arg == "--" {
                past_separator = true;
                return arg;
            }
            match arg.to_str() {
                Some(flag) if LONG_FLAGS.contains(&flag) => OsString::from(format!("-{flag}")),
                _ => arg,
            }
        })
        .collect()
}

fn main() -> anyhow::Result<Infallible> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = InitArgs::parse_from(normalize_flags(std::env::args_os()));
    let config = args.into_config();
    init::run(&config).context("container init failed")
}
