//! In-container network interface configuration.
//!
//! Applies precomputed parameters (address, gateway, MTU) to the container's
//! interface with `ip(8)`; allocating those parameters is the caller's job.

use std::net::IpAddr;
use std::process::Command;

use ctdriver_common::error::{DriverError, Result};

/// Interface configured inside the container.
pub const CONTAINER_INTERFACE: &str = "eth0";

/// Precomputed interface parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Address in `ip/prefix` form.
    pub address: Option<String>,
    /// Default gateway address.
    pub gateway: Option<String>,
    /// Link MTU.
    pub mtu: Option<u32>,
}

impl InterfaceConfig {
    /// Returns `true` when there is nothing to configure.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.address.is_none() && self.gateway.is_none() && self.mtu.is_none()
    }

    /// Checks address and gateway syntax.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the malformed value.
    pub fn validate(&self) -> Result<()> {
        if let Some(cidr) = &self.address {
            let _ = parse_cidr(cidr)?;
        }
        if let Some(gateway) = &self.gateway {
            let _ = gateway.parse::<IpAddr>().map_err(|e| DriverError::Config {
                message: format!("invalid gateway '{gateway}': {e}"),
            })?;
        }
        Ok(())
    }

    /// The `ip(8)` invocations that apply this configuration to `interface`,
    /// in order.
    #[must_use]
    pub fn commands(&self, interface: &str) -> Vec<Vec<String>> {
        let mut commands = Vec::new();
        let ip = |args: &[&str]| -> Vec<String> {
            std::iter::once("ip")
                .chain(args.iter().copied())
                .map(String::from)
                .collect()
        };

        commands.push(ip(&["link", "set", "lo", "up"]));
        if let Some(cidr) = &self.address {
            commands.push(ip(&["addr", "add", cidr.as_str(), "dev", interface]));
        }
        if let Some(mtu) = self.mtu {
            let mtu = mtu.to_string();
            commands.push(ip(&["link", "set", interface, "mtu", mtu.as_str()]));
        }
        commands.push(ip(&["link", "set", interface, "up"]));
        if let Some(gateway) = &self.gateway {
            commands.push(ip(&[
                "route",
                "add",
                "default",
                "via",
                gateway.as_str(),
                "dev",
                interface,
            ]));
        }
        commands
    }
}

fn parse_cidr(cidr: &str) -> Result<(IpAddr, u8)> {
    let invalid = |why: String| DriverError::Config {
        message: format!("invalid address '{cidr}': {why}"),
    };
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| invalid("missing prefix length".into()))?;
    let addr = addr.parse::<IpAddr>().map_err(|e| invalid(e.to_string()))?;
    let prefix = prefix.parse::<u8>().map_err(|e| invalid(e.to_string()))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(invalid(format!("prefix length above {max}")));
    }
    Ok((addr, prefix))
}

/// Configures the container interface. A no-op for an empty config.
///
/// # Errors
///
/// Returns an error if the config is malformed or an `ip` invocation fails.
pub fn configure_interface(config: &InterfaceConfig) -> Result<()> {
    if config.is_empty() {
        return Ok(());
    }
    config.validate()?;

    for argv in config.commands(CONTAINER_INTERFACE) {
        let (program, args) = argv.split_first().ok_or_else(|| DriverError::Config {
            message: "empty network command".into(),
        })?;
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| DriverError::io(program, e))?;
        if !output.status.success() {
            return Err(DriverError::Backend {
                operation: "network setup",
                message: format!(
                    "{}: {}",
                    argv.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
    }
    tracing::info!(interface = CONTAINER_INTERFACE, ?config, "network configured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_noop() {
        let config = InterfaceConfig::default();
        assert!(config.is_empty());
        configure_interface(&config).expect("noop");
    }

    #[test]
    fn full_config_command_order() {
        let config = InterfaceConfig {
            address: Some("172.17.0.2/16".into()),
            gateway: Some("172.17.42.1".into()),
            mtu: Some(1500),
        };
        let cmds: Vec<String> = config.commands("eth0").iter().map(|c| c.join(" ")).collect();
        assert_eq!(
            cmds,
            vec![
                "ip link set lo up",
                "ip addr add 172.17.0.2/16 dev eth0",
                "ip link set eth0 mtu 1500",
                "ip link set eth0 up",
                "ip route add default via 172.17.42.1 dev eth0",
            ]
        );
    }

    #[test]
    fn validate_rejects_bad_values() {
        let bad_prefix = InterfaceConfig {
            address: Some("10.0.0.2/33".into()),
            ..InterfaceConfig::default()
        };
        assert!(bad_prefix.validate().is_err());

        let no_prefix = InterfaceConfig {
            address: Some("10.0.0.2".into()),
            ..InterfaceConfig::default()
        };
        assert!(no_prefix.validate().is_err());

        let bad_gateway = InterfaceConfig {
            gateway: Some("gateway".into()),
            ..InterfaceConfig::default()
        };
        assert!(bad_gateway.validate().is_err());
    }

    #[test]
    fn validate_accepts_ipv6() {
        let config = InterfaceConfig {
            address: Some("fd00::2/64".into()),
            gateway: Some("fd00::1".into()),
            mtu: None,
        };
        config.validate().expect("valid");
    }
}
