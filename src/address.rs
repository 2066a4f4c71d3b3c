//! Resolving the address an instance is reachable at.
//!
//! Two special cases apply before the addressing mode is consulted:
//!
//! * a service without an instance port yields no address, so its
//!   instances are registered as unaddressable;
//! * a container on the host's network stack is reached at this host's
//!   IP and the instance port.
//!
//! Otherwise [`AddressMode::Local`] looks for the host port Docker
//! mapped the instance port to, and [`AddressMode::Global`] uses the
//! container's own IP.  Malformed runtime data resolves to no address.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::container::Container;

/// How instances are addressed by the load balancer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressMode {
    /// Reach containers through ports NATed onto this host.
    #[default]
    Local,
    /// Reach containers directly at their assigned IP, across hosts.
    Global,
}

impl FromStr for AddressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "global" => Ok(Self::Global),
            other => Err(format!("invalid network mode '{other}', expected 'local' or 'global'")),
        }
    }
}

impl fmt::Display for AddressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Global => f.write_str("global"),
        }
    }
}

/// Work out where `container` serves `instance_port`, if anywhere.
pub fn resolve_address(
    instance_port: u16,
    container: &Container,
    mode: AddressMode,
    host_ip: IpAddr,
) -> Option<SocketAddr> {
    if instance_port == 0 {
        return None;
    }
    if container.host_network {
        return Some(SocketAddr::new(host_ip, instance_port));
    }
    match mode {
        AddressMode::Local => mapped_port_address(container, instance_port, host_ip),
        AddressMode::Global => fixed_port_address(container, instance_port),
    }
}

fn mapped_port_address(container: &Container, port: u16, host_ip: IpAddr) -> Option<SocketAddr> {
    let bindings = container.ports.get(&format!("{port}/tcp"))?;
    let binding = bindings
        .iter()
        .find(|b| binds_host(&b.host_ip, host_ip))?;
    // The first usable binding decides; a bad port there is not retried.
    let mapped: u16 = binding.host_port.parse().ok()?;
    Some(SocketAddr::new(host_ip, mapped))
}

fn binds_host(binding_ip: &str, host_ip: IpAddr) -> bool {
    if binding_ip.is_empty() {
        return true;
    }
    match binding_ip.parse::<IpAddr>() {
        Ok(ip) => ip.is_unspecified() || ip.to_canonical() == host_ip.to_canonical(),
        Err(_) => false,
    }
}

fn fixed_port_address(container: &Container, port: u16) -> Option<SocketAddr> {
    let ip: IpAddr = container.ip_address.parse().ok()?;
    Some(SocketAddr::new(ip, port))
}
