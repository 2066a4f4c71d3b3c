//! Data structures shared by the reconcilers and the store.
//!
//! These types are serialised using [`serde`](https://serde.rs/) because
//! they are the records kept in the shared store: service definitions
//! with their selection rules, and the instances registered against
//! them by every host's agent.  The inbound update envelopes live here
//! too, since producers and reconcilers both need them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::container::{Container, Labeled};

/// A host taking part in the cluster, identified by its IP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub ip: IpAddr,
}

impl Host {
    pub fn new(ip: IpAddr) -> Self {
        Self { ip }
    }

    /// True if this host is `ip`.  IPv4 and IPv4-mapped IPv6 forms of
    /// the same address compare equal.
    pub fn is(&self, ip: IpAddr) -> bool {
        self.ip.to_canonical() == ip.to_canonical()
    }
}

/// Service attributes that influence how instances are derived.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Port the service's instances listen on.  Zero means instances
    /// are registered without an address.
    #[serde(default)]
    pub instance_port: u16,
}

/// A predicate over a container's labels.
///
/// The rule selects a container when every selector entry resolves, via
/// the container's label view, to exactly the selector's value.  An
/// empty selector selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRule {
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

impl ContainerRule {
    pub fn includes<L: Labeled + ?Sized>(&self, labeled: &L) -> bool {
        self.selector
            .iter()
            .all(|(name, value)| labeled.label(name) == Some(value.as_str()))
    }
}

/// A rule with the name it is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedContainerRule {
    pub name: String,
    #[serde(flatten)]
    pub rule: ContainerRule,
}

/// One endpoint backing a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Resolved address; `None` when the instance is unaddressable.
    #[serde(default)]
    pub address: Option<SocketAddr>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Host whose agent registered, and therefore owns, this record.
    pub host: Host,
    /// Name of the rule that selected the container, empty for overrides.
    #[serde(default)]
    pub container_rule: String,
}

impl Instance {
    pub fn address_display(&self) -> String {
        match self.address {
            Some(addr) => addr.to_string(),
            None => "<no address>".to_string(),
        }
    }
}

/// An instance together with its name within the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedInstance {
    pub name: String,
    #[serde(flatten)]
    pub instance: Instance,
}

/// A service as reported by the store: its definition, ordered rules
/// and, when requested, its instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    #[serde(flatten)]
    pub service: Service,
    /// Evaluated in order; the first rule that selects a container wins.
    #[serde(default)]
    pub container_rules: Vec<NamedContainerRule>,
    #[serde(default)]
    pub instances: Vec<NamedInstance>,
}

/// Addresses one instance record in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub service: String,
    pub instance: String,
}

impl InstanceKey {
    pub fn new(service: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            instance: instance.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.instance)
    }
}

/// Containers running on this host, keyed by container id.  A `None`
/// value removes the container.  With `reset` set, the map is the
/// complete set of running containers.
#[derive(Debug, Clone, Default)]
pub struct ContainerUpdate {
    pub reset: bool,
    pub containers: HashMap<String, Option<Container>>,
}

/// Service definitions keyed by name.  A `None` value removes the
/// service.  With `reset` set, the map is the complete set of services.
#[derive(Debug, Clone, Default)]
pub struct ServiceUpdate {
    pub reset: bool,
    pub services: HashMap<String, Option<ServiceInfo>>,
}

/// Explicitly assigned instances for this host.  A `None` value removes
/// the instance.  With `reset` set, the map is the complete local set.
#[derive(Debug, Clone, Default)]
pub struct LocalInstanceUpdate {
    pub reset: bool,
    pub local_instances: HashMap<InstanceKey, Option<Instance>>,
}

/// A host joining or leaving the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostChange {
    pub name: String,
    pub host_departed: bool,
}
