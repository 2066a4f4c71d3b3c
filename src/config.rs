use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};

use crate::address::AddressMode;
use crate::types::{
    ContainerRule, Host, Instance, InstanceKey, LocalInstanceUpdate, NamedContainerRule, Service,
    ServiceInfo, ServiceUpdate,
};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<IpAddr>,
    pub network_mode: AddressMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_network: Option<String>,
    pub channel_capacity: usize,
    pub services: BTreeMap<String, ServiceConfig>,
    pub local_instances: Vec<LocalInstanceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub instance_port: u16,
    /// Tried in order.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleConfig {
    pub name: String,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalInstanceConfig {
    pub service: String,
    pub instance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<SocketAddr>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_ip: None,
            network_mode: AddressMode::Local,
            docker_network: None,
            channel_capacity: 128,
            services: BTreeMap::new(),
            local_instances: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("instanced.toml"))
            .merge(Json::file("instanced.json"))
            .merge(Env::prefixed("INSTANCED_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.host_ip.is_none() {
            anyhow::bail!("host_ip must be set (INSTANCED_HOST_IP or instanced.toml)");
        }
        if config.channel_capacity == 0 {
            anyhow::bail!("channel_capacity must be at least 1");
        }

        Ok(config)
    }

    pub fn host_ip(&self) -> anyhow::Result<IpAddr> {
        self.host_ip
            .ok_or_else(|| anyhow::anyhow!("host_ip must be set"))
    }

    pub fn service_infos(&self) -> Vec<ServiceInfo> {
        self.services
            .iter()
            .map(|(name, svc)| ServiceInfo {
                name: name.clone(),
                service: Service {
                    instance_port: svc.instance_port,
                },
                container_rules: svc
                    .rules
                    .iter()
                    .map(|rule| NamedContainerRule {
                        name: rule.name.clone(),
                        rule: ContainerRule {
                            selector: rule.selector.clone(),
                        },
                    })
                    .collect(),
                instances: Vec::new(),
            })
            .collect()
    }

    /// All configured services, as a reset update.
    pub fn service_update(&self) -> ServiceUpdate {
        ServiceUpdate {
            reset: true,
            services: self
                .service_infos()
                .into_iter()
                .map(|info| (info.name.clone(), Some(info)))
                .collect(),
        }
    }

    /// All configured overrides, owned by `host_ip`, as a reset update.
    pub fn local_instance_update(&self, host_ip: IpAddr) -> LocalInstanceUpdate {
        LocalInstanceUpdate {
            reset: true,
            local_instances: self
                .local_instances
                .iter()
                .map(|local| {
                    let instance = Instance {
                        address: local.address,
                        labels: local.labels.clone(),
                        host: Host::new(host_ip),
                        container_rule: String::new(),
                    };
                    (
                        InstanceKey::new(local.service.as_str(), local.instance.as_str()),
                        Some(instance),
                    )
                })
                .collect(),
        }
    }
}
