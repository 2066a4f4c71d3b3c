//! In-process store.
//!
//! Keeps the same shape a key/value backing store would: one record per
//! service definition and one JSON-encoded record per instance.  It
//! stands in for the shared store on a single host and in tests, where
//! failures can be injected per service or for the whole store.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::debug;
use tokio::sync::RwLock;

use super::{QueryServiceOptions, Store, StoreError};
use crate::types::{Instance, NamedInstance, ServiceInfo};

#[derive(Debug, Default)]
struct ServiceRecord {
    definition: ServiceInfo,
    instances: BTreeMap<String, Vec<u8>>,
}

impl ServiceRecord {
    fn to_info(&self, opts: QueryServiceOptions) -> Result<ServiceInfo, StoreError> {
        let mut info = self.definition.clone();
        if opts.with_instances {
            info.instances = self
                .instances
                .iter()
                .map(|(name, bytes)| -> Result<NamedInstance, StoreError> {
                    Ok(NamedInstance {
                        name: name.clone(),
                        instance: serde_json::from_slice(bytes)?,
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        Ok(info)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    services: RwLock<BTreeMap<String, ServiceRecord>>,
    failing: RwLock<HashSet<String>>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or redefine a service.  Its instances are kept.
    pub async fn put_service(&self, mut info: ServiceInfo) {
        info.instances.clear();
        let mut services = self.services.write().await;
        let record = services.entry(info.name.clone()).or_default();
        debug!("Defining service '{}'", info.name);
        record.definition = info;
    }

    /// Make every operation touching `service` fail until restored.
    pub async fn fail_service(&self, service: &str) {
        self.failing.write().await.insert(service.to_string());
    }

    pub async fn restore_service(&self, service: &str) {
        self.failing.write().await.remove(service);
    }

    /// Make every operation fail while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    async fn check(&self, service: Option<&str>) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is down".into()));
        }
        if let Some(service) = service {
            if self.failing.read().await.contains(service) {
                return Err(StoreError::Unavailable(format!(
                    "injected failure for service '{service}'"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_all_services(
        &self,
        opts: QueryServiceOptions,
    ) -> Result<Vec<ServiceInfo>, StoreError> {
        self.check(None).await?;
        let services = self.services.read().await;
        services.values().map(|record| record.to_info(opts)).collect()
    }

    async fn get_service(
        &self,
        name: &str,
        opts: QueryServiceOptions,
    ) -> Result<ServiceInfo, StoreError> {
        self.check(Some(name)).await?;
        let services = self.services.read().await;
        services
            .get(name)
            .ok_or_else(|| StoreError::ServiceNotFound(name.to_string()))?
            .to_info(opts)
    }

    async fn add_instance(
        &self,
        service: &str,
        instance: &str,
        inst: &Instance,
    ) -> Result<(), StoreError> {
        self.check(Some(service)).await?;
        let bytes = serde_json::to_vec(inst)?;
        let mut services = self.services.write().await;
        let record = services
            .get_mut(service)
            .ok_or_else(|| StoreError::ServiceNotFound(service.to_string()))?;
        record.instances.insert(instance.to_string(), bytes);
        Ok(())
    }

    async fn remove_instance(&self, service: &str, instance: &str) -> Result<(), StoreError> {
        self.check(Some(service)).await?;
        let mut services = self.services.write().await;
        if let Some(record) = services.get_mut(service) {
            record.instances.remove(instance);
        }
        Ok(())
    }
}
