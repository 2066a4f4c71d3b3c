use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Instance, ServiceInfo};

pub mod memory;
pub use memory::InMemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("service '{0}' not found")]
    ServiceNotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("malformed store record: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryServiceOptions {
    pub with_instances: bool,
}

impl QueryServiceOptions {
    pub fn with_instances() -> Self {
        Self {
            with_instances: true,
        }
    }
}

/// Shared service and instance state, written to by every host's agent.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_all_services(
        &self,
        opts: QueryServiceOptions,
    ) -> Result<Vec<ServiceInfo>, StoreError>;

    /// Fails with [`StoreError::ServiceNotFound`] if there is no such service.
    async fn get_service(
        &self,
        name: &str,
        opts: QueryServiceOptions,
    ) -> Result<ServiceInfo, StoreError>;

    /// Create or overwrite an instance.
    async fn add_instance(
        &self,
        service: &str,
        instance: &str,
        inst: &Instance,
    ) -> Result<(), StoreError>;

    /// Remove an instance; removing one that isn't there is not an error.
    async fn remove_instance(&self, service: &str, instance: &str) -> Result<(), StoreError>;
}
