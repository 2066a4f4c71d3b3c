//! Explicitly assigned instances.
//!
//! Applies local instance overrides straight to the store.  There is no
//! local cache: on a reset the store itself is consulted to find this
//! host's instances that are no longer assigned.

use std::net::IpAddr;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::ErrorSink;
use crate::store::{QueryServiceOptions, Store};
use crate::types::{InstanceKey, LocalInstanceUpdate};

pub struct SetInstancesConfig {
    pub host_ip: IpAddr,
    pub store: Arc<dyn Store>,

    pub local_instance_updates: mpsc::Receiver<LocalInstanceUpdate>,
    pub local_instance_updates_reset: oneshot::Sender<()>,
}

impl SetInstancesConfig {
    pub async fn run(self, errs: ErrorSink, mut stop: watch::Receiver<bool>) {
        let Self {
            host_ip,
            store,
            mut local_instance_updates,
            local_instance_updates_reset,
        } = self;

        let si = SetInstances::new(host_ip, store, errs);

        if local_instance_updates_reset.send(()).is_err() {
            warn!("Local instance producer went away before reset was requested");
        }

        while !*stop.borrow() {
            tokio::select! {
                update = local_instance_updates.recv() => match update {
                    Some(update) => si.process_update(update).await,
                    None => {
                        info!("Local instance update stream closed");
                        break;
                    }
                },
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Local instance assignment stopped");
    }
}

pub struct SetInstances {
    host_ip: IpAddr,
    store: Arc<dyn Store>,
    errs: ErrorSink,
}

impl SetInstances {
    pub fn new(host_ip: IpAddr, store: Arc<dyn Store>, errs: ErrorSink) -> Self {
        Self {
            host_ip,
            store,
            errs,
        }
    }

    pub async fn process_update(&self, update: LocalInstanceUpdate) {
        if update.reset {
            self.process_reset(&update).await;
        }

        for (key, instance) in update.local_instances {
            match instance {
                Some(instance) => {
                    info!(
                        "Registering service '{}' instance '{:.12}' at {}",
                        key.service,
                        key.instance,
                        instance.address_display()
                    );
                    self.errs.post(
                        self.store
                            .add_instance(&key.service, &key.instance, &instance)
                            .await,
                    );
                }
                None => self.remove_instance(&key).await,
            }
        }
    }

    /// Remove this host's instances, across every service, that the
    /// reset leaves out.
    async fn process_reset(&self, update: &LocalInstanceUpdate) {
        let services = match self
            .store
            .get_all_services(QueryServiceOptions::with_instances())
            .await
        {
            Ok(services) => services,
            Err(e) => {
                self.errs.post_err(e);
                return;
            }
        };

        for svc in services {
            for inst in svc.instances {
                if !inst.instance.host.is(self.host_ip) {
                    continue;
                }
                let key = InstanceKey::new(svc.name.as_str(), inst.name);
                if !update.local_instances.contains_key(&key) {
                    self.remove_instance(&key).await;
                }
            }
        }
    }

    async fn remove_instance(&self, key: &InstanceKey) {
        info!(
            "Deregistering service '{}' instance '{:.12}'",
            key.service, key.instance
        );
        self.errs
            .post(self.store.remove_instance(&key.service, &key.instance).await);
    }
}
