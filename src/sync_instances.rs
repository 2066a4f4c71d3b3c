//! Container-driven instance registration.
//!
//! Keeps the store's instances for each known service in line with the
//! containers running on this host.  Containers are matched to services
//! by the services' rules; the first rule that selects a container
//! decides, and the container is registered as an instance under its id.
//!
//! Only instances owned by this host are ever pruned.  Other hosts run
//! the same loop against the same store, so anything they registered is
//! theirs to remove.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};

use crate::address::{resolve_address, AddressMode};
use crate::container::{instance_labels, Container};
use crate::error::ErrorSink;
use crate::store::{QueryServiceOptions, Store};
use crate::types::{ContainerUpdate, Host, Instance, ServiceInfo, ServiceUpdate};

/// Everything the reconciler needs to start.
pub struct SyncInstancesConfig {
    pub host_ip: IpAddr,
    pub mode: AddressMode,
    pub store: Arc<dyn Store>,

    pub container_updates: mpsc::Receiver<ContainerUpdate>,
    pub container_updates_reset: oneshot::Sender<()>,
    pub service_updates: mpsc::Receiver<ServiceUpdate>,
    pub service_updates_reset: oneshot::Sender<()>,
}

impl SyncInstancesConfig {
    /// Ask both producers for a reset, then apply updates one at a time
    /// until `stop` is set or an input stream closes.
    pub async fn run(self, errs: ErrorSink, mut stop: watch::Receiver<bool>) {
        let Self {
            host_ip,
            mode,
            store,
            mut container_updates,
            container_updates_reset,
            mut service_updates,
            service_updates_reset,
        } = self;

        let mut si = SyncInstances::new(host_ip, mode, store, errs);

        if container_updates_reset.send(()).is_err() {
            warn!("Container update producer went away before reset was requested");
        }
        if service_updates_reset.send(()).is_err() {
            warn!("Service update producer went away before reset was requested");
        }

        info!("Syncing instances for host {} ({} addressing)", host_ip, mode);
        while !*stop.borrow() {
            tokio::select! {
                update = container_updates.recv() => match update {
                    Some(update) => si.process_container_update(update).await,
                    None => {
                        info!("Container update stream closed");
                        break;
                    }
                },
                update = service_updates.recv() => match update {
                    Some(update) => si.process_service_update(update).await,
                    None => {
                        info!("Service update stream closed");
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
        info!("Instance sync stopped");
    }
}

struct TrackedService {
    info: ServiceInfo,
    /// Names of the instances this host registered for the service.
    local_instances: HashSet<String>,
}

impl TrackedService {
    fn includes(&self, instance: &str) -> bool {
        self.local_instances.contains(instance)
    }
}

/// Writes instances to the store on behalf of this host.
struct Registrar {
    host_ip: IpAddr,
    mode: AddressMode,
    store: Arc<dyn Store>,
    errs: ErrorSink,
}

impl Registrar {
    /// The instance `container` yields for `svc`, with the matching
    /// rule's name, if any rule selects it.
    fn extract_instance(&self, container: &Container, svc: &ServiceInfo) -> Option<Instance> {
        let rule = svc
            .container_rules
            .iter()
            .find(|rule| rule.rule.includes(container))?;

        let address = resolve_address(svc.service.instance_port, container, self.mode, self.host_ip);
        if address.is_none() && svc.service.instance_port != 0 {
            info!(
                "Cannot extract address for instance, from container '{:.12}'",
                container.id
            );
        }

        Some(Instance {
            address,
            labels: instance_labels(container),
            host: Host::new(self.host_ip),
            container_rule: rule.name.clone(),
        })
    }

    async fn evaluate(&self, container: &Container, svc: &mut TrackedService) {
        debug!(
            "Evaluating container '{:.12}' against service '{}'",
            container.id, svc.info.name
        );
        match self.extract_instance(container, &svc.info) {
            Some(instance) => {
                // Membership follows the rules, whether or not the write lands.
                svc.local_instances.insert(container.id.clone());
                match self
                    .store
                    .add_instance(&svc.info.name, &container.id, &instance)
                    .await
                {
                    Ok(()) => info!(
                        "Registered {} instance '{:.12}' at {}",
                        svc.info.name,
                        container.id,
                        instance.address_display()
                    ),
                    Err(e) => self.errs.post_err(e),
                }
            }
            None => {
                if svc.local_instances.remove(&container.id) {
                    self.deregister(&svc.info.name, &container.id).await;
                }
            }
        }
    }

    async fn deregister(&self, service: &str, instance: &str) {
        match self.store.remove_instance(service, instance).await {
            Ok(()) => info!("Deregistered service '{}' instance '{:.12}'", service, instance),
            Err(e) => self.errs.post_err(e),
        }
    }

    /// Recompute the service's instances from every known container,
    /// then prune this host's instances that no longer match.
    async fn sync(&self, svc: &mut TrackedService, containers: &HashMap<String, Container>) {
        svc.local_instances.clear();
        for container in containers.values() {
            self.evaluate(container, svc).await;
        }

        let stored = match self
            .store
            .get_service(&svc.info.name, QueryServiceOptions::with_instances())
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                self.errs.post_err(e);
                return;
            }
        };

        for inst in stored.instances {
            if !svc.includes(&inst.name) && inst.instance.host.is(self.host_ip) {
                self.deregister(&svc.info.name, &inst.name).await;
            }
        }
    }
}

/// State owned by the container-driven reconciler task.
pub struct SyncInstances {
    registrar: Registrar,
    services: HashMap<String, TrackedService>,
    /// `None` until the first container reset arrives.
    containers: Option<HashMap<String, Container>>,
}

impl SyncInstances {
    pub fn new(host_ip: IpAddr, mode: AddressMode, store: Arc<dyn Store>, errs: ErrorSink) -> Self {
        Self {
            registrar: Registrar {
                host_ip,
                mode,
                store,
                errs,
            },
            services: HashMap::new(),
            containers: None,
        }
    }

    pub async fn process_container_update(&mut self, update: ContainerUpdate) {
        let Self {
            registrar,
            services,
            containers,
        } = &mut *self;

        if update.reset {
            let fresh: HashMap<String, Container> = update
                .containers
                .into_iter()
                .filter_map(|(id, container)| container.map(|c| (id, c)))
                .collect();
            info!("Container reset: {} running containers", fresh.len());
            let containers = containers.insert(fresh);
            for svc in services.values_mut() {
                registrar.sync(svc, containers).await;
            }
            return;
        }

        let Some(containers) = containers.as_mut() else {
            warn!(
                "Ignoring incremental update of {} containers received before a reset",
                update.containers.len()
            );
            return;
        };

        for (id, container) in update.containers {
            match container {
                Some(container) => {
                    for svc in services.values_mut() {
                        registrar.evaluate(&container, svc).await;
                    }
                    containers.insert(id, container);
                }
                None => {
                    // Instances are named after the container, not the update key.
                    if let Some(prior) = containers.remove(&id) {
                        for svc in services.values_mut() {
                            if svc.local_instances.remove(&prior.id) {
                                registrar.deregister(&svc.info.name, &prior.id).await;
                            }
                        }
                    }
                }
            }
        }
    }

    pub async fn process_service_update(&mut self, update: ServiceUpdate) {
        if update.reset {
            self.services.clear();
        }

        for (name, info) in update.services {
            match info {
                Some(mut info) => {
                    info.name = name.clone();
                    let Self {
                        registrar,
                        services,
                        containers,
                    } = &mut *self;
                    let svc = services.entry(name).or_insert_with(|| TrackedService {
                        info: ServiceInfo::default(),
                        local_instances: HashSet::new(),
                    });
                    svc.info = info;
                    match containers {
                        Some(containers) => registrar.sync(svc, containers).await,
                        None => debug!(
                            "Deferring sync of service '{}' until containers are known",
                            svc.info.name
                        ),
                    }
                }
                None => {
                    // Instances already registered for the service stay in the store.
                    if self.services.remove(&name).is_some() {
                        info!("Service '{}' removed", name);
                    }
                }
            }
        }
    }

    /// Names of the instances registered for `service` by this host.
    pub fn local_instances(&self, service: &str) -> Option<&HashSet<String>> {
        self.services.get(service).map(|svc| &svc.local_instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::PortBinding;
    use crate::error::AgentError;
    use crate::store::{InMemoryStore, StoreError};
    use crate::types::{ContainerRule, NamedContainerRule, NamedInstance, Service};

    const HOST: &str = "192.168.1.10";

    fn host_ip() -> IpAddr {
        HOST.parse().unwrap()
    }

    fn rule(name: &str, selector: &[(&str, &str)]) -> NamedContainerRule {
        NamedContainerRule {
            name: name.into(),
            rule: ContainerRule {
                selector: selector
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        }
    }

    fn service(name: &str, port: u16, rules: Vec<NamedContainerRule>) -> ServiceInfo {
        ServiceInfo {
            name: name.into(),
            service: Service {
                instance_port: port,
            },
            container_rules: rules,
            instances: vec![],
        }
    }

    fn container(id: &str, image: &str) -> Container {
        Container {
            id: id.into(),
            image: image.into(),
            ports: [("80/tcp".to_string(), vec![PortBinding::new("", "32768")])]
                .into_iter()
                .collect(),
            ..Default::default()
        }
    }

    fn container_reset(containers: Vec<Container>) -> ContainerUpdate {
        ContainerUpdate {
            reset: true,
            containers: containers
                .into_iter()
                .map(|c| (c.id.clone(), Some(c)))
                .collect(),
        }
    }

    fn service_update(reset: bool, services: Vec<(&str, Option<ServiceInfo>)>) -> ServiceUpdate {
        ServiceUpdate {
            reset,
            services: services
                .into_iter()
                .map(|(name, info)| (name.to_string(), info))
                .collect(),
        }
    }

    async fn setup(
        services: &[ServiceInfo],
    ) -> (
        Arc<InMemoryStore>,
        SyncInstances,
        mpsc::UnboundedReceiver<AgentError>,
    ) {
        let store = Arc::new(InMemoryStore::new());
        for svc in services {
            store.put_service(svc.clone()).await;
        }
        let (errs, err_rx) = ErrorSink::new();
        let si = SyncInstances::new(host_ip(), AddressMode::Local, store.clone(), errs);
        (store, si, err_rx)
    }

    async fn stored(store: &InMemoryStore, service: &str) -> Vec<NamedInstance> {
        store
            .get_service(service, QueryServiceOptions::with_instances())
            .await
            .unwrap()
            .instances
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let web = service(
            "web",
            80,
            vec![
                rule("other", &[("image", "redis")]),
                rule("second", &[("image", "nginx")]),
                rule("third", &[("tag", "latest")]),
                rule("fourth", &[]),
                rule("fifth", &[("image", "nginx")]),
            ],
        );
        let (store, mut si, _errs) = setup(&[web.clone()]).await;
        si.process_service_update(service_update(true, vec![("web", Some(web))]))
            .await;
        si.process_container_update(container_reset(vec![container("c1", "nginx")]))
            .await;

        let instances = stored(&store, "web").await;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].instance.container_rule, "second");
        assert_eq!(
            instances[0].instance.address,
            Some("192.168.1.10:32768".parse().unwrap())
        );
        assert_eq!(instances[0].instance.labels["tag"], "latest");
    }

    #[tokio::test]
    async fn services_wait_for_container_reset() {
        let web = service("web", 80, vec![rule("all", &[])]);
        let (store, mut si, _errs) = setup(&[web.clone()]).await;
        si.process_service_update(service_update(true, vec![("web", Some(web))]))
            .await;
        assert!(stored(&store, "web").await.is_empty());

        si.process_container_update(container_reset(vec![container("c1", "nginx")]))
            .await;
        assert_eq!(stored(&store, "web").await.len(), 1);
    }

    #[tokio::test]
    async fn incremental_before_reset_is_ignored() {
        let (_store, mut si, _errs) = setup(&[]).await;
        let mut update = container_reset(vec![container("c1", "nginx")]);
        update.reset = false;
        si.process_container_update(update).await;
        assert!(si.containers.is_none());
    }

    #[tokio::test]
    async fn reset_prunes_only_own_instances() {
        let web = service("web", 80, vec![rule("all", &[])]);
        let (store, mut si, _errs) = setup(&[web.clone()]).await;
        si.process_container_update(container_reset(vec![
            container("c1", "nginx"),
            container("c2", "nginx"),
        ]))
        .await;
        si.process_service_update(service_update(true, vec![("web", Some(web))]))
            .await;

        let foreign = Instance {
            address: None,
            labels: HashMap::new(),
            host: Host::new("10.0.0.9".parse().unwrap()),
            container_rule: "all".into(),
        };
        store.add_instance("web", "remote", &foreign).await.unwrap();

        si.process_container_update(container_reset(vec![container("c1", "nginx")]))
            .await;

        let mut names: Vec<_> = stored(&store, "web")
            .await
            .into_iter()
            .map(|i| i.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["c1", "remote"]);
    }

    #[tokio::test]
    async fn removing_container_deregisters_everywhere() {
        let web = service("web", 80, vec![rule("all", &[])]);
        let api = service("api", 0, vec![rule("nginx", &[("image", "nginx")])]);
        let (store, mut si, _errs) = setup(&[web.clone(), api.clone()]).await;
        si.process_container_update(container_reset(vec![])).await;
        si.process_service_update(service_update(
            true,
            vec![("web", Some(web)), ("api", Some(api))],
        ))
        .await;

        si.process_container_update(ContainerUpdate {
            reset: false,
            containers: [("c1".to_string(), Some(container("c1", "nginx:1.21")))]
                .into_iter()
                .collect(),
        })
        .await;
        assert_eq!(stored(&store, "web").await.len(), 1);
        let api_instances = stored(&store, "api").await;
        assert_eq!(api_instances.len(), 1);
        assert_eq!(api_instances[0].instance.address, None);

        si.process_container_update(ContainerUpdate {
            reset: false,
            containers: [("c1".to_string(), None)].into_iter().collect(),
        })
        .await;
        assert!(stored(&store, "web").await.is_empty());
        assert!(stored(&store, "api").await.is_empty());
        assert!(si.local_instances("web").unwrap().is_empty());
    }

    #[tokio::test]
    async fn redefining_service_reevaluates() {
        let web = service("web", 80, vec![rule("nginx", &[("image", "nginx")])]);
        let (store, mut si, _errs) = setup(&[web.clone()]).await;
        si.process_container_update(container_reset(vec![
            container("c1", "nginx"),
            container("c2", "redis"),
        ]))
        .await;
        si.process_service_update(service_update(true, vec![("web", Some(web))]))
            .await;
        assert_eq!(stored(&store, "web").await[0].name, "c1");

        let web = service("web", 80, vec![rule("redis", &[("image", "redis")])]);
        si.process_service_update(service_update(false, vec![("web", Some(web))]))
            .await;
        let instances = stored(&store, "web").await;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].name, "c2");
        assert_eq!(instances[0].instance.container_rule, "redis");
    }

    #[tokio::test]
    async fn removed_service_keeps_its_instances() {
        let web = service("web", 80, vec![rule("all", &[])]);
        let (store, mut si, _errs) = setup(&[web.clone()]).await;
        si.process_container_update(container_reset(vec![container("c1", "nginx")]))
            .await;
        si.process_service_update(service_update(true, vec![("web", Some(web))]))
            .await;

        si.process_service_update(service_update(false, vec![("web", None)]))
            .await;
        assert!(si.local_instances("web").is_none());
        assert_eq!(stored(&store, "web").await.len(), 1);

        // No longer known, so a new container is not registered against it.
        si.process_container_update(ContainerUpdate {
            reset: false,
            containers: [("c2".to_string(), Some(container("c2", "nginx")))]
                .into_iter()
                .collect(),
        })
        .await;
        assert_eq!(stored(&store, "web").await.len(), 1);
    }

    #[tokio::test]
    async fn redelivered_update_changes_nothing() {
        let web = service("web", 80, vec![rule("all", &[])]);
        let (store, mut si, mut errs) = setup(&[web.clone()]).await;
        let reset = container_reset(vec![container("c1", "nginx")]);
        si.process_container_update(reset.clone()).await;
        si.process_service_update(service_update(true, vec![("web", Some(web.clone()))]))
            .await;
        let before = stored(&store, "web").await;

        si.process_container_update(reset).await;
        si.process_service_update(service_update(false, vec![("web", Some(web))]))
            .await;
        assert_eq!(stored(&store, "web").await, before);
        assert!(errs.try_recv().is_err());
    }

    #[tokio::test]
    async fn store_failure_is_isolated_per_service() {
        let web = service("web", 80, vec![rule("all", &[])]);
        let api = service("api", 80, vec![rule("all", &[])]);
        let (store, mut si, mut errs) = setup(&[web.clone(), api.clone()]).await;
        si.process_container_update(container_reset(vec![])).await;
        si.process_service_update(service_update(
            true,
            vec![("web", Some(web)), ("api", Some(api))],
        ))
        .await;

        store.fail_service("web").await;
        si.process_container_update(ContainerUpdate {
            reset: false,
            containers: [("c1".to_string(), Some(container("c1", "nginx")))]
                .into_iter()
                .collect(),
        })
        .await;

        assert_eq!(stored(&store, "api").await.len(), 1);
        assert!(matches!(
            errs.try_recv(),
            Ok(AgentError::Store(StoreError::Unavailable(_)))
        ));
        assert!(errs.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_fetch_skips_pruning() {
        let web = service("web", 80, vec![rule("all", &[])]);
        let (store, mut si, mut errs) = setup(&[web.clone()]).await;
        si.process_container_update(container_reset(vec![container("c1", "nginx")]))
            .await;
        si.process_service_update(service_update(true, vec![("web", Some(web))]))
            .await;

        store.set_unavailable(true);
        si.process_container_update(container_reset(vec![])).await;
        assert!(errs.try_recv().is_ok());

        store.set_unavailable(false);
        assert_eq!(stored(&store, "web").await.len(), 1);
    }

    #[tokio::test]
    async fn container_that_stops_matching_is_deregistered() {
        let web = service("web", 80, vec![rule("nginx", &[("image", "nginx")])]);
        let all = service("all", 80, vec![rule("any", &[])]);
        let (store, mut si, mut errs) = setup(&[web.clone(), all.clone()]).await;
        si.process_container_update(container_reset(vec![container("c1", "nginx")]))
            .await;
        si.process_service_update(service_update(
            true,
            vec![("web", Some(web)), ("all", Some(all))],
        ))
        .await;
        assert_eq!(stored(&store, "web").await.len(), 1);

        si.process_container_update(ContainerUpdate {
            reset: false,
            containers: [("c1".to_string(), Some(container("c1", "redis")))]
                .into_iter()
                .collect(),
        })
        .await;

        assert!(stored(&store, "web").await.is_empty());
        assert!(!si.local_instances("web").unwrap().contains("c1"));
        let kept = stored(&store, "all").await;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "c1");
        assert_eq!(kept[0].instance.labels["image"], "redis");
        assert!(errs.try_recv().is_err());
    }

    #[tokio::test]
    async fn removal_uses_the_container_id() {
        let web = service("web", 80, vec![rule("all", &[])]);
        let (store, mut si, _errs) = setup(&[web.clone()]).await;
        si.process_container_update(container_reset(vec![])).await;
        si.process_service_update(service_update(true, vec![("web", Some(web))]))
            .await;

        si.process_container_update(ContainerUpdate {
            reset: false,
            containers: [("key-1".to_string(), Some(container("c1", "nginx")))]
                .into_iter()
                .collect(),
        })
        .await;
        assert_eq!(stored(&store, "web").await[0].name, "c1");

        si.process_container_update(ContainerUpdate {
            reset: false,
            containers: [("key-1".to_string(), None)].into_iter().collect(),
        })
        .await;
        assert!(stored(&store, "web").await.is_empty());
        assert!(si.local_instances("web").unwrap().is_empty());
    }

    #[tokio::test]
    async fn global_mode_uses_container_address() {
        let web = service("web", 80, vec![rule("all", &[])]);
        let store = Arc::new(InMemoryStore::new());
        store.put_service(web.clone()).await;
        let (errs, _err_rx) = ErrorSink::new();
        let mut si = SyncInstances::new(host_ip(), AddressMode::Global, store.clone(), errs);

        let mut c1 = container("c1", "nginx");
        c1.ip_address = "172.17.0.5".into();
        si.process_container_update(container_reset(vec![c1])).await;
        si.process_service_update(service_update(true, vec![("web", Some(web))]))
            .await;

        let instances = stored(&store, "web").await;
        assert_eq!(instances.len(), 1);
        assert_eq!(
            instances[0].instance.address,
            Some("172.17.0.5:80".parse().unwrap())
        );
    }
}
