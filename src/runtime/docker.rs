use super::ContainerRuntime;
use crate::container::{Container, PortBinding};
use crate::error::ErrorSink;
use crate::types::ContainerUpdate;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::ContainerInspectResponse;
use bollard::system::EventsOptions;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures_util::stream::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

pub struct DockerRuntime {
    network_name: Option<String>,
}

impl DockerRuntime {
    /// With `network_name` set, container IPs are taken from that network
    /// rather than the default bridge.
    pub fn new(network_name: Option<String>) -> Self {
        Self { network_name }
    }

    async fn connect() -> Result<Docker> {
        // Connect to the local Docker daemon using default settings.
        // This handles unix socket on Linux.
        Docker::connect_with_local_defaults().map_err(Into::into)
    }

    async fn inspect(
        &self,
        docker: &Docker,
        id: &str,
    ) -> Result<Option<Container>, bollard::errors::Error> {
        let detail = docker.inspect_container(id, None).await?;
        Ok(container_from_inspect(&detail, self.network_name.as_deref()))
    }

    async fn get_initial_state(
        &self,
        docker: &Docker,
    ) -> Result<HashMap<String, Option<Container>>, bollard::errors::Error> {
        let mut map = HashMap::new();
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = docker.list_containers(Some(opts)).await?;

        for c in containers {
            let Some(id) = c.id else { continue };
            match self.inspect(docker, &id).await {
                Ok(Some(container)) => {
                    map.insert(container.id.clone(), Some(container));
                }
                Ok(None) => {}
                // Gone between listing and inspecting.
                Err(e) => debug!("Skipping container {:.12}: {}", id, e),
            }
        }
        Ok(map)
    }
}

/// Container events that change what is running.  `kill` is left out:
/// it also reports signals that leave the container running, and a kill
/// that does end the container is followed by `die`.
const WATCHED_EVENTS: &[&str] = &["start", "die", "stop", "destroy"];

#[derive(Debug, PartialEq, Eq)]
enum ContainerEvent {
    Started,
    Gone,
}

fn classify(action: &str) -> Option<ContainerEvent> {
    match action {
        "start" => Some(ContainerEvent::Started),
        "die" | "stop" | "destroy" => Some(ContainerEvent::Gone),
        _ => None,
    }
}

/// Container events from `since` onwards.  Docker replays anything that
/// happened after `since` before streaming live events.
fn events_options(since: DateTime<Utc>) -> EventsOptions<String> {
    EventsOptions::<String> {
        since: Some(since),
        filters: HashMap::from([
            ("type".to_string(), vec!["container".to_string()]),
            (
                "event".to_string(),
                WATCHED_EVENTS.iter().map(|s| s.to_string()).collect(),
            ),
        ]),
        ..Default::default()
    }
}

async fn send(update_tx: &mpsc::Sender<ContainerUpdate>, update: ContainerUpdate) -> Result<()> {
    update_tx
        .send(update)
        .await
        .map_err(|_| anyhow!("Channel closed"))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn monitor(
        &self,
        reset: oneshot::Receiver<()>,
        update_tx: mpsc::Sender<ContainerUpdate>,
        errs: ErrorSink,
    ) -> Result<()> {
        if reset.await.is_err() {
            return Err(anyhow!("Consumer went away before asking for a reset"));
        }

        loop {
            let docker = match Self::connect().await {
                Ok(d) => d,
                Err(e) => {
                    error!("Failed to connect to Docker: {}. Retrying in 5s...", e);
                    sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            // Events from before the scan are replayed, so nothing that
            // happens while listing is missed.  Timestamps are whole seconds.
            let since = Utc::now() - chrono::Duration::seconds(1);

            // Initial scan
            match self.get_initial_state(&docker).await {
                Ok(containers) => {
                    info!("Initial scan found {} containers", containers.len());
                    send(
                        &update_tx,
                        ContainerUpdate {
                            reset: true,
                            containers,
                        },
                    )
                    .await?;
                }
                Err(e) => {
                    errs.post_err(e);
                    warn!("Failed initial scan. Retrying in 5s...");
                    sleep(Duration::from_secs(5)).await;
                    continue;
                }
            }

            // Event stream
            let mut stream = docker.events(Some(events_options(since)));

            info!("Listening for Docker events...");
            while let Some(msg) = stream.next().await {
                let event = match msg {
                    Ok(event) => event,
                    Err(e) => {
                        errs.post_err(e);
                        break; // Break inner loop to reconnect
                    }
                };
                let Some(id) = event.actor.and_then(|actor| actor.id) else {
                    continue;
                };
                let action = event.action.unwrap_or_default();
                debug!("Container event: {} for {:.12}", action, id);

                let change = match classify(&action) {
                    Some(ContainerEvent::Started) => match self.inspect(&docker, &id).await {
                        Ok(Some(container)) => Some(container),
                        Ok(None) => continue,
                        Err(e) => {
                            warn!("Failed to inspect started container {:.12}: {}", id, e);
                            continue;
                        }
                    },
                    Some(ContainerEvent::Gone) => None,
                    None => continue,
                };

                send(
                    &update_tx,
                    ContainerUpdate {
                        reset: false,
                        containers: HashMap::from([(id, change)]),
                    },
                )
                .await?;
            }

            warn!("Docker event stream ended. Reconnecting in 2s...");
            sleep(Duration::from_secs(2)).await;
        }
    }
}

/// The reconciler's view of an inspected container; `None` if Docker
/// reported no id.
pub fn container_from_inspect(
    detail: &ContainerInspectResponse,
    network_name: Option<&str>,
) -> Option<Container> {
    let id = detail.id.clone().filter(|id| !id.is_empty())?;
    let config = detail.config.as_ref();
    let settings = detail.network_settings.as_ref();

    let ports = settings
        .and_then(|s| s.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|(port, bindings)| {
                    let bindings = bindings
                        .iter()
                        .flatten()
                        .map(|b| {
                            PortBinding::new(
                                b.host_ip.clone().unwrap_or_default(),
                                b.host_port.clone().unwrap_or_default(),
                            )
                        })
                        .collect();
                    (port.clone(), bindings)
                })
                .collect()
        })
        .unwrap_or_default();

    let ip_address = match network_name {
        Some(network) => get_ip_for_network(detail, network),
        None => settings.and_then(|s| s.ip_address.clone()),
    }
    .unwrap_or_default();

    Some(Container {
        id,
        image: config.and_then(|c| c.image.clone()).unwrap_or_default(),
        labels: config.and_then(|c| c.labels.clone()).unwrap_or_default(),
        env: config.and_then(|c| c.env.clone()).unwrap_or_default(),
        host_network: detail
            .host_config
            .as_ref()
            .and_then(|h| h.network_mode.as_deref())
            == Some("host"),
        ports,
        ip_address,
    })
}

fn get_ip_for_network(detail: &ContainerInspectResponse, network_name: &str) -> Option<String> {
    let net = detail
        .network_settings
        .as_ref()?
        .networks
        .as_ref()?
        .get(network_name)?;
    if let Some(ipv4) = net.ip_address.as_ref().filter(|ip| !ip.is_empty()) {
        return Some(ipv4.clone());
    }
    net.global_ipv6_address
        .as_ref()
        .filter(|ip| !ip.is_empty())
        .cloned()
}
