//! Instanced daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;
use tokio::sync::{mpsc, oneshot, watch};

use instanced::config::Config;
use instanced::error::ErrorSink;
use instanced::feed::publish_on_reset;
use instanced::runtime::{ContainerRuntime, DockerRuntime};
use instanced::set_instances::SetInstancesConfig;
use instanced::store::{InMemoryStore, Store};
use instanced::sync_instances::SyncInstancesConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    let host_ip = cfg.host_ip()?;
    info!("Starting instanced with config: {:?}", cfg);

    // Shared store, seeded with the configured service definitions
    let memory = Arc::new(InMemoryStore::new());
    for info in cfg.service_infos() {
        memory.put_service(info).await;
    }
    let store: Arc<dyn Store> = memory;

    let (errs, mut err_rx) = ErrorSink::new();
    let (stop_tx, stop_rx) = watch::channel(false);

    let error_handle = tokio::spawn(async move {
        while let Some(e) = err_rx.recv().await {
            error!("{}", e);
        }
    });

    // Container Runtime (Docker)
    let (container_tx, container_rx) = mpsc::channel(cfg.channel_capacity);
    let (container_reset_tx, container_reset_rx) = oneshot::channel();
    let runtime = DockerRuntime::new(cfg.docker_network.clone());
    let runtime_errs = errs.clone();
    let runtime_handle = tokio::spawn(async move {
        if let Err(e) = runtime
            .monitor(container_reset_rx, container_tx, runtime_errs)
            .await
        {
            error!("Container runtime failed: {}", e);
        }
    });

    // Configured services and overrides
    let (service_tx, service_rx) = mpsc::channel(cfg.channel_capacity);
    let (service_reset_tx, service_reset_rx) = oneshot::channel();
    let services_handle = tokio::spawn(publish_on_reset(
        service_reset_rx,
        service_tx,
        cfg.service_update(),
    ));

    let (local_tx, local_rx) = mpsc::channel(cfg.channel_capacity);
    let (local_reset_tx, local_reset_rx) = oneshot::channel();
    let locals_handle = tokio::spawn(publish_on_reset(
        local_reset_rx,
        local_tx,
        cfg.local_instance_update(host_ip),
    ));

    // Reconcilers
    let sync = SyncInstancesConfig {
        host_ip,
        mode: cfg.network_mode,
        store: Arc::clone(&store),
        container_updates: container_rx,
        container_updates_reset: container_reset_tx,
        service_updates: service_rx,
        service_updates_reset: service_reset_tx,
    };
    let sync_handle = tokio::spawn(sync.run(errs.clone(), stop_rx.clone()));

    let set = SetInstancesConfig {
        host_ip,
        store,
        local_instance_updates: local_rx,
        local_instance_updates_reset: local_reset_tx,
    };
    let set_handle = tokio::spawn(set.run(errs, stop_rx));

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Reconcilers finish the update in hand before stopping
    let _ = stop_tx.send(true);
    for (name, handle) in [("instance sync", sync_handle), ("local instances", set_handle)] {
        if let Err(e) = handle.await {
            error!("{} task failed: {}", name, e);
        }
    }

    // Producers have no one left to feed
    runtime_handle.abort();
    services_handle.abort();
    locals_handle.abort();
    error_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}
