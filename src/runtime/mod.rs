use crate::error::ErrorSink;
use crate::types::ContainerUpdate;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

pub mod docker;
pub use docker::DockerRuntime;

#[async_trait]
pub trait ContainerRuntime {
    /// Wait for `reset`, deliver every running container as a reset
    /// update, then send incremental updates as containers change.
    /// Whenever the runtime connection is re-established a fresh reset
    /// update is sent.  Runtime errors that are retried go to `errs`.
    async fn monitor(
        &self,
        reset: oneshot::Receiver<()>,
        update_tx: mpsc::Sender<ContainerUpdate>,
        errs: ErrorSink,
    ) -> Result<()>;
}
