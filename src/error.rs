//! Errors and the sink the reconcilers report them to.

use log::debug;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

/// Where recoverable errors go.
///
/// Posting never blocks and never fails; what to do about the errors is
/// up to whoever holds the receiving end.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    tx: mpsc::UnboundedSender<AgentError>,
}

impl ErrorSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report the error in `result`, if there is one.
    pub fn post<E: Into<AgentError>>(&self, result: Result<(), E>) {
        if let Err(e) = result {
            self.post_err(e);
        }
    }

    pub fn post_err<E: Into<AgentError>>(&self, err: E) {
        if let Err(e) = self.tx.send(err.into()) {
            debug!("Error sink closed, dropping: {}", e.0);
        }
    }
}
