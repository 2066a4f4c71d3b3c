//! Producers for streams whose whole content is known up front.

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

/// Wait for the consumer to ask for a reset, then deliver `snapshot`.
///
/// `snapshot` must be a reset update.  The sender is held until the
/// consumer goes away, so the stream stays open without further updates.
pub async fn publish_on_reset<U: Send>(
    reset: oneshot::Receiver<()>,
    updates: mpsc::Sender<U>,
    snapshot: U,
) {
    if reset.await.is_err() {
        debug!("Consumer went away before asking for a reset");
        return;
    }
    if updates.send(snapshot).await.is_err() {
        warn!("Consumer went away before the reset could be delivered");
        return;
    }
    updates.closed().await;
}
