//! Host arrival and departure.
//!
//! Changes are only logged.  Instances registered by a departed host are
//! left in the store; deciding when they are safe to remove belongs to
//! whatever eventually judges host liveness.

use log::info;
use tokio::sync::{mpsc, watch};

use crate::types::HostChange;

// TODO: once departures are trustworthy, mark the departed host's instances
// as suspect and remove them if it has not come back after a grace period.
pub fn process_host_change(change: &HostChange) {
    let action = if change.host_departed {
        "departed"
    } else {
        "arrived"
    };
    info!("Host change: {} {}", change.name, action);
}

/// Log host changes until `stop` is set or the stream closes.
///
/// The daemon has no host membership source, so `main` does not start
/// this; it is here for whichever store client reports membership.
pub async fn watch_host_changes(
    mut changes: mpsc::Receiver<HostChange>,
    mut stop: watch::Receiver<bool>,
) {
    while !*stop.borrow() {
        tokio::select! {
            change = changes.recv() => match change {
                Some(change) => process_host_change(&change),
                None => break,
            },
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
