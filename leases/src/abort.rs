// Remote abort protocol - telling a peer to drop its side of a lease

use crate::{
    lease::{Direction, LeaseId},
    network::NetworkHandler,
    scheduler::Scheduler,
    PeerState, ServerId,
};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Body of an abort request. `server` is the incarnation the ids are booked
/// under on the receiving side; `leased_from` and `leased_to` name ids in the
/// receiver's `leasedFromRemote` and `leasedToRemote` maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AbortLeaseRequest {
    pub server: PeerState,
    #[serde(default)]
    pub leased_from: Vec<LeaseId>,
    #[serde(default)]
    pub leased_to: Vec<LeaseId>,
}

#[derive(Debug, Default)]
struct PendingAborts {
    leased_from: Vec<LeaseId>,
    leased_to: Vec<LeaseId>,
}

/// Coalesces outbound abort notifications per peer.
///
/// The first release for a peer opens a window; everything released for that
/// peer before the window closes goes out in one `abort_ids` call. Failures
/// are logged and dropped: the peer's own reboot tracking cleans up after us.
pub struct AbortBatcher {
    window: Duration,
    pending: Mutex<HashMap<ServerId, PendingAborts>>,
    network: Arc<dyn NetworkHandler>,
    scheduler: Arc<dyn Scheduler>,
}

impl AbortBatcher {
    pub fn new(
        window: Duration,
        network: Arc<dyn NetworkHandler>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            window,
            pending: Mutex::new(HashMap::new()),
            network,
            scheduler,
        }
    }

    /// Queue a notification for a lease this node booked under `local_direction`.
    /// The peer has it booked under the mirrored direction.
    pub fn enqueue(self: &Arc<Self>, peer: &ServerId, local_direction: Direction, id: LeaseId) {
        let opens_window = {
            let mut pending = self.pending.lock();
            let opens_window = !pending.contains_key(peer);
            let batch = pending.entry(peer.clone()).or_default();
            match local_direction.mirrored() {
                Direction::LeasedFromRemote => batch.leased_from.push(id),
                Direction::LeasedToRemote => batch.leased_to.push(id),
            }
            opens_window
        };

        if !opens_window {
            return;
        }

        let batcher = Arc::clone(self);
        let server = peer.clone();
        let flush = async move {
            if !batcher.window.is_zero() {
                tokio::time::sleep(batcher.window).await;
            }
            batcher.flush(&server).await;
        };

        if let Err(e) = self.scheduler.spawn(flush.boxed()) {
            warn!(server = %peer, error = %e, "Dropping abort notification, scheduler unavailable");
            self.pending.lock().remove(peer);
        }
    }

    async fn flush(&self, server: &ServerId) {
        let Some(batch) = self.pending.lock().remove(server) else {
            return;
        };

        debug!(
            server = %server,
            leased_from = ?batch.leased_from,
            leased_to = ?batch.leased_to,
            "Sending abort notification"
        );
        if let Err(e) = self
            .network
            .abort_ids(server, batch.leased_from, batch.leased_to)
            .await
        {
            warn!(server = %server, error = %e, "Failed to notify peer about released leases");
        }
    }

    /// Peers with notifications still waiting for their window to close
    pub fn pending_peers(&self) -> usize {
        self.pending.lock().len()
    }
}

impl std::fmt::Debug for AbortBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortBatcher")
            .field("window", &self.window)
            .field("pending_peers", &self.pending_peers())
            .finish_non_exhaustive()
    }
}
