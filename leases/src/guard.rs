// Lease guard - the single owner of one registered lease

use crate::{
    lease::{Direction, LeaseId},
    manager::Inner,
    PeerState,
};
use std::sync::Weak;
use tracing::debug;

/// Owns the right to release one lease.
///
/// [`cancel`](LeaseGuard::cancel) is the planned release: the lease leaves
/// the registry quietly. Dropping the guard without cancelling is an
/// unplanned release: the lease leaves the registry and the peer on the other
/// side is told, best effort, to drop its bookkeeping for it. Neither path
/// runs the lease's abort notifier, and both are no-ops if the lease was
/// already invalidated or aborted by the peer.
#[must_use = "dropping a LeaseGuard releases the lease immediately"]
pub struct LeaseGuard {
    manager: Weak<Inner>,
    peer: PeerState,
    id: LeaseId,
    direction: Direction,
    released: bool,
}

impl LeaseGuard {
    pub(crate) fn new(manager: Weak<Inner>, peer: PeerState, id: LeaseId, direction: Direction) -> Self {
        Self {
            manager,
            peer,
            id,
            direction,
            released: false,
        }
    }

    /// A guard for a lease that never made it into the registry
    pub(crate) fn inert(peer: PeerState, id: LeaseId, direction: Direction) -> Self {
        Self {
            manager: Weak::new(),
            peer,
            id,
            direction,
            released: true,
        }
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    /// Incarnation the lease is booked against
    pub fn peer(&self) -> &PeerState {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether the lease is still booked. A lease fenced by a reboot or
    /// aborted by the peer reports `false` even before the guard is released.
    pub fn is_active(&self) -> bool {
        !self.released
            && self
                .manager
                .upgrade()
                .is_some_and(|inner| inner.registry(self.direction).contains(&self.peer, self.id))
    }

    /// Release the lease without telling anybody. Idempotent.
    pub fn cancel(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        let Some(inner) = self.manager.upgrade() else {
            return;
        };
        if inner.registry(self.direction).remove(&self.peer, self.id).is_some() {
            debug!(peer = %self.peer, lease_id = %self.id, direction = %self.direction, "Lease cancelled");
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        let Some(inner) = self.manager.upgrade() else {
            return;
        };
        // Someone else already detached it, so there is nothing left to tell the peer
        if inner.registry(self.direction).remove(&self.peer, self.id).is_none() {
            return;
        }

        debug!(
            peer = %self.peer,
            lease_id = %self.id,
            direction = %self.direction,
            "Lease dropped without cancel, notifying peer"
        );
        inner
            .batcher()
            .enqueue(&self.peer.server_id, self.direction, self.id);
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("peer", &self.peer)
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("released", &self.released)
            .finish()
    }
}
