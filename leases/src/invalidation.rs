// Reboot invalidation - fences leases whose peer incarnation is over

use crate::{
    lease::{Direction, LeaseEntry, LeaseId},
    reboot::{RebootListener, ServerHealthState},
    registry::LeaseRegistry,
    scheduler::Scheduler,
    PeerState, RebootId, ServerId,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hand a detached entry's abort notifier to the scheduler.
///
/// The entry has already left the registry, so whoever calls this is the
/// single winner for that lease.
pub(crate) fn schedule_abort(
    scheduler: &dyn Scheduler,
    direction: Direction,
    peer: &PeerState,
    id: LeaseId,
    entry: LeaseEntry,
) {
    if let Err(e) = scheduler.queue(entry.into_abort_callback()) {
        warn!(
            peer = %peer,
            lease_id = %id,
            direction = %direction,
            error = %e,
            "Could not schedule abort notifier, dropping it"
        );
    }
}

/// Subscribed to the reboot tracker. Whenever a server moves past a
/// generation, every lease booked against an older generation of that
/// server is detached from both registries and its notifier is scheduled.
pub struct InvalidationEngine {
    leased_from: Arc<LeaseRegistry>,
    leased_to: Arc<LeaseRegistry>,
    scheduler: Arc<dyn Scheduler>,
}

impl InvalidationEngine {
    pub fn new(
        leased_from: Arc<LeaseRegistry>,
        leased_to: Arc<LeaseRegistry>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            leased_from,
            leased_to,
            scheduler,
        }
    }

    /// Apply the tracker's view of one server. Returns how many leases were fenced.
    pub fn apply(&self, server: &ServerId, reboot_id: Option<RebootId>) -> usize {
        let mut fenced = 0;
        for registry in [&self.leased_from, &self.leased_to] {
            let detached = registry.apply_peer_state(server, reboot_id);
            fenced += detached.len();
            for lease in detached {
                debug!(
                    peer = %lease.peer,
                    lease_id = %lease.id,
                    direction = %registry.direction(),
                    "Lease invalidated"
                );
                schedule_abort(
                    &*self.scheduler,
                    registry.direction(),
                    &lease.peer,
                    lease.id,
                    lease.entry,
                );
            }
        }

        if fenced > 0 {
            match reboot_id {
                Some(current) => info!(
                    server = %server,
                    reboot_id = %current,
                    fenced,
                    "Server rebooted, aborting leases on older incarnations"
                ),
                None => info!(
                    server = %server,
                    fenced,
                    "Server left the cluster, aborting its leases"
                ),
            }
        }
        fenced
    }
}

impl RebootListener for InvalidationEngine {
    fn peer_state_changed(&self, server: &ServerId, state: Option<ServerHealthState>) {
        self.apply(server, state.map(|state| state.reboot_id));
    }
}

impl std::fmt::Debug for InvalidationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationEngine")
            .field("leased_from", &self.leased_from.lease_count())
            .field("leased_to", &self.leased_to.lease_count())
            .finish_non_exhaustive()
    }
}
