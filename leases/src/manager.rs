// Lease manager - per-node entry point tying registries, invalidation and the abort protocol together

use crate::{
    abort::{AbortBatcher, AbortLeaseRequest},
    config::LeaseManagerConfig,
    guard::LeaseGuard,
    invalidation::{schedule_abort, InvalidationEngine},
    lease::{Direction, LeaseEntry, LeaseId, RemoteLeaseRegistration},
    network::NetworkHandler,
    reboot::{RebootListener, RebootTracker},
    registry::{Insertion, LeaseRegistry},
    report::{ClusterLeaseReport, ServerLeaseReport},
    scheduler::Scheduler,
    Error, PeerState, Result, ServerId,
};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub(crate) struct Inner {
    local: PeerState,
    leased_from: Arc<LeaseRegistry>,
    leased_to: Arc<LeaseRegistry>,
    scheduler: Arc<dyn Scheduler>,
    network: Arc<dyn NetworkHandler>,
    batcher: Arc<AbortBatcher>,
    // Only held weakly by the tracker, so the manager keeps it alive
    engine: Arc<InvalidationEngine>,
    tracker: Arc<RebootTracker>,
}

impl Inner {
    pub(crate) fn registry(&self, direction: Direction) -> &LeaseRegistry {
        match direction {
            Direction::LeasedFromRemote => &self.leased_from,
            Direction::LeasedToRemote => &self.leased_to,
        }
    }

    pub(crate) fn batcher(&self) -> &Arc<AbortBatcher> {
        &self.batcher
    }
}

/// Lease bookkeeping of one node. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LeaseManager {
    inner: Arc<Inner>,
}

/// Non-owning handle, used by the network hub so that it never keeps a node alive.
#[derive(Clone)]
pub struct WeakLeaseManager {
    inner: Weak<Inner>,
}

impl WeakLeaseManager {
    pub fn upgrade(&self) -> Option<LeaseManager> {
        self.inner.upgrade().map(|inner| LeaseManager { inner })
    }
}

impl std::fmt::Debug for WeakLeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakLeaseManager")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl LeaseManager {
    pub fn builder(local: PeerState) -> LeaseManagerBuilder {
        LeaseManagerBuilder::new(local)
    }

    /// Incarnation of the node this manager runs on
    pub fn local(&self) -> &PeerState {
        &self.inner.local
    }

    pub fn downgrade(&self) -> WeakLeaseManager {
        WeakLeaseManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn tracker(&self) -> &Arc<RebootTracker> {
        &self.inner.tracker
    }

    /// Record that this node relies on `peer` staying in its current incarnation.
    ///
    /// `on_abort` runs on the scheduler, at most once, if the peer moves past
    /// that incarnation or aborts the lease from its side. It never runs as a
    /// result of releasing the returned guard. This call does no I/O.
    pub fn require_lease<D, F>(&self, peer: PeerState, describe: D, on_abort: F) -> LeaseGuard
    where
        D: Fn() -> String + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        let direction = Direction::LeasedFromRemote;
        let mut entry = LeaseEntry::new(describe, on_abort);
        loop {
            let id = LeaseId::next();
            match self.inner.leased_from.insert(&peer, id, entry) {
                Insertion::Registered => {
                    debug!(peer = %peer, lease_id = %id, "Lease registered");
                    return LeaseGuard::new(Arc::downgrade(&self.inner), peer, id, direction);
                }
                Insertion::Superseded(rejected) => {
                    return self.reject_superseded(direction, peer, id, rejected);
                }
                // Fresh ids cannot collide; try the next one anyway
                Insertion::Duplicate(rejected) => entry = rejected,
            }
        }
    }

    /// Book a lease that `holder` took out against this node.
    ///
    /// The holder ships its lease id in a [`RemoteLeaseRegistration`]. If the
    /// holder's incarnation is already over, the returned guard is inert and
    /// `on_abort` is scheduled immediately.
    pub fn require_lease_to_remote<D, F>(
        &self,
        holder: PeerState,
        lease_id: LeaseId,
        describe: D,
        on_abort: F,
    ) -> Result<LeaseGuard>
    where
        D: Fn() -> String + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        let direction = Direction::LeasedToRemote;
        let entry = LeaseEntry::new(describe, on_abort);
        match self.inner.leased_to.insert(&holder, lease_id, entry) {
            Insertion::Registered => {
                debug!(holder = %holder, lease_id = %lease_id, "Remote lease registered");
                Ok(LeaseGuard::new(
                    Arc::downgrade(&self.inner),
                    holder,
                    lease_id,
                    direction,
                ))
            }
            Insertion::Superseded(rejected) => {
                Ok(self.reject_superseded(direction, holder, lease_id, rejected))
            }
            Insertion::Duplicate(_) => Err(Error::DuplicateLease {
                peer: holder,
                lease_id,
            }),
        }
    }

    /// Payload the holder of `guard` sends to the peer it leased from
    pub fn registration_for(&self, guard: &LeaseGuard) -> RemoteLeaseRegistration {
        RemoteLeaseRegistration {
            holder: self.inner.local.clone(),
            lease_id: guard.id(),
        }
    }

    fn reject_superseded(
        &self,
        direction: Direction,
        peer: PeerState,
        id: LeaseId,
        entry: LeaseEntry,
    ) -> LeaseGuard {
        info!(
            peer = %peer,
            lease_id = %id,
            direction = %direction,
            "Incarnation already superseded, aborting lease immediately"
        );
        schedule_abort(&*self.inner.scheduler, direction, &peer, id, entry);
        LeaseGuard::inert(peer, id, direction)
    }

    /// Handle an abort request from `request.server`. Ids that are not booked
    /// (any more) are ignored. Returns how many leases were aborted.
    pub fn abort_leases_for_server(&self, request: &AbortLeaseRequest) -> usize {
        let batches = [
            (Direction::LeasedFromRemote, &request.leased_from),
            (Direction::LeasedToRemote, &request.leased_to),
        ];

        let mut aborted = 0;
        for (direction, ids) in batches {
            let registry = self.inner.registry(direction);
            for id in ids {
                if let Some(entry) = registry.remove(&request.server, *id) {
                    schedule_abort(&*self.inner.scheduler, direction, &request.server, *id, entry);
                    aborted += 1;
                }
            }
        }

        info!(
            server = %request.server,
            requested = request.leased_from.len() + request.leased_to.len(),
            aborted,
            "Abort request handled"
        );
        aborted
    }

    /// Leases this node currently holds, optionally only those involving one server
    pub fn report(&self, filter: Option<&ServerId>) -> ServerLeaseReport {
        ServerLeaseReport::collect(&self.inner.leased_from, &self.inner.leased_to, filter)
    }

    /// This node's report wrapped as a single-member cluster report
    pub fn local_report(&self) -> ClusterLeaseReport {
        let mut cluster = ClusterLeaseReport::new();
        cluster.insert(self.inner.local.server_id.clone(), self.report(None));
        cluster
    }

    /// Reports of every server reachable through the network handler
    pub async fn collect_full_report(&self) -> Result<ClusterLeaseReport> {
        self.inner.network.collect_full_lease_report().await
    }

    pub async fn collect_report_for_server(&self, server: &ServerId) -> Result<ClusterLeaseReport> {
        if *server == self.inner.local.server_id {
            return Ok(self.local_report());
        }
        self.inner.network.collect_lease_report_for_server(server).await
    }

    pub fn lease_count(&self, direction: Direction) -> usize {
        self.inner.registry(direction).lease_count()
    }

    /// Whether `id` is still booked under `peer` in `direction`
    pub fn is_registered(&self, direction: Direction, peer: &PeerState, id: LeaseId) -> bool {
        self.inner.registry(direction).contains(peer, id)
    }

    /// Outbound abort notifications still waiting for their batch window
    pub fn pending_abort_peers(&self) -> usize {
        self.inner.batcher.pending_peers()
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("local", &self.inner.local)
            .field("engine", &self.inner.engine)
            .field("pending_aborts", &self.inner.batcher)
            .finish_non_exhaustive()
    }
}

/// Assembles a [`LeaseManager`] from its collaborators. Scheduler, network
/// handler and reboot tracker are all required.
pub struct LeaseManagerBuilder {
    local: PeerState,
    config: Option<LeaseManagerConfig>,
    scheduler: Option<Arc<dyn Scheduler>>,
    network: Option<Arc<dyn NetworkHandler>>,
    tracker: Option<Arc<RebootTracker>>,
}

impl LeaseManagerBuilder {
    pub fn new(local: PeerState) -> Self {
        Self {
            local,
            config: None,
            scheduler: None,
            network: None,
            tracker: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: LeaseManagerConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    #[must_use]
    pub fn network(mut self, network: Arc<dyn NetworkHandler>) -> Self {
        self.network = Some(network);
        self
    }

    #[must_use]
    pub fn tracker(mut self, tracker: Arc<RebootTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn build(self) -> Result<LeaseManager> {
        let scheduler = self
            .scheduler
            .ok_or_else(|| Error::MissingCollaborator("scheduler".to_string()))?;
        let network = self
            .network
            .ok_or_else(|| Error::MissingCollaborator("network handler".to_string()))?;
        let tracker = self
            .tracker
            .ok_or_else(|| Error::MissingCollaborator("reboot tracker".to_string()))?;

        let config = match self.config {
            Some(config) => {
                config.validate()?;
                if config.local_peer() != self.local {
                    warn!(
                        local = %self.local,
                        configured = %config.local_peer(),
                        "Configured identity differs from the builder's, using the builder's"
                    );
                }
                config
            }
            None => LeaseManagerConfig::for_peer(self.local.clone()),
        };

        let leased_from = Arc::new(LeaseRegistry::new(Direction::LeasedFromRemote));
        let leased_to = Arc::new(LeaseRegistry::new(Direction::LeasedToRemote));
        let engine = Arc::new(InvalidationEngine::new(
            Arc::clone(&leased_from),
            Arc::clone(&leased_to),
            Arc::clone(&scheduler),
        ));
        let batcher = Arc::new(AbortBatcher::new(
            config.abort_batch_window(),
            Arc::clone(&network),
            Arc::clone(&scheduler),
        ));

        let listener: Arc<dyn RebootListener> = engine.clone();
        tracker.register_listener(Arc::downgrade(&listener));

        info!(local = %self.local, "Lease manager ready");
        Ok(LeaseManager {
            inner: Arc::new(Inner {
                local: self.local,
                leased_from,
                leased_to,
                scheduler,
                network,
                batcher,
                engine,
                tracker,
            }),
        })
    }
}
