use crate::{
    config::LeaseManagerConfig,
    manager::LeaseManager,
    network::NetworkHub,
    reboot::{RebootTracker, ServerHealthState},
    scheduler::WorkerPool,
    PeerState, Result, ServerId,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counts how often the callbacks it hands out are invoked
#[derive(Debug, Clone, Default)]
pub struct CallCounter {
    calls: Arc<AtomicUsize>,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl FnOnce() + Send + 'static {
        let calls = Arc::clone(&self.calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// A cluster of lease managers in one process.
///
/// Nodes are named `PRMR-1`..`PRMR-n` and start at reboot id 1. They share
/// one network hub, one worker pool and one reboot tracker, so a single
/// [`settle`](TestCluster::settle) waits for every callback and cross-node
/// notification to finish.
pub struct TestCluster {
    pub hub: Arc<NetworkHub>,
    pub pool: Arc<WorkerPool>,
    pub tracker: Arc<RebootTracker>,
    abort_batch_window: Duration,
    nodes: Vec<LeaseManager>,
}

impl TestCluster {
    pub fn new(size: usize) -> Result<Self> {
        Self::with_batch_window(size, Duration::from_millis(5))
    }

    pub fn with_batch_window(size: usize, abort_batch_window: Duration) -> Result<Self> {
        let pool = WorkerPool::start(2)?;
        let tracker = Arc::new(RebootTracker::with_state(
            (1..=size)
                .map(|n| (server_name(n), ServerHealthState::good(1)))
                .collect(),
        ));

        let mut cluster = Self {
            hub: NetworkHub::new(),
            pool,
            tracker,
            abort_batch_window,
            nodes: Vec::with_capacity(size),
        };
        for n in 1..=size {
            let node = cluster.start_node(PeerState::new(server_name(n), 1))?;
            cluster.nodes.push(node);
        }
        Ok(cluster)
    }

    fn start_node(&self, local: PeerState) -> Result<LeaseManager> {
        let mut config = LeaseManagerConfig::for_peer(local.clone());
        config.abort_batch_window_ms =
            u64::try_from(self.abort_batch_window.as_millis()).unwrap_or(u64::MAX);

        let manager = LeaseManager::builder(local.clone())
            .config(config)
            .scheduler(self.pool.clone())
            .network(self.hub.handle(local))
            .tracker(self.tracker.clone())
            .build()?;
        self.hub.register(&manager);
        Ok(manager)
    }

    /// Node by index, starting at 0
    pub fn node(&self, index: usize) -> &LeaseManager {
        &self.nodes[index]
    }

    /// Current incarnation of the node at `index`
    pub fn peer(&self, index: usize) -> PeerState {
        self.nodes[index].local().clone()
    }

    pub fn server(&self, index: usize) -> ServerId {
        self.nodes[index].local().server_id.clone()
    }

    /// Restart the node at `index`: a fresh manager comes up under the next
    /// reboot id and the tracker announces it to everybody.
    pub fn restart(&mut self, index: usize) -> Result<PeerState> {
        let mut next = self.peer(index);
        next.reboot_id.0 += 1;

        self.hub.unregister(&next.server_id);
        let restarted = self.start_node(next.clone())?;
        self.nodes[index] = restarted;

        let mut state = self.tracker.snapshot();
        state.insert(next.server_id.clone(), ServerHealthState::good(next.reboot_id.0));
        self.tracker.update_server_state(state);
        Ok(next)
    }

    /// Take the node at `index` out of the cluster. Later nodes shift down
    /// by one. The tracker and the hub forget the server.
    pub fn remove(&mut self, index: usize) -> LeaseManager {
        let removed = self.nodes.remove(index);
        let server = removed.local().server_id.clone();
        self.hub.unregister(&server);

        let mut state = self.tracker.snapshot();
        state.remove(&server);
        self.tracker.update_server_state(state);
        removed
    }

    pub fn partition(&self, a: usize, b: usize) {
        self.hub.partition(&self.server(a), &self.server(b));
    }

    pub fn heal(&self, a: usize, b: usize) {
        self.hub.heal_partition(&self.server(a), &self.server(b));
    }

    /// Wait until all scheduled callbacks and abort notifications are done
    pub async fn settle(&self) {
        self.pool.drain().await;
    }
}

fn server_name(n: usize) -> ServerId {
    ServerId::new(format!("PRMR-{n}"))
}
