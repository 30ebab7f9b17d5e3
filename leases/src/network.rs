// Cross-node calls made by the lease manager

use crate::{
    abort::AbortLeaseRequest,
    lease::LeaseId,
    manager::{LeaseManager, WeakLeaseManager},
    report::ClusterLeaseReport,
    Error, PeerState, Result, ServerId,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Transport used by the lease manager. Implementations are bound to the
/// local server and send requests on its behalf.
#[async_trait]
pub trait NetworkHandler: Send + Sync {
    /// Ask `server` to drop the named ids it has booked for our incarnation.
    async fn abort_ids(
        &self,
        server: &ServerId,
        leased_from: Vec<LeaseId>,
        leased_to: Vec<LeaseId>,
    ) -> Result<()>;

    /// Gather the local lease report of every known server.
    async fn collect_full_lease_report(&self) -> Result<ClusterLeaseReport>;

    /// Gather the local lease report of one server.
    async fn collect_lease_report_for_server(&self, server: &ServerId)
        -> Result<ClusterLeaseReport>;
}

/// An abort request as observed by the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredAbort {
    pub to: ServerId,
    pub request: AbortLeaseRequest,
}

/// Shared switchboard for managers living in one process
#[derive(Default)]
pub struct NetworkHub {
    nodes: DashMap<ServerId, WeakLeaseManager>,
    partition_map: DashMap<(ServerId, ServerId), bool>,
    latency: Mutex<Duration>,
    delivered: Mutex<Vec<DeliveredAbort>>,
}

impl NetworkHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Network handle for the node running as `local`
    pub fn handle(self: &Arc<Self>, local: PeerState) -> Arc<InProcessNetwork> {
        Arc::new(InProcessNetwork {
            local,
            hub: Arc::clone(self),
        })
    }

    pub fn register(&self, manager: &LeaseManager) {
        self.nodes
            .insert(manager.local().server_id.clone(), manager.downgrade());
    }

    pub fn unregister(&self, server: &ServerId) {
        self.nodes.remove(server);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn partition(&self, a: &ServerId, b: &ServerId) {
        self.partition_map.insert((a.clone(), b.clone()), true);
        self.partition_map.insert((b.clone(), a.clone()), true);
    }

    pub fn heal_partition(&self, a: &ServerId, b: &ServerId) {
        self.partition_map.remove(&(a.clone(), b.clone()));
        self.partition_map.remove(&(b.clone(), a.clone()));
    }

    fn is_partitioned(&self, from: &ServerId, to: &ServerId) -> bool {
        self.partition_map
            .get(&(from.clone(), to.clone()))
            .map(|v| *v)
            .unwrap_or(false)
    }

    /// Every abort request delivered so far, in delivery order
    pub fn delivered_aborts(&self) -> Vec<DeliveredAbort> {
        self.delivered.lock().clone()
    }

    pub fn servers(&self) -> Vec<ServerId> {
        let mut servers: Vec<_> = self.nodes.iter().map(|e| e.key().clone()).collect();
        servers.sort();
        servers
    }

    async fn route(&self, from: &ServerId, to: &ServerId) -> Result<LeaseManager> {
        if self.is_partitioned(from, to) {
            return Err(Error::Unreachable { server: to.clone() });
        }

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.nodes
            .get(to)
            .and_then(|node| node.upgrade())
            .ok_or_else(|| Error::UnknownServer { server: to.clone() })
    }
}

impl std::fmt::Debug for NetworkHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkHub")
            .field("servers", &self.servers())
            .finish_non_exhaustive()
    }
}

/// `NetworkHandler` routing calls to other managers in the same process
#[derive(Debug)]
pub struct InProcessNetwork {
    local: PeerState,
    hub: Arc<NetworkHub>,
}

#[async_trait]
impl NetworkHandler for InProcessNetwork {
    async fn abort_ids(
        &self,
        server: &ServerId,
        leased_from: Vec<LeaseId>,
        leased_to: Vec<LeaseId>,
    ) -> Result<()> {
        let target = self.hub.route(&self.local.server_id, server).await?;
        let request = AbortLeaseRequest {
            server: self.local.clone(),
            leased_from,
            leased_to,
        };
        target.abort_leases_for_server(&request);
        self.hub.delivered.lock().push(DeliveredAbort {
            to: server.clone(),
            request,
        });
        Ok(())
    }

    async fn collect_full_lease_report(&self) -> Result<ClusterLeaseReport> {
        let servers = self.hub.servers();
        let reports = futures::future::join_all(
            servers
                .iter()
                .map(|server| self.collect_lease_report_for_server(server)),
        )
        .await;

        let mut cluster = ClusterLeaseReport::new();
        for (server, report) in servers.iter().zip(reports) {
            match report {
                Ok(report) => cluster.extend(report),
                Err(e) => warn!(server = %server, error = %e, "Skipping server in lease report"),
            }
        }
        Ok(cluster)
    }

    async fn collect_lease_report_for_server(
        &self,
        server: &ServerId,
    ) -> Result<ClusterLeaseReport> {
        let target = self.hub.route(&self.local.server_id, server).await?;
        let mut cluster = ClusterLeaseReport::new();
        cluster.insert(server.clone(), target.report(None));
        Ok(cluster)
    }
}
