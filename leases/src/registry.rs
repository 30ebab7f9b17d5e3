// Lease registry - one instance per direction, partitioned by server

use crate::{
    lease::{Describe, Direction, LeaseEntry, LeaseId},
    PeerState, RebootId, ServerId,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// What the reboot tracker last told us about a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// The tracker has not reported this server yet
    Unknown,
    /// Current generation of the server
    Alive(RebootId),
    /// The server was removed from the cluster
    Gone,
}

impl PeerStatus {
    /// Whether a lease on `reboot_id` refers to an incarnation that is already over
    pub fn supersedes(&self, reboot_id: RebootId) -> bool {
        match self {
            PeerStatus::Unknown => false,
            PeerStatus::Alive(current) => *current > reboot_id,
            PeerStatus::Gone => true,
        }
    }
}

/// Outcome of an insert attempt
#[derive(Debug)]
pub enum Insertion {
    Registered,
    /// The incarnation is already superseded; the entry is handed back untouched
    Superseded(LeaseEntry),
    /// The id is already booked under this incarnation
    Duplicate(LeaseEntry),
}

/// A lease detached from the registry by the invalidation engine
#[derive(Debug)]
pub struct Detached {
    pub peer: PeerState,
    pub id: LeaseId,
    pub entry: LeaseEntry,
}

/// Snapshot row; the describer is invoked by the caller after locks are gone
pub struct SnapshotRow {
    pub peer: PeerState,
    pub id: LeaseId,
    pub describe: Describe,
}

#[derive(Debug)]
struct ServerLeases {
    status: PeerStatus,
    incarnations: BTreeMap<RebootId, HashMap<LeaseId, LeaseEntry>>,
}

impl ServerLeases {
    fn new() -> Self {
        Self {
            status: PeerStatus::Unknown,
            incarnations: BTreeMap::new(),
        }
    }

    fn lease_count(&self) -> usize {
        self.incarnations.values().map(HashMap::len).sum()
    }
}

/// Leases of one direction, keyed by server, then reboot id, then lease id.
///
/// Every server has its own mutex so that traffic against different peers
/// never contends. No lease callback is ever invoked while a server lock is
/// held; removals hand the entry back to the caller instead.
#[derive(Debug)]
pub struct LeaseRegistry {
    direction: Direction,
    servers: DashMap<ServerId, Arc<Mutex<ServerLeases>>>,
}

impl LeaseRegistry {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            servers: DashMap::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Run `f` on the bucket of `server`, creating it if needed. The map
    /// entry stays locked while `f` runs, so pruning cannot orphan the bucket.
    fn with_bucket<R>(&self, server: &ServerId, f: impl FnOnce(&mut ServerLeases) -> R) -> R {
        let entry = self
            .servers
            .entry(server.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ServerLeases::new())));
        let mut leases = entry.value().lock();
        f(&mut *leases)
    }

    fn existing_bucket(&self, server: &ServerId) -> Option<Arc<Mutex<ServerLeases>>> {
        self.servers.get(server).map(|bucket| Arc::clone(bucket.value()))
    }

    /// Book a lease under `peer`, unless that incarnation is already fenced off
    pub fn insert(&self, peer: &PeerState, id: LeaseId, entry: LeaseEntry) -> Insertion {
        self.with_bucket(&peer.server_id, |leases| {
            if leases.status.supersedes(peer.reboot_id) {
                return Insertion::Superseded(entry);
            }

            let incarnation = leases.incarnations.entry(peer.reboot_id).or_default();
            if incarnation.contains_key(&id) {
                return Insertion::Duplicate(entry);
            }
            incarnation.insert(id, entry);
            Insertion::Registered
        })
    }

    /// Detach a lease. Concurrent callers racing on the same id see exactly one `Some`.
    pub fn remove(&self, peer: &PeerState, id: LeaseId) -> Option<LeaseEntry> {
        let bucket = self.existing_bucket(&peer.server_id)?;
        let entry = {
            let mut leases = bucket.lock();
            let incarnation = leases.incarnations.get_mut(&peer.reboot_id)?;
            let entry = incarnation.remove(&id);
            if incarnation.is_empty() {
                leases.incarnations.remove(&peer.reboot_id);
            }
            entry
        };

        if entry.is_some() {
            self.prune(&peer.server_id);
        }
        entry
    }

    /// Forget a server the tracker never reported once its last lease is gone.
    /// Buckets with a known status are kept, they hold the fencing state, so
    /// the map is bounded by the servers the tracker has ever reported plus
    /// those with outstanding leases.
    fn prune(&self, server: &ServerId) {
        self.servers.remove_if(server, |_, bucket| {
            let leases = bucket.lock();
            leases.status == PeerStatus::Unknown && leases.incarnations.is_empty()
        });
    }

    pub fn contains(&self, peer: &PeerState, id: LeaseId) -> bool {
        self.existing_bucket(&peer.server_id).is_some_and(|bucket| {
            bucket
                .lock()
                .incarnations
                .get(&peer.reboot_id)
                .is_some_and(|entries| entries.contains_key(&id))
        })
    }

    /// Record the tracker's view of `server` and detach every lease whose
    /// incarnation it supersedes. `None` means the server left the cluster.
    pub fn apply_peer_state(&self, server: &ServerId, reboot_id: Option<RebootId>) -> Vec<Detached> {
        let stale = self.with_bucket(server, |leases| match reboot_id {
            Some(current) => {
                if let PeerStatus::Alive(known) = leases.status {
                    if known > current {
                        // Tracker went backwards, keep the newer generation
                        return BTreeMap::new();
                    }
                }
                leases.status = PeerStatus::Alive(current);
                let live = leases.incarnations.split_off(&current);
                std::mem::replace(&mut leases.incarnations, live)
            }
            None => {
                leases.status = PeerStatus::Gone;
                std::mem::take(&mut leases.incarnations)
            }
        });

        stale
            .into_iter()
            .flat_map(|(reboot_id, entries)| {
                let peer = PeerState {
                    server_id: server.clone(),
                    reboot_id,
                };
                entries.into_iter().map(move |(id, entry)| Detached {
                    peer: peer.clone(),
                    id,
                    entry,
                })
            })
            .collect()
    }

    /// Current tracker status of `server` as seen by this registry
    pub fn peer_status(&self, server: &ServerId) -> PeerStatus {
        self.existing_bucket(server)
            .map_or(PeerStatus::Unknown, |bucket| bucket.lock().status)
    }

    /// Best-effort listing of outstanding leases, optionally restricted to one server
    pub fn snapshot(&self, filter: Option<&ServerId>) -> Vec<SnapshotRow> {
        let buckets: Vec<(ServerId, Arc<Mutex<ServerLeases>>)> = match filter {
            Some(server) => self
                .existing_bucket(server)
                .map(|bucket| vec![(server.clone(), bucket)])
                .unwrap_or_default(),
            None => self
                .servers
                .iter()
                .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
                .collect(),
        };

        let mut rows = Vec::new();
        for (server, bucket) in buckets {
            let leases = bucket.lock();
            for (reboot_id, entries) in &leases.incarnations {
                for (id, entry) in entries {
                    rows.push(SnapshotRow {
                        peer: PeerState {
                            server_id: server.clone(),
                            reboot_id: *reboot_id,
                        },
                        id: *id,
                        describe: entry.describer(),
                    });
                }
            }
        }
        rows
    }

    /// Number of outstanding leases across all servers
    pub fn lease_count(&self) -> usize {
        let buckets: Vec<_> = self
            .servers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        buckets.iter().map(|bucket| bucket.lock().lease_count()).sum()
    }
}
