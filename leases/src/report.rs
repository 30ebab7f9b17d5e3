// Lease reports - diagnostic snapshots of both registries

use crate::{
    lease::LeaseId,
    registry::{LeaseRegistry, SnapshotRow},
    ServerId,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One outstanding lease as it appears in a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub id: LeaseId,
    pub description: String,
}

/// Leases grouped by `"<serverId>:<rebootId>"`
pub type PeerBuckets = BTreeMap<String, Vec<LeaseInfo>>;

/// Everything one server currently holds, in both directions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerLeaseReport {
    pub leased_from_remote: PeerBuckets,
    pub leased_to_remote: PeerBuckets,
}

/// Reports of several servers, keyed by the reporting server
pub type ClusterLeaseReport = BTreeMap<ServerId, ServerLeaseReport>;

impl ServerLeaseReport {
    /// Build a report from both registries. Descriptions are produced here,
    /// after the registry has released its locks.
    pub fn collect(
        leased_from: &LeaseRegistry,
        leased_to: &LeaseRegistry,
        filter: Option<&ServerId>,
    ) -> Self {
        Self {
            leased_from_remote: group(leased_from.snapshot(filter)),
            leased_to_remote: group(leased_to.snapshot(filter)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.leased_from_remote.is_empty() && self.leased_to_remote.is_empty()
    }

    pub fn lease_count(&self) -> usize {
        self.leased_from_remote
            .values()
            .chain(self.leased_to_remote.values())
            .map(Vec::len)
            .sum()
    }

    /// Wire rendering: `[id, ...]` per bucket, or `{"id": "description"}` with details.
    pub fn render(&self, details: bool) -> Value {
        let mut object = Map::new();
        object.insert(
            "leasedFromRemote".to_string(),
            render_buckets(&self.leased_from_remote, details),
        );
        object.insert(
            "leasedToRemote".to_string(),
            render_buckets(&self.leased_to_remote, details),
        );
        Value::Object(object)
    }
}

/// Wire rendering of a whole cluster report
pub fn render_cluster(report: &ClusterLeaseReport, details: bool) -> Value {
    Value::Object(
        report
            .iter()
            .map(|(server, leases)| (server.to_string(), leases.render(details)))
            .collect(),
    )
}

fn group(rows: Vec<SnapshotRow>) -> PeerBuckets {
    let mut buckets = PeerBuckets::new();
    for row in rows {
        buckets.entry(row.peer.to_string()).or_default().push(LeaseInfo {
            id: row.id,
            description: (row.describe)(),
        });
    }
    for leases in buckets.values_mut() {
        leases.sort_by_key(|lease| lease.id);
    }
    buckets
}

fn render_buckets(buckets: &PeerBuckets, details: bool) -> Value {
    let rendered = buckets.iter().map(|(peer, leases)| {
        let value = if details {
            Value::Object(
                leases
                    .iter()
                    .map(|lease| (lease.id.to_string(), Value::String(lease.description.clone())))
                    .collect(),
            )
        } else {
            Value::Array(leases.iter().map(|lease| Value::from(lease.id.0)).collect())
        };
        (peer.clone(), value)
    });
    Value::Object(rendered.collect())
}
