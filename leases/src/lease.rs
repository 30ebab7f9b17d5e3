// Core lease records

use crate::PeerState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_LEASE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique lease identifier. Never reused while the process lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub u64);

impl LeaseId {
    /// Allocate the next id from the process-wide counter
    pub fn next() -> Self {
        Self(NEXT_LEASE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the dependency this node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// We hold the lease; the remote incarnation is the one we rely on.
    LeasedFromRemote,
    /// A remote holds the lease and relies on our incarnation.
    LeasedToRemote,
}

impl Direction {
    /// The direction under which the peer books the same lease.
    pub fn mirrored(self) -> Self {
        match self {
            Direction::LeasedFromRemote => Direction::LeasedToRemote,
            Direction::LeasedToRemote => Direction::LeasedFromRemote,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LeasedFromRemote => f.write_str("leasedFromRemote"),
            Direction::LeasedToRemote => f.write_str("leasedToRemote"),
        }
    }
}

pub type Describe = Arc<dyn Fn() -> String + Send + Sync>;
pub type AbortCallback = Box<dyn FnOnce() + Send>;

/// Registry-owned part of a lease: how to describe it and whom to tell when it dies.
pub struct LeaseEntry {
    describe: Describe,
    on_abort: AbortCallback,
}

impl LeaseEntry {
    pub fn new<D, F>(describe: D, on_abort: F) -> Self
    where
        D: Fn() -> String + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        Self {
            describe: Arc::new(describe),
            on_abort: Box::new(on_abort),
        }
    }

    pub fn describer(&self) -> Describe {
        Arc::clone(&self.describe)
    }

    pub fn describe(&self) -> String {
        (self.describe)()
    }

    /// Consume the entry, handing back the abort notifier. Taking it by value
    /// is what makes a second invocation impossible.
    pub fn into_abort_callback(self) -> AbortCallback {
        self.on_abort
    }
}

impl fmt::Debug for LeaseEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseEntry").finish_non_exhaustive()
    }
}

/// Carried inside a holder's own application request so that the referenced
/// peer can book the lease under its `leasedToRemote` side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteLeaseRegistration {
    pub holder: PeerState,
    pub lease_id: LeaseId,
}
