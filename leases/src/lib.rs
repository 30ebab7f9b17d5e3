#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod abort;
pub mod api;
pub mod config;
pub mod error;
pub mod guard;
pub mod invalidation;
pub mod lease;
pub mod manager;
pub mod network;
pub mod reboot;
pub mod registry;
pub mod report;
pub mod scheduler;

pub mod test_utils;

pub use error::{Error, Result};
pub use guard::LeaseGuard;
pub use lease::{Direction, LeaseId};
pub use manager::{LeaseManager, LeaseManagerBuilder};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a cluster member. Stable across restarts of that member.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Reboot generation of a server, incremented every time its process starts.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RebootId(pub u64);

impl fmt::Display for RebootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One incarnation of one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerState {
    pub server_id: ServerId,
    pub reboot_id: RebootId,
}

impl PeerState {
    pub fn new(server_id: impl Into<ServerId>, reboot_id: u64) -> Self {
        Self {
            server_id: server_id.into(),
            reboot_id: RebootId(reboot_id),
        }
    }
}

impl From<String> for ServerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Renders as `<serverId>:<rebootId>`, the key used in lease reports.
impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server_id, self.reboot_id)
    }
}
