// Node configuration

use crate::{Error, PeerState, RebootId, Result, ServerId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_SERVER_ID: &str = "LEASE_MANAGER_SERVER_ID";
pub const ENV_REBOOT_ID: &str = "LEASE_MANAGER_REBOOT_ID";
pub const ENV_SCHEDULER_THREADS: &str = "LEASE_MANAGER_SCHEDULER_THREADS";
pub const ENV_ABORT_BATCH_WINDOW_MS: &str = "LEASE_MANAGER_ABORT_BATCH_WINDOW_MS";
pub const ENV_BIND_ADDR: &str = "LEASE_MANAGER_BIND_ADDR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseManagerConfig {
    pub server_id: ServerId,
    pub reboot_id: RebootId,
    /// Workers running abort notifiers and network continuations
    pub scheduler_threads: usize,
    /// How long releases for one peer are collected before a single abort
    /// request goes out. Zero sends immediately.
    pub abort_batch_window_ms: u64,
    pub bind_addr: SocketAddr,
}

impl Default for LeaseManagerConfig {
    fn default() -> Self {
        Self {
            server_id: ServerId::from("SNGL-1"),
            reboot_id: RebootId(1),
            scheduler_threads: 4,
            abort_batch_window_ms: 50,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8529)),
        }
    }
}

impl LeaseManagerConfig {
    /// Defaults for everything except the node's own incarnation
    pub fn for_peer(local: PeerState) -> Self {
        Self {
            server_id: local.server_id,
            reboot_id: local.reboot_id,
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key/value source, falling back to defaults
    /// for absent keys. Present but unparsable values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            server_id: lookup(ENV_SERVER_ID).map_or(defaults.server_id, ServerId::from),
            reboot_id: parse(&lookup, ENV_REBOOT_ID)?
                .map_or(defaults.reboot_id, RebootId),
            scheduler_threads: parse(&lookup, ENV_SCHEDULER_THREADS)?
                .unwrap_or(defaults.scheduler_threads),
            abort_batch_window_ms: parse(&lookup, ENV_ABORT_BATCH_WINDOW_MS)?
                .unwrap_or(defaults.abort_batch_window_ms),
            bind_addr: parse(&lookup, ENV_BIND_ADDR)?.unwrap_or(defaults.bind_addr),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_id.as_str().trim().is_empty() {
            return Err(Error::Config("server id must not be empty".to_string()));
        }
        if self.scheduler_threads == 0 {
            return Err(Error::Config(
                "scheduler_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn local_peer(&self) -> PeerState {
        PeerState {
            server_id: self.server_id.clone(),
            reboot_id: self.reboot_id,
        }
    }

    pub fn abort_batch_window(&self) -> Duration {
        Duration::from_millis(self.abort_batch_window_ms)
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("invalid {key}={raw:?}: {e}")))
        })
        .transpose()
}
