// Reboot tracking - cluster view of which incarnation of each server is current

use crate::{RebootId, ServerId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Weak;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerHealth {
    Good,
    Bad,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHealthState {
    pub reboot_id: RebootId,
    pub health: ServerHealth,
}

impl ServerHealthState {
    pub fn new(reboot_id: u64, health: ServerHealth) -> Self {
        Self {
            reboot_id: RebootId(reboot_id),
            health,
        }
    }

    pub fn good(reboot_id: u64) -> Self {
        Self::new(reboot_id, ServerHealth::Good)
    }
}

/// Receives per-server state changes from the tracker.
///
/// Called on the thread that pushed the update, with updates serialized.
/// Implementations must not block and must not call back into the tracker.
pub trait RebootListener: Send + Sync {
    /// `None` means the server is no longer part of the cluster.
    fn peer_state_changed(&self, server: &ServerId, state: Option<ServerHealthState>);
}

/// Holds the latest reboot id and health of every known server and fans
/// changes out to registered listeners.
pub struct RebootTracker {
    state: RwLock<HashMap<ServerId, ServerHealthState>>,
    listeners: Mutex<Vec<Weak<dyn RebootListener>>>,
    // Serializes updates and listener registration against each other
    update_lock: Mutex<()>,
}

impl RebootTracker {
    pub fn new() -> Self {
        Self::with_state(HashMap::new())
    }

    pub fn with_state(state: HashMap<ServerId, ServerHealthState>) -> Self {
        Self {
            state: RwLock::new(state),
            listeners: Mutex::new(Vec::new()),
            update_lock: Mutex::new(()),
        }
    }

    /// Register a listener. The current state of every known server is
    /// replayed to it first, under the same serialization as updates, so it
    /// can neither miss a transition nor see one out of order.
    pub fn register_listener(&self, listener: Weak<dyn RebootListener>) {
        let _serial = self.update_lock.lock();
        if let Some(strong) = listener.upgrade() {
            let state = self.state.read().clone();
            for (server, known) in &state {
                strong.peer_state_changed(server, Some(*known));
            }
        }
        self.listeners.lock().push(listener);
    }

    pub fn current(&self, server: &ServerId) -> Option<ServerHealthState> {
        self.state.read().get(server).copied()
    }

    pub fn snapshot(&self) -> HashMap<ServerId, ServerHealthState> {
        self.state.read().clone()
    }

    /// Replace the cluster view and notify listeners about every difference
    pub fn update_server_state(&self, update: HashMap<ServerId, ServerHealthState>) {
        let _serial = self.update_lock.lock();

        let changes = {
            let mut state = self.state.write();
            let mut changes: Vec<(ServerId, Option<ServerHealthState>)> = Vec::new();
            let mut next = HashMap::with_capacity(update.len());

            for (server, mut incoming) in update {
                match state.get(&server) {
                    Some(known) if incoming.reboot_id < known.reboot_id => {
                        warn!(
                            server = %server,
                            known = %known.reboot_id,
                            reported = %incoming.reboot_id,
                            "Ignoring reboot id going backwards"
                        );
                        incoming.reboot_id = known.reboot_id;
                        if incoming.health != known.health {
                            changes.push((server.clone(), Some(incoming)));
                        }
                    }
                    Some(known) if *known == incoming => {}
                    _ => changes.push((server.clone(), Some(incoming))),
                }
                next.insert(server, incoming);
            }

            for server in state.keys() {
                if !next.contains_key(server) {
                    changes.push((server.clone(), None));
                }
            }

            *state = next;
            changes
        };

        if changes.is_empty() {
            return;
        }

        let listeners: Vec<_> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|listener| listener.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };

        for (server, state) in &changes {
            debug!(server = %server, state = ?state, "Server state changed");
            for listener in &listeners {
                listener.peer_state_changed(server, *state);
            }
        }
    }
}

impl Default for RebootTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RebootTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebootTracker")
            .field("state", &*self.state.read())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}
