//! Server-side registry of connected clients
//!
//! The authoritative map of currently connected clients and the
//! outbound channel used to reach each. This is the most contended
//! shared state in the system: connection tasks register, touch, and
//! unregister concurrently with the background eviction task and with
//! fan-out lookups. A sharded concurrent map keeps unrelated clients'
//! writers from serializing behind one global lock.
//!
//! Each entry owns the sending half of that connection's outbound
//! channel; dropping the entry closes the channel, which ends the
//! connection's writer task.

use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::protocol::SyncMessage;
use crate::types::ClientIdentity;

/// Sending half of one connection's outbound channel.
pub type OutboundSender = mpsc::Sender<SyncMessage>;

/// Registry entry for one connected client.
struct RegisteredClient {
    identity: ClientIdentity,
    outbound: OutboundSender,
    /// Monotonic liveness stamp, refreshed by [`ConnectionRegistry::touch`]
    last_seen: Instant,
}

/// Concurrent map of connected clients keyed by client ID.
///
/// Explicitly constructed and injected into the server; no global
/// state. Registration is idempotent by design: re-registering a
/// client ID replaces the prior entry and closes its channel.
pub struct ConnectionRegistry {
    clients: DashMap<String, RegisteredClient>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Insert or replace the entry for `identity.client_id`.
    pub fn register(&self, identity: ClientIdentity, outbound: OutboundSender) {
        let client_id = identity.client_id.clone();
        info!(
            client_id = %client_id,
            folders = ?identity.subscribed_folders,
            "Registering client"
        );

        let replaced = self.clients.insert(
            client_id,
            RegisteredClient {
                identity,
                outbound,
                last_seen: Instant::now(),
            },
        );
        if let Some(old) = replaced {
            debug!(client_id = %old.identity.client_id, "Replaced prior registration");
        }
    }

    /// Remove a client. The entry's outbound channel closes when the
    /// entry drops. Idempotent: returns `false` if the client was not
    /// registered.
    pub fn unregister(&self, client_id: &str) -> bool {
        let removed = self.clients.remove(client_id).is_some();
        if removed {
            info!(client_id, "Unregistered client");
        }
        removed
    }

    /// Remove a client only if its entry still belongs to the given
    /// connection. A connection winding down after its registration was
    /// replaced must not tear down the replacement; comparing channels
    /// under the shard lock makes the removal race-free.
    pub fn unregister_connection(&self, client_id: &str, outbound: &OutboundSender) -> bool {
        let removed = self
            .clients
            .remove_if(client_id, |_, entry| entry.outbound.same_channel(outbound))
            .is_some();
        if removed {
            info!(client_id, "Unregistered client");
        }
        removed
    }

    /// Refresh a client's liveness stamp. No-op if the client is not
    /// registered (a race with concurrent unregistration must not
    /// fail).
    pub fn touch(&self, client_id: &str) {
        if let Some(mut entry) = self.clients.get_mut(client_id) {
            entry.last_seen = Instant::now();
            entry.identity.last_seen = Utc::now();
        }
    }

    /// All registered clients subscribed to `folder_name`, except
    /// `excluding`. Order is unspecified.
    pub fn subscribers_of(
        &self,
        folder_name: &str,
        excluding: &str,
    ) -> Vec<(String, OutboundSender)> {
        self.clients
            .iter()
            .filter(|entry| {
                entry.key().as_str() != excluding && entry.identity.is_subscribed(folder_name)
            })
            .map(|entry| (entry.key().clone(), entry.outbound.clone()))
            .collect()
    }

    /// Outbound channels of every registered client, for broadcast.
    pub fn all_clients(&self) -> Vec<(String, OutboundSender)> {
        self.clients
            .iter()
            .map(|entry| (entry.key().clone(), entry.outbound.clone()))
            .collect()
    }

    /// Snapshot of one client's identity.
    pub fn identity(&self, client_id: &str) -> Option<ClientIdentity> {
        self.clients.get(client_id).map(|e| e.identity.clone())
    }

    /// Remove every client whose last stamp is older than `timeout`,
    /// returning the evicted IDs. Channels of evicted clients close.
    /// Staleness is judged under the shard lock, so a concurrent
    /// `touch` either lands before the check and spares the client, or
    /// after the entry is already gone.
    pub fn evict_stale(&self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.clients.retain(|client_id, entry| {
            let stale = now.duration_since(entry.last_seen) >= timeout;
            if stale {
                info!(client_id = %client_id, "Evicted stale client");
                evicted.push(client_id.clone());
            }
            !stale
        });
        evicted
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether the registry has no clients.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Whether `client_id` is registered.
    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
