//! Connection registry.
//!
//! Maps user-chosen identifiers to the live connection currently holding
//! them, and keeps the outbound queue of every live connection so the
//! handler can deliver to one peer or fan out to all of them.

use picrelay_core::ServerEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Opaque connection handle, unique for the lifetime of the process.
pub type ConnectionId = u64;

/// A live connection known to the registry.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    /// Sender for pushing events to this connection's transport.
    pub tx: mpsc::Sender<ServerEvent>,
    /// When the connection was opened.
    pub connected_at: Instant,
}

/// Identities and connections live behind one lock so a lookup never sees
/// an identifier pointing at a half-removed connection.
#[derive(Debug, Default)]
struct RegistryState {
    /// identifier → connection handle.
    identities: HashMap<String, ConnectionId>,
    /// connection handle → live connection.
    connections: HashMap<ConnectionId, ConnectionEntry>,
}

/// Registry of live connections and the identifiers they registered.
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
    /// Monotonic connection ID counter.
    next_conn_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh connection handle.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Track a newly opened connection.
    pub async fn connect(&self, conn_id: ConnectionId, tx: mpsc::Sender<ServerEvent>) {
        let mut state = self.state.write().await;
        state.connections.insert(
            conn_id,
            ConnectionEntry {
                tx,
                connected_at: Instant::now(),
            },
        );
        debug!(conn_id, total = state.connections.len(), "connection tracked");
    }

    /// Associate `identifier` with `conn_id`, replacing any earlier holder.
    ///
    /// Returns the handle that previously held the identifier, if it differs.
    pub async fn register(&self, identifier: &str, conn_id: ConnectionId) -> Option<ConnectionId> {
        let mut state = self.state.write().await;
        let previous = state.identities.insert(identifier.to_string(), conn_id);
        let stolen_from = previous.filter(|prev| *prev != conn_id);

        info!(identifier = %identifier, conn_id, stolen_from, "identifier registered");

        stolen_from
    }

    /// Resolve an identifier to the connection currently holding it.
    pub async fn lookup(&self, identifier: &str) -> Option<ConnectionId> {
        self.state.read().await.identities.get(identifier).copied()
    }

    /// Resolve an identifier straight to its connection's outbound sender.
    ///
    /// Both reads happen under the same lock.
    pub async fn resolve(
        &self,
        identifier: &str,
    ) -> Option<(ConnectionId, Option<mpsc::Sender<ServerEvent>>)> {
        let state = self.state.read().await;
        let conn_id = *state.identities.get(identifier)?;
        let tx = state.connections.get(&conn_id).map(|c| c.tx.clone());
        Some((conn_id, tx))
    }

    /// Snapshot of every live connection except `exclude`.
    pub async fn others(
        &self,
        exclude: ConnectionId,
    ) -> Vec<(ConnectionId, mpsc::Sender<ServerEvent>)> {
        let state = self.state.read().await;
        state
            .connections
            .iter()
            .filter(|(id, _)| **id != exclude)
            .map(|(id, entry)| (*id, entry.tx.clone()))
            .collect()
    }

    /// Forget a connection and every identifier still mapped to it.
    ///
    /// Keyed by handle: an identifier re-registered on another connection
    /// keeps its newer mapping. Returns the identifiers that were released.
    pub async fn remove(&self, conn_id: ConnectionId) -> Vec<String> {
        let mut state = self.state.write().await;
        let mut released = Vec::new();

        state.identities.retain(|identifier, holder| {
            if *holder == conn_id {
                released.push(identifier.clone());
                false
            } else {
                true
            }
        });

        if let Some(entry) = state.connections.remove(&conn_id) {
            debug!(
                conn_id,
                released = ?released,
                connected_secs = entry.connected_at.elapsed().as_secs(),
                "connection removed"
            );
        }

        released
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
