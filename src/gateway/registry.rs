//! Client registry - the live set of authenticated connections
//!
//! Each entry owns the client's negotiated identity (role, scopes, caps) and
//! a handle to its outbound queue. Entries exist only for the lifetime of the
//! connection; nothing here is persisted.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::protocol::ClientRole;

/// Close code sent when a slow consumer is dropped
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Message handed to a connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A serialized frame to deliver
    Frame(String),
    /// Close the socket with a code and reason
    Close { code: u16, reason: String },
}

/// Sending half of a client's outbound queue, with byte accounting.
///
/// The writer task decrements `queued_bytes` as frames drain; the broadcaster
/// reads it to decide whether the client is slow.
#[derive(Debug, Clone)]
pub struct OutboundHandle {
    tx: mpsc::UnboundedSender<Outbound>,
    queued_bytes: Arc<AtomicUsize>,
}

impl OutboundHandle {
    /// Create a handle plus the receiver for the writer task
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            OutboundHandle {
                tx,
                queued_bytes: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Queue a serialized frame; returns false if the connection is gone
    pub fn send_frame(&self, frame: String) -> bool {
        self.queued_bytes.fetch_add(frame.len(), Ordering::Relaxed);
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    /// Queue a close message
    pub fn send_close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.tx
            .send(Outbound::Close {
                code,
                reason: reason.into(),
            })
            .is_ok()
    }

    /// Bytes currently queued and not yet written to the socket
    pub fn buffered_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Relaxed)
    }

    /// Writer-side bookkeeping after a frame is flushed
    pub fn mark_flushed(&self, len: usize) {
        self.queued_bytes.fetch_sub(len, Ordering::Relaxed);
    }
}

/// One live authenticated connection
#[derive(Debug, Clone)]
pub struct Client {
    /// Connection identifier assigned by the server
    pub id: String,
    /// Client-declared identifier (from the connect descriptor)
    pub client_id: String,
    /// Negotiated role
    pub role: ClientRole,
    /// Granted scopes (after narrowing)
    pub scopes: HashSet<String>,
    /// Declared capabilities
    pub caps: Vec<String>,
    /// Commands the client can service
    pub commands: Vec<String>,
    /// Negotiated protocol version
    pub protocol: u32,
    /// Outbound queue handle
    pub outbound: OutboundHandle,
    /// Last frame seen from this client
    pub last_seen: DateTime<Utc>,
    /// Verified node id, once node.pair.verify succeeds
    pub node_id: Option<String>,
}

impl Client {
    /// Whether the client holds a scope
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }
}

/// The live set of authenticated connections
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Client>>,
}

impl ClientRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly authenticated connection
    pub async fn insert(&self, client: Client) {
        debug!(conn_id = %client.id, role = %client.role, "client registered");
        self.clients.write().await.insert(client.id.clone(), client);
    }

    /// Remove a connection; returns the entry if it existed
    pub async fn remove(&self, conn_id: &str) -> Option<Client> {
        let removed = self.clients.write().await.remove(conn_id);
        if removed.is_some() {
            debug!(conn_id = %conn_id, "client removed");
        }
        removed
    }

    /// Look up a connection by id
    pub async fn get(&self, conn_id: &str) -> Option<Client> {
        self.clients.read().await.get(conn_id).cloned()
    }

    /// Snapshot of every connected client
    pub async fn all(&self) -> Vec<Client> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Number of live connections
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Update a client's last-seen timestamp
    pub async fn touch(&self, conn_id: &str) {
        if let Some(client) = self.clients.write().await.get_mut(conn_id) {
            client.last_seen = Utc::now();
        }
    }

    /// Bind a verified node id to a connection. Any other connection bound
    /// to the same node id is unbound first, so a node id maps to at most
    /// one live connection.
    pub async fn bind_node(&self, conn_id: &str, node_id: &str) -> bool {
        let mut clients = self.clients.write().await;
        for client in clients.values_mut() {
            if client.node_id.as_deref() == Some(node_id) && client.id != conn_id {
                warn!(node_id = %node_id, old_conn = %client.id, "rebinding node to new connection");
                client.node_id = None;
            }
        }
        match clients.get_mut(conn_id) {
            Some(client) => {
                client.node_id = Some(node_id.to_string());
                true
            }
            None => false,
        }
    }

    /// The live connection currently owning a node id
    pub async fn find_by_node(&self, node_id: &str) -> Option<Client> {
        self.clients
            .read()
            .await
            .values()
            .find(|c| c.node_id.as_deref() == Some(node_id))
            .cloned()
    }

    /// Force-disconnect a slow consumer and drop its entry
    pub async fn disconnect_slow(&self, conn_id: &str) {
        if let Some(client) = self.clients.write().await.remove(conn_id) {
            warn!(conn_id = %conn_id, buffered = client.outbound.buffered_bytes(), "disconnecting slow consumer");
            client
                .outbound
                .send_close(CLOSE_POLICY_VIOLATION, "slow consumer");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a registry client wired to a fresh channel, returning the
    /// receiver so tests can observe delivery.
    pub fn test_client(
        conn_id: &str,
        role: ClientRole,
        scopes: &[&str],
    ) -> (Client, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = OutboundHandle::new();
        (
            Client {
                id: conn_id.to_string(),
                client_id: format!("client-{conn_id}"),
                role,
                scopes: scopes.iter().map(|s| s.to_string()).collect(),
                caps: Vec::new(),
                commands: Vec::new(),
                protocol: crate::protocol::PROTOCOL_VERSION,
                outbound,
                last_seen: Utc::now(),
                node_id: None,
            },
            rx,
        )
    }
}
