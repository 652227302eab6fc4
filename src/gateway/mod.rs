//! Gateway - the WebSocket control plane
//!
//! One process-wide [`Gateway`] owns the client registry, the event
//! broadcaster, node pairing/invocation state, pending exec approvals, and
//! the session store. Connections are handled by [`server`]; authenticated
//! traffic flows through [`dispatch`].

pub mod approvals;
pub mod broadcast;
pub mod dispatch;
pub mod handshake;
pub mod nodes;
pub mod registry;
pub mod server;
pub mod sessions;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::error::Result;

pub use approvals::ApprovalManager;
pub use broadcast::{BroadcastOpts, Broadcaster};
pub use nodes::NodeManager;
pub use registry::ClientRegistry;
pub use sessions::{
    FileSessionStore, MemorySessionStore, ModelCatalog, SessionManager, SessionStore,
    StaticModelCatalog,
};

/// Process-wide gateway state shared by every connection task
pub struct Gateway {
    /// Loaded configuration
    pub config: Config,
    /// Live authenticated connections
    pub registry: Arc<ClientRegistry>,
    /// Event fan-out
    pub broadcaster: Broadcaster,
    /// Pairing and invocation state
    pub nodes: NodeManager,
    /// Pending exec approvals
    pub approvals: ApprovalManager,
    /// Session entries and persistence
    pub sessions: SessionManager,
    /// Process start time
    pub started_at: DateTime<Utc>,
}

impl Gateway {
    /// Build a gateway with the file-backed session store from config
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let store_path = config
            .sessions
            .store_path
            .clone()
            .unwrap_or_else(crate::config::sessions_path);
        let store = Box::new(FileSessionStore::new(store_path));
        Self::with_store(config, store).await
    }

    /// Build a gateway over an explicit session store
    pub async fn with_store(config: Config, store: Box<dyn SessionStore>) -> Result<Arc<Self>> {
        let registry = Arc::new(ClientRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone(), config.limits.max_buffered_bytes);
        let catalog = Box::new(StaticModelCatalog::new(config.models.clone()));
        let sessions = SessionManager::new(store, catalog).await?;
        Ok(Arc::new(Gateway {
            config,
            registry,
            broadcaster,
            nodes: NodeManager::new(),
            approvals: ApprovalManager::new(),
            sessions,
            started_at: Utc::now(),
        }))
    }

    /// Tear down a connection: drop its registry entry and, if it owned a
    /// node id, fail that node's in-flight invocations.
    pub async fn handle_disconnect(&self, conn_id: &str) {
        if let Some(client) = self.registry.remove(conn_id).await {
            self.nodes.release_caller_invokes(conn_id).await;
            if let Some(node_id) = client.node_id {
                self.nodes.fail_node_invokes(&node_id).await;
            }
        }
    }
}
