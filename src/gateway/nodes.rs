//! Node pairing & invocation
//!
//! Pairing state machine per node: a pair request becomes pending, then is
//! approved (a pairing token is issued) or rejected (terminal; a new request
//! is required to retry). An approved node must verify its token before it is
//! eligible to receive invocations.
//!
//! Invocations are tracked in memory only. Duplicate invocations carrying the
//! same idempotency key while the first is in flight join the original
//! outcome instead of re-dispatching; after a timeout the key is remembered
//! for a settling window so a caller retry cannot race a slow-but-real
//! execution into running twice.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::types::NodePairRequestParams;

/// How long an idempotency key is remembered after its invocation times
/// out, as a multiple of the invocation's own timeout.
const SETTLE_WINDOW_FACTOR: u32 = 2;

/// A pairing request awaiting an operator decision
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPairingRequest {
    /// Request identifier (used by approve/reject)
    pub request_id: String,
    /// Node asking to pair
    pub node_id: String,
    /// Human-friendly name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Platform string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Declared capabilities
    pub caps: Vec<String>,
    /// Commands the node can service
    pub commands: Vec<String>,
    /// When the request arrived
    pub requested_at: DateTime<Utc>,
}

/// A node that has been approved and issued a token
#[derive(Debug, Clone)]
pub struct PairedNode {
    /// Node identifier
    pub node_id: String,
    /// Human-friendly name
    pub display_name: String,
    /// Token the node must present on verify
    pub token: String,
    /// Declared capabilities at pairing time
    pub caps: Vec<String>,
    /// Commands the node can service
    pub commands: Vec<String>,
    /// When the approval happened
    pub paired_at: DateTime<Utc>,
}

/// Terminal outcome of one invocation
#[derive(Debug, Clone)]
pub enum InvokeOutcome {
    /// Node reported success
    Ok(Option<Value>),
    /// Node reported failure
    Err {
        /// Node-supplied error code
        code: Option<String>,
        /// Node-supplied message
        message: Option<String>,
    },
    /// The node's connection dropped before a result arrived
    Disconnected,
}

/// What the invoke path should do next for a given idempotency key
pub enum InvokeTicket {
    /// First time this key is seen: dispatch to the node, then wait
    Dispatch {
        /// Gateway-assigned invocation id
        invoke_id: String,
        /// Resolves when the outcome arrives
        outcome: watch::Receiver<Option<InvokeOutcome>>,
    },
    /// Same key already in flight: wait on the original outcome
    Join {
        /// Id of the original invocation
        invoke_id: String,
        /// Resolves when the original invocation's outcome arrives
        outcome: watch::Receiver<Option<InvokeOutcome>>,
    },
    /// Key recently timed out and is still settling; refuse without
    /// re-dispatching
    Settling,
}

#[derive(Debug)]
enum SlotState {
    InFlight {
        invoke_id: String,
        tx: watch::Sender<Option<InvokeOutcome>>,
        /// Connections waiting on this outcome; the record is released when
        /// the last one disconnects
        callers: std::collections::HashSet<String>,
    },
    Settling {
        until: Instant,
    },
}

#[derive(Debug, Default)]
struct InvokeTable {
    /// invoke id -> (node id, idempotency key)
    by_id: HashMap<String, (String, String)>,
    /// (node id, idempotency key) -> slot
    slots: HashMap<(String, String), SlotState>,
}

impl InvokeTable {
    /// Drop settling entries whose window has elapsed. Run on every
    /// invocation-path mutation so timed-out keys do not accumulate.
    fn evict_settled(&mut self, now: Instant) {
        self.slots.retain(|_, state| match state {
            SlotState::Settling { until } => now < *until,
            SlotState::InFlight { .. } => true,
        });
    }
}

/// Owns pairing state and in-flight invocations
#[derive(Debug, Default)]
pub struct NodeManager {
    pending: Mutex<HashMap<String, PendingPairingRequest>>,
    paired: Mutex<HashMap<String, PairedNode>>,
    invokes: Mutex<InvokeTable>,
}

fn new_token() -> String {
    format!("{:032x}", rand::random::<u128>())
}

impl NodeManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Pairing
    // ------------------------------------------------------------------

    /// Record a pairing request. Always creates a fresh pending request; an
    /// already-paired node asking again is how a node recovers a lost token
    /// (approval reissues it).
    pub async fn request_pairing(&self, params: NodePairRequestParams) -> PendingPairingRequest {
        let request = PendingPairingRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            node_id: params.node_id,
            display_name: params.display_name,
            platform: params.platform,
            caps: params.caps,
            commands: params.commands,
            requested_at: Utc::now(),
        };
        info!(request_id = %request.request_id, node_id = %request.node_id, "pairing requested");
        self.pending
            .lock()
            .await
            .insert(request.request_id.clone(), request.clone());
        request
    }

    /// Pending requests, oldest first
    pub async fn pending_requests(&self) -> Vec<PendingPairingRequest> {
        let mut requests: Vec<_> = self.pending.lock().await.values().cloned().collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }

    /// Approve a pending request, issuing a pairing token. The request is
    /// consumed; retrying with the same request id fails.
    pub async fn approve(&self, request_id: &str) -> Result<PairedNode> {
        let request = self
            .pending
            .lock()
            .await
            .remove(request_id)
            .ok_or_else(|| Error::NotFound(format!("no pending pairing request: {request_id}")))?;

        let node = PairedNode {
            display_name: request
                .display_name
                .unwrap_or_else(|| request.node_id.clone()),
            node_id: request.node_id,
            token: new_token(),
            caps: request.caps,
            commands: request.commands,
            paired_at: Utc::now(),
        };
        info!(node_id = %node.node_id, "pairing approved");
        self.paired
            .lock()
            .await
            .insert(node.node_id.clone(), node.clone());
        Ok(node)
    }

    /// Reject a pending request. Terminal: the node must issue a new request
    /// to retry.
    pub async fn reject(&self, request_id: &str) -> Result<PendingPairingRequest> {
        let request = self
            .pending
            .lock()
            .await
            .remove(request_id)
            .ok_or_else(|| Error::NotFound(format!("no pending pairing request: {request_id}")))?;
        info!(request_id = %request_id, node_id = %request.node_id, "pairing rejected");
        Ok(request)
    }

    /// Verify a node's pairing token. Success means the calling connection
    /// may be bound as the live owner of the node id.
    pub async fn verify(&self, node_id: &str, token: &str) -> Result<PairedNode> {
        let paired = self.paired.lock().await;
        match paired.get(node_id) {
            Some(node) if node.token == token => Ok(node.clone()),
            Some(_) => Err(Error::Auth(format!("invalid pairing token for {node_id}"))),
            None => Err(Error::NotFound(format!("node not paired: {node_id}"))),
        }
    }

    /// Rename a paired node
    pub async fn rename(&self, node_id: &str, display_name: &str) -> Result<PairedNode> {
        let mut paired = self.paired.lock().await;
        let node = paired
            .get_mut(node_id)
            .ok_or_else(|| Error::NotFound(format!("node not paired: {node_id}")))?;
        node.display_name = display_name.to_string();
        Ok(node.clone())
    }

    /// All paired nodes, by node id
    pub async fn paired_nodes(&self) -> Vec<PairedNode> {
        let mut nodes: Vec<_> = self.paired.lock().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// One paired node
    pub async fn describe(&self, node_id: &str) -> Result<PairedNode> {
        self.paired
            .lock()
            .await
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("node not paired: {node_id}")))
    }

    // ------------------------------------------------------------------
    // Invocation
    // ------------------------------------------------------------------

    /// Admit an invocation for `(node_id, idempotency_key)` on behalf of
    /// `caller_conn_id`.
    pub async fn begin_invoke(
        &self,
        node_id: &str,
        idempotency_key: &str,
        caller_conn_id: &str,
    ) -> InvokeTicket {
        let mut table = self.invokes.lock().await;
        table.evict_settled(Instant::now());
        let slot_key = (node_id.to_string(), idempotency_key.to_string());

        match table.slots.get_mut(&slot_key) {
            Some(SlotState::InFlight {
                tx,
                invoke_id,
                callers,
            }) => {
                debug!(node_id = %node_id, invoke_id = %invoke_id, "joining in-flight invocation");
                callers.insert(caller_conn_id.to_string());
                return InvokeTicket::Join {
                    invoke_id: invoke_id.clone(),
                    outcome: tx.subscribe(),
                };
            }
            // Eviction already dropped elapsed windows, so any entry left
            // here is still inside its window.
            Some(SlotState::Settling { .. }) => return InvokeTicket::Settling,
            None => {}
        }

        let invoke_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = watch::channel(None);
        table
            .by_id
            .insert(invoke_id.clone(), slot_key.clone());
        table.slots.insert(
            slot_key,
            SlotState::InFlight {
                invoke_id: invoke_id.clone(),
                tx,
                callers: std::iter::once(caller_conn_id.to_string()).collect(),
            },
        );
        InvokeTicket::Dispatch {
            invoke_id,
            outcome: rx,
        }
    }

    /// Accept a result from the connection owning `node_id`. Returns false
    /// for stray results: unknown id, wrong node, or a result arriving after
    /// the invocation already timed out.
    pub async fn resolve_invoke(
        &self,
        invoke_id: &str,
        node_id: &str,
        outcome: InvokeOutcome,
    ) -> bool {
        let mut table = self.invokes.lock().await;
        let Some(slot_key) = table.by_id.get(invoke_id).cloned() else {
            debug!(invoke_id = %invoke_id, "discarding stray invoke result");
            return false;
        };
        if slot_key.0 != node_id {
            warn!(invoke_id = %invoke_id, node_id = %node_id, "invoke result from wrong node");
            return false;
        }
        table.by_id.remove(invoke_id);
        match table.slots.remove(&slot_key) {
            Some(SlotState::InFlight { tx, .. }) => {
                let _ = tx.send(Some(outcome));
                true
            }
            other => {
                // Put back whatever we removed; nothing to resolve.
                if let Some(state) = other {
                    table.slots.insert(slot_key, state);
                }
                false
            }
        }
    }

    /// Time out an invocation. The in-flight record is dropped, but the
    /// idempotency key keeps settling for `SETTLE_WINDOW_FACTOR * timeout`
    /// so an immediate caller retry is refused instead of re-executed.
    pub async fn expire_invoke(&self, invoke_id: &str, timeout: Duration) {
        let mut table = self.invokes.lock().await;
        let now = Instant::now();
        table.evict_settled(now);
        let Some(slot_key) = table.by_id.remove(invoke_id) else {
            return;
        };
        if matches!(table.slots.get(&slot_key), Some(SlotState::InFlight { .. })) {
            let until = now + timeout * SETTLE_WINDOW_FACTOR;
            table.slots.insert(slot_key, SlotState::Settling { until });
        }
    }

    #[cfg(test)]
    async fn slot_count(&self) -> usize {
        self.invokes.lock().await.slots.len()
    }

    /// A caller's connection went away: drop it from every invocation it was
    /// waiting on, and release records nobody is waiting on anymore.
    pub async fn release_caller_invokes(&self, caller_conn_id: &str) {
        let mut table = self.invokes.lock().await;
        let mut released = Vec::new();
        for (slot_key, state) in table.slots.iter_mut() {
            if let SlotState::InFlight {
                invoke_id, callers, ..
            } = state
            {
                callers.remove(caller_conn_id);
                if callers.is_empty() {
                    released.push((slot_key.clone(), invoke_id.clone()));
                }
            }
        }
        for (slot_key, invoke_id) in released {
            debug!(invoke_id = %invoke_id, "releasing invocation with no remaining callers");
            table.slots.remove(&slot_key);
            table.by_id.remove(&invoke_id);
        }
    }

    /// Fail every in-flight invocation for a node whose connection dropped
    pub async fn fail_node_invokes(&self, node_id: &str) {
        let mut table = self.invokes.lock().await;
        let ids: Vec<String> = table
            .by_id
            .iter()
            .filter(|(_, (node, _))| node == node_id)
            .map(|(id, _)| id.clone())
            .collect();
        for invoke_id in ids {
            if let Some(slot_key) = table.by_id.remove(&invoke_id) {
                if let Some(SlotState::InFlight { tx, .. }) = table.slots.remove(&slot_key) {
                    let _ = tx.send(Some(InvokeOutcome::Disconnected));
                }
            }
        }
    }
}

/// Wait for an invocation outcome with a deadline.
///
/// On timeout the in-flight record is expired (idempotency key kept
/// settling); `None` is returned so the caller can report a timeout error.
pub async fn await_outcome(
    nodes: &NodeManager,
    invoke_id: &str,
    mut outcome: watch::Receiver<Option<InvokeOutcome>>,
    timeout: Duration,
) -> Option<InvokeOutcome> {
    let waited = tokio::time::timeout(timeout, async {
        loop {
            if let Some(result) = outcome.borrow_and_update().clone() {
                return result;
            }
            if outcome.changed().await.is_err() {
                return InvokeOutcome::Disconnected;
            }
        }
    })
    .await;

    match waited {
        Ok(result) => Some(result),
        Err(_) => {
            nodes.expire_invoke(invoke_id, timeout).await;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair_params(node_id: &str) -> NodePairRequestParams {
        NodePairRequestParams {
            node_id: node_id.to_string(),
            display_name: Some("Test Node".to_string()),
            platform: Some("macos".to_string()),
            caps: vec!["camera".to_string()],
            commands: vec!["camera.snap".to_string()],
        }
    }

    #[tokio::test]
    async fn test_pairing_lifecycle() {
        let nodes = NodeManager::new();
        let request = nodes.request_pairing(pair_params("mac-mini")).await;
        assert_eq!(nodes.pending_requests().await.len(), 1);

        let paired = nodes.approve(&request.request_id).await.unwrap();
        assert_eq!(paired.node_id, "mac-mini");
        assert!(!paired.token.is_empty());
        assert!(nodes.pending_requests().await.is_empty());

        // Resolved requests are terminal.
        assert!(nodes.approve(&request.request_id).await.is_err());

        assert!(nodes.verify("mac-mini", &paired.token).await.is_ok());
        assert!(matches!(
            nodes.verify("mac-mini", "wrong").await,
            Err(Error::Auth(_))
        ));
        assert!(matches!(
            nodes.verify("unknown", "token").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reject_is_terminal() {
        let nodes = NodeManager::new();
        let request = nodes.request_pairing(pair_params("pi")).await;
        nodes.reject(&request.request_id).await.unwrap();
        assert!(nodes.reject(&request.request_id).await.is_err());
        assert!(nodes.describe("pi").await.is_err());

        // A new request is required to retry.
        let retry = nodes.request_pairing(pair_params("pi")).await;
        assert_ne!(retry.request_id, request.request_id);
        nodes.approve(&retry.request_id).await.unwrap();
        assert!(nodes.describe("pi").await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_invoke_joins_in_flight() {
        let nodes = NodeManager::new();
        let first = nodes.begin_invoke("mac-mini", "op-1", "conn-a").await;
        let InvokeTicket::Dispatch { invoke_id, outcome } = first else {
            panic!("expected dispatch ticket");
        };

        // Same logical operation again: must not dispatch a second time.
        let second = nodes.begin_invoke("mac-mini", "op-1", "conn-a").await;
        let InvokeTicket::Join {
            invoke_id: joined_id,
            outcome: joined,
        } = second
        else {
            panic!("expected join ticket");
        };
        assert_eq!(joined_id, invoke_id);

        // A different key dispatches independently.
        assert!(matches!(
            nodes.begin_invoke("mac-mini", "op-2", "conn-a").await,
            InvokeTicket::Dispatch { .. }
        ));

        assert!(
            nodes
                .resolve_invoke(&invoke_id, "mac-mini", InvokeOutcome::Ok(None))
                .await
        );

        let got = await_outcome(&nodes, &invoke_id, outcome, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(got, InvokeOutcome::Ok(None)));
        let got = await_outcome(&nodes, &invoke_id, joined, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(got, InvokeOutcome::Ok(None)));
    }

    #[tokio::test]
    async fn test_result_from_wrong_node_discarded() {
        let nodes = NodeManager::new();
        let InvokeTicket::Dispatch { invoke_id, .. } = nodes.begin_invoke("mac-mini", "op-1", "conn-a").await
        else {
            panic!("expected dispatch ticket");
        };

        assert!(
            !nodes
                .resolve_invoke(&invoke_id, "impostor", InvokeOutcome::Ok(None))
                .await
        );
        assert!(
            nodes
                .resolve_invoke(&invoke_id, "mac-mini", InvokeOutcome::Ok(None))
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_settling_window() {
        let nodes = NodeManager::new();
        let timeout = Duration::from_secs(5);
        let InvokeTicket::Dispatch { invoke_id, outcome } =
            nodes.begin_invoke("mac-mini", "op-1", "conn-a").await
        else {
            panic!("expected dispatch ticket");
        };

        assert!(await_outcome(&nodes, &invoke_id, outcome, timeout).await.is_none());

        // Late result after the timeout is a stray and must be discarded.
        assert!(
            !nodes
                .resolve_invoke(&invoke_id, "mac-mini", InvokeOutcome::Ok(None))
                .await
        );

        // A retry inside the settling window is refused, not re-dispatched.
        assert!(matches!(
            nodes.begin_invoke("mac-mini", "op-1", "conn-a").await,
            InvokeTicket::Settling
        ));

        // After the window the key is forgotten and a retry runs fresh.
        tokio::time::advance(timeout * SETTLE_WINDOW_FACTOR + Duration::from_millis(1)).await;
        assert!(matches!(
            nodes.begin_invoke("mac-mini", "op-1", "conn-a").await,
            InvokeTicket::Dispatch { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_entries_evicted_without_retry() {
        let nodes = NodeManager::new();
        let timeout = Duration::from_secs(5);
        let InvokeTicket::Dispatch { invoke_id, outcome } =
            nodes.begin_invoke("mac-mini", "op-1", "conn-a").await
        else {
            panic!("expected dispatch ticket");
        };

        assert!(await_outcome(&nodes, &invoke_id, outcome, timeout).await.is_none());
        assert_eq!(nodes.slot_count().await, 1);

        tokio::time::advance(timeout * SETTLE_WINDOW_FACTOR + Duration::from_millis(1)).await;

        // Traffic on an unrelated key must sweep the elapsed window out;
        // nothing ever retries "op-1" itself.
        let InvokeTicket::Dispatch { .. } = nodes.begin_invoke("mac-mini", "op-2", "conn-a").await
        else {
            panic!("expected dispatch ticket");
        };
        assert_eq!(nodes.slot_count().await, 1);
    }

    #[tokio::test]
    async fn test_node_disconnect_fails_pending_invokes() {
        let nodes = NodeManager::new();
        let InvokeTicket::Dispatch { invoke_id, outcome } =
            nodes.begin_invoke("mac-mini", "op-1", "conn-a").await
        else {
            panic!("expected dispatch ticket");
        };

        nodes.fail_node_invokes("mac-mini").await;
        let got = await_outcome(&nodes, &invoke_id, outcome, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(got, InvokeOutcome::Disconnected));

        // Record released: the same key dispatches fresh.
        assert!(matches!(
            nodes.begin_invoke("mac-mini", "op-1", "conn-a").await,
            InvokeTicket::Dispatch { .. }
        ));
    }

    #[tokio::test]
    async fn test_caller_disconnect_releases_records() {
        let nodes = NodeManager::new();
        let InvokeTicket::Dispatch { .. } = nodes.begin_invoke("n", "k", "conn-a").await else {
            panic!("expected dispatch ticket");
        };
        // A second caller joins the same invocation.
        let InvokeTicket::Join { invoke_id, .. } = nodes.begin_invoke("n", "k", "conn-b").await
        else {
            panic!("expected join ticket");
        };

        // One caller leaving keeps the record alive for the other.
        nodes.release_caller_invokes("conn-a").await;
        assert!(matches!(
            nodes.begin_invoke("n", "k", "conn-c").await,
            InvokeTicket::Join { .. }
        ));

        nodes.release_caller_invokes("conn-b").await;
        nodes.release_caller_invokes("conn-c").await;
        assert!(matches!(
            nodes.begin_invoke("n", "k", "conn-a").await,
            InvokeTicket::Dispatch { .. }
        ));

        // The released invocation no longer accepts results.
        assert!(
            !nodes
                .resolve_invoke(&invoke_id, "n", InvokeOutcome::Ok(None))
                .await
        );
    }
}
