//! Event broadcaster
//!
//! Fans a single event out to every eligible client. Guarded events apply a
//! two-stage gate: the client must be an operator, and must hold the admin
//! scope or one of the event's required scopes. Scopes alone are never
//! trusted to carry role semantics, so a non-operator client with a guarded
//! scope in its list still receives nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::registry::{Client, ClientRegistry};
use crate::protocol::frames::{EventFrame, GatewayFrame};
use crate::protocol::{guarded_event_scopes, ClientRole, StateVersion, ADMIN_SCOPE};

/// Per-broadcast options
#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastOpts {
    /// Skip slow clients instead of disconnecting them
    pub drop_if_slow: bool,
    /// Presence/health versions to attach
    pub state_version: Option<StateVersion>,
}

/// Fans events out to eligible clients with a process-wide sequence counter
#[derive(Debug)]
pub struct Broadcaster {
    registry: Arc<ClientRegistry>,
    max_buffered_bytes: usize,
    seq: AtomicU64,
    /// Held across seq assignment and enqueue. Handlers run in their own
    /// tasks, so without this two concurrent sends could reach the same
    /// client's queue in the opposite order of their seq numbers.
    fanout: Mutex<()>,
}

fn client_may_receive(client: &Client, event: &str) -> bool {
    let Some(required) = guarded_event_scopes(event) else {
        return true;
    };
    // Role gate first; scopes on a non-operator are ignored entirely.
    if client.role != ClientRole::Operator {
        return false;
    }
    if client.has_scope(ADMIN_SCOPE) {
        return true;
    }
    required.iter().any(|scope| client.has_scope(scope))
}

impl Broadcaster {
    /// Create a broadcaster over a registry
    pub fn new(registry: Arc<ClientRegistry>, max_buffered_bytes: usize) -> Self {
        Broadcaster {
            registry,
            max_buffered_bytes,
            seq: AtomicU64::new(0),
            fanout: Mutex::new(()),
        }
    }

    /// Sequence number of the most recent broadcast
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Broadcast an event to all eligible clients.
    ///
    /// Returns the sequence number assigned to this event.
    pub async fn broadcast(&self, event: &str, payload: Option<Value>, opts: BroadcastOpts) -> u64 {
        let _fanout = self.fanout.lock().await;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut frame = EventFrame::new(event, payload, seq);
        if let Some(state_version) = opts.state_version {
            frame = frame.with_state_version(state_version);
        }
        // Serialization failure would be a bug in our own payload types.
        let encoded = match serde_json::to_string(&GatewayFrame::Event(frame)) {
            Ok(encoded) => encoded,
            Err(err) => {
                debug!(event = %event, error = %err, "failed to encode event frame");
                return seq;
            }
        };

        let clients = self.registry.all().await;
        trace!(event = %event, seq, clients = clients.len(), drop_if_slow = opts.drop_if_slow, "broadcast");

        for client in clients {
            if !client_may_receive(&client, event) {
                continue;
            }
            let slow = client.outbound.buffered_bytes() > self.max_buffered_bytes;
            if slow && opts.drop_if_slow {
                trace!(conn_id = %client.id, event = %event, "skipping slow consumer");
                continue;
            }
            if slow {
                // Ordering is preserved for everyone else at the cost of
                // dropping the straggler.
                self.registry.disconnect_slow(&client.id).await;
                continue;
            }
            client.outbound.send_frame(encoded.clone());
        }

        seq
    }

    /// Send an event to a single client, drawing from the same sequence
    /// counter as broadcasts so per-client ordering holds across both.
    pub async fn send_to(&self, client: &Client, event: &str, payload: Option<Value>) -> u64 {
        let _fanout = self.fanout.lock().await;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = EventFrame::new(event, payload, seq);
        match serde_json::to_string(&GatewayFrame::Event(frame)) {
            Ok(encoded) => {
                client.outbound.send_frame(encoded);
            }
            Err(err) => {
                debug!(event = %event, error = %err, "failed to encode event frame");
            }
        }
        seq
    }
}
