//! Gateway protocol types
//!
//! Request/response types for gateway methods. Field names are load-bearing
//! wire contracts; params structs deny unknown fields so extra properties are
//! rejected rather than ignored.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ============================================================================
// Scopes & guarded events
// ============================================================================

/// Scope that passes every event guard
pub const ADMIN_SCOPE: &str = "operator.admin";
/// Scope guarding exec approval events
pub const APPROVALS_SCOPE: &str = "operator.approvals";
/// Scope guarding pairing events
pub const PAIRING_SCOPE: &str = "operator.pairing";

/// Required scopes for sensitive events. Events not listed here are
/// delivered to every connected client.
pub fn guarded_event_scopes(event: &str) -> Option<&'static [&'static str]> {
    match event {
        events::EXEC_APPROVAL_REQUESTED => Some(&[APPROVALS_SCOPE]),
        events::EXEC_APPROVAL_RESOLVED => Some(&[APPROVALS_SCOPE]),
        events::NODE_PAIR_REQUESTED => Some(&[PAIRING_SCOPE]),
        events::NODE_PAIR_RESOLVED => Some(&[PAIRING_SCOPE]),
        _ => None,
    }
}

/// Event names
pub mod events {
    /// Periodic heartbeat (best-effort)
    pub const TICK: &str = "tick";
    /// Exec approval requested
    pub const EXEC_APPROVAL_REQUESTED: &str = "exec.approval.requested";
    /// Exec approval resolved
    pub const EXEC_APPROVAL_RESOLVED: &str = "exec.approval.resolved";
    /// Node pairing requested
    pub const NODE_PAIR_REQUESTED: &str = "node.pair.requested";
    /// Node pairing approved or rejected
    pub const NODE_PAIR_RESOLVED: &str = "node.pair.resolved";
    /// Command invocation pushed to a node
    pub const NODE_INVOKE_REQUEST: &str = "node.invoke.request";
    /// Payload forwarded from a verified node
    pub const NODE_EVENT: &str = "node.event";
    /// Session entry changed
    pub const SESSION_UPDATED: &str = "session.updated";
}

// ============================================================================
// Handshake
// ============================================================================

/// Role of a connected client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    /// Human-facing control surface; the only role that can receive
    /// guarded events or approve pairings
    #[default]
    Operator,
    /// Remote process commanded via node.invoke
    Node,
    /// Agent-side automation client
    Agent,
}

impl std::fmt::Display for ClientRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientRole::Operator => write!(f, "operator"),
            ClientRole::Node => write!(f, "node"),
            ClientRole::Agent => write!(f, "agent"),
        }
    }
}

/// Client descriptor sent during connect
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClientInfo {
    /// Client-chosen identifier
    pub id: String,
    /// Human-friendly name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Client software version
    pub version: String,
    /// Platform string (macos, linux, ios, ...)
    pub platform: String,
    /// Client mode (ui, cli, node, ...)
    pub mode: String,
    /// Per-launch instance identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Credentials presented during connect
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuthParams {
    /// Token (for token auth)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Password (for password auth)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Handshake request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnectParams {
    /// Oldest protocol version the client speaks
    pub min_protocol: u32,
    /// Newest protocol version the client speaks
    pub max_protocol: u32,
    /// Client descriptor
    pub client: ClientInfo,
    /// Credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
    /// Requested role (defaults to operator)
    #[serde(default)]
    pub role: ClientRole,
    /// Requested scopes; the server may narrow, never widen
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Declared capabilities
    #[serde(default)]
    pub caps: Vec<String>,
    /// Commands the client can service
    #[serde(default)]
    pub commands: Vec<String>,
}

/// Server descriptor in the hello-ok payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloServer {
    /// Server version
    pub version: String,
    /// Connection identifier assigned by the server
    pub conn_id: String,
}

/// Transport policy advertised to the client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPolicy {
    /// Maximum inbound frame size in bytes
    pub max_payload: usize,
    /// Outbound buffer threshold before a client counts as slow
    pub max_buffered_bytes: usize,
    /// Interval between tick events
    pub tick_interval_ms: u64,
}

/// Successful handshake payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    /// Negotiated protocol version
    pub protocol: u32,
    /// Server descriptor
    pub server: HelloServer,
    /// Methods this server dispatches
    pub methods: Vec<String>,
    /// Events this server may push
    pub events: Vec<String>,
    /// Granted role after narrowing
    pub role: ClientRole,
    /// Granted scopes after narrowing
    pub scopes: Vec<String>,
    /// Transport policy
    pub policy: HelloPolicy,
}

// ============================================================================
// Node pairing & invocation
// ============================================================================

/// node.pair.request params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodePairRequestParams {
    /// Node identifier requesting to pair
    pub node_id: String,
    /// Human-friendly name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Platform string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Declared capabilities
    #[serde(default)]
    pub caps: Vec<String>,
    /// Commands the node can service
    #[serde(default)]
    pub commands: Vec<String>,
}

/// node.pair.approve params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodePairApproveParams {
    /// Pending request to approve
    pub request_id: String,
}

/// node.pair.reject params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodePairRejectParams {
    /// Pending request to reject
    pub request_id: String,
}

/// node.pair.verify params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodePairVerifyParams {
    /// Node presenting its pairing token
    pub node_id: String,
    /// Token issued at approval
    pub token: String,
}

/// node.rename params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeRenameParams {
    /// Paired node to rename
    pub node_id: String,
    /// New display name
    pub display_name: String,
}

/// node.describe params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeDescribeParams {
    /// Node to describe
    pub node_id: String,
}

/// node.invoke params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeInvokeParams {
    /// Target node
    pub node_id: String,
    /// Command to run on the node
    pub command: String,
    /// Command parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// How long the gateway waits for a result
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Identifies the logical operation so retries dedup instead of
    /// re-executing
    pub idempotency_key: String,
}

/// node.invoke.result params (sent by the node)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeInvokeResultParams {
    /// Invocation id this result answers
    pub id: String,
    /// Node reporting the result
    pub node_id: String,
    /// Whether the command succeeded
    pub ok: bool,
    /// Result payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Error details when ok is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeInvokeError>,
}

/// Error reported by a node for a failed invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeInvokeError {
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Error message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// node.event params (sent by a verified node)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeEventParams {
    /// Event name
    pub event: String,
    /// Event payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Invocation pushed to a node as a node.invoke.request event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInvokeRequestEvent {
    /// Invocation id; the node echoes it back in node.invoke.result
    pub id: String,
    /// Target node
    pub node_id: String,
    /// Command to run
    pub command: String,
    /// Command parameters, pre-serialized
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params_json: Option<String>,
    /// Deadline hint for the node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Logical-operation key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

// ============================================================================
// Exec approvals
// ============================================================================

/// exec.approval.request params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecApprovalRequestParams {
    /// Command awaiting approval
    pub command: String,
    /// Working directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Requesting agent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Session the command belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    /// How long to wait for a decision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Operator decision for a pending exec approval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecApprovalDecision {
    /// Allow this invocation only
    #[serde(rename = "allow-once")]
    AllowOnce,
    /// Allow and remember
    #[serde(rename = "allow-always")]
    AllowAlways,
    /// Deny
    #[serde(rename = "deny")]
    Deny,
}

/// exec.approval.resolve params
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecApprovalResolveParams {
    /// Pending approval id
    pub id: String,
    /// Decision
    pub decision: ExecApprovalDecision,
}

// ============================================================================
// Sessions
// ============================================================================

/// Tri-state patch field: absent (leave alone), null (clear), or a value.
///
/// `#[serde(default)]` yields `Absent` when the key is missing; an explicit
/// JSON `null` deserializes to `Clear`. The distinction is load-bearing for
/// fields like `elevatedLevel` where "off" and "unset" mean different things.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum PatchField<T> {
    /// Key not present in the patch
    #[default]
    Absent,
    /// Key present with null
    Clear,
    /// Key present with a value
    Set(T),
}

impl<T> PatchField<T> {
    /// Whether the patch mentions this field at all
    pub fn is_present(&self) -> bool {
        !matches!(self, PatchField::Absent)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for PatchField<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(value) => PatchField::Set(value),
            None => PatchField::Clear,
        })
    }
}

/// Partial update applied to one session entry
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionPatch {
    /// Elevated permissions level: "on" or "off"; null clears
    #[serde(default)]
    pub elevated_level: PatchField<String>,
    /// Model selection ("provider/model" slug or bare model id); null clears
    /// the provider/model overrides
    #[serde(default)]
    pub model: PatchField<String>,
    /// Free-form session label; null clears
    #[serde(default)]
    pub label: PatchField<String>,
}

/// sessions.patch params
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionsPatchParams {
    /// Store key of the entry to patch
    pub key: String,
    /// Fields to update
    pub patch: SessionPatch,
}

/// sessions.resolve params — exactly one selector must be set
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionsResolveParams {
    /// Canonical store key
    #[serde(default)]
    pub key: Option<String>,
    /// Session id recorded in the entry
    #[serde(default)]
    pub session_id: Option<String>,
    /// Session label
    #[serde(default)]
    pub label: Option<String>,
}

/// Presence/health state versions attached to events
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StateVersion {
    /// Presence snapshot version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<u64>,
    /// Health snapshot version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_params_rejects_extra_fields() {
        let raw = serde_json::json!({
            "minProtocol": 3,
            "maxProtocol": 3,
            "client": {"id": "ui", "version": "1.0", "platform": "macos", "mode": "ui"},
            "surprise": true,
        });
        assert!(serde_json::from_value::<ConnectParams>(raw).is_err());
    }

    #[test]
    fn test_connect_params_defaults() {
        let raw = serde_json::json!({
            "minProtocol": 3,
            "maxProtocol": 3,
            "client": {"id": "ui", "version": "1.0", "platform": "macos", "mode": "ui"},
        });
        let params: ConnectParams = serde_json::from_value(raw).unwrap();
        assert_eq!(params.role, ClientRole::Operator);
        assert!(params.scopes.is_empty());
    }

    #[test]
    fn test_patch_field_tri_state() {
        let patch: SessionPatch =
            serde_json::from_value(serde_json::json!({"elevatedLevel": "off"})).unwrap();
        assert_eq!(patch.elevated_level, PatchField::Set("off".to_string()));
        assert_eq!(patch.model, PatchField::Absent);

        let patch: SessionPatch =
            serde_json::from_value(serde_json::json!({"elevatedLevel": null})).unwrap();
        assert_eq!(patch.elevated_level, PatchField::Clear);

        let patch: SessionPatch = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(patch.elevated_level, PatchField::Absent);
    }

    #[test]
    fn test_guarded_event_table() {
        assert_eq!(
            guarded_event_scopes(events::EXEC_APPROVAL_REQUESTED),
            Some(&[APPROVALS_SCOPE][..])
        );
        assert_eq!(
            guarded_event_scopes(events::NODE_PAIR_RESOLVED),
            Some(&[PAIRING_SCOPE][..])
        );
        assert!(guarded_event_scopes(events::TICK).is_none());
        assert!(guarded_event_scopes("agent").is_none());
    }

    #[test]
    fn test_decision_wire_names() {
        let d: ExecApprovalDecision = serde_json::from_str("\"allow-once\"").unwrap();
        assert_eq!(d, ExecApprovalDecision::AllowOnce);
        assert_eq!(
            serde_json::to_string(&ExecApprovalDecision::Deny).unwrap(),
            "\"deny\""
        );
    }

    #[test]
    fn test_invoke_params_require_idempotency_key() {
        let raw = serde_json::json!({"nodeId": "n1", "command": "camera.snap"});
        assert!(serde_json::from_value::<NodeInvokeParams>(raw).is_err());
    }
}
