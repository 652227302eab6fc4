//! Gateway wire protocol
//!
//! Defines the frame envelopes, error shapes, and per-method parameter types
//! for the WebSocket control plane. All params structs reject unknown fields
//! so a frame either matches its schema exactly or is refused.

pub mod frames;
pub mod types;

pub use frames::{
    error_codes, ErrorShape, EventFrame, GatewayFrame, RequestFrame, ResponseFrame,
    PROTOCOL_VERSION, PROTOCOL_VERSION_MIN,
};

pub use types::{
    events, guarded_event_scopes, AuthParams, ClientInfo, ClientRole, ConnectParams,
    ExecApprovalDecision, ExecApprovalRequestParams, ExecApprovalResolveParams, HelloOk,
    HelloPolicy, HelloServer, NodeDescribeParams, NodeEventParams, NodeInvokeError,
    NodeInvokeParams, NodeInvokeRequestEvent, NodeInvokeResultParams, NodePairApproveParams,
    NodePairRejectParams, NodePairRequestParams, NodePairVerifyParams, NodeRenameParams,
    PatchField, SessionPatch, SessionsPatchParams, SessionsResolveParams, StateVersion,
    ADMIN_SCOPE, APPROVALS_SCOPE, PAIRING_SCOPE,
};
