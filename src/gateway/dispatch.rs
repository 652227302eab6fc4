//! Request dispatcher
//!
//! Routes authenticated request frames to their handlers. Params are
//! schema-checked before any handler logic runs; unknown methods and
//! malformed params fail with structured errors rather than closing the
//! connection.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use super::nodes::{self, InvokeOutcome, InvokeTicket, PairedNode};
use super::registry::Client;
use super::Gateway;
use crate::error::Error;
use crate::protocol::frames::{error_codes, ErrorShape, RequestFrame, ResponseFrame};
use crate::protocol::{
    events, ClientRole, ExecApprovalRequestParams, ExecApprovalResolveParams, NodeDescribeParams,
    NodeEventParams, NodeInvokeParams, NodeInvokeRequestEvent, NodeInvokeResultParams,
    NodePairApproveParams, NodePairRejectParams, NodePairRequestParams, NodePairVerifyParams,
    NodeRenameParams, SessionsPatchParams, SessionsResolveParams, APPROVALS_SCOPE, PAIRING_SCOPE,
    PROTOCOL_VERSION,
};

/// Methods this server dispatches, as advertised in hello-ok
pub fn method_names() -> Vec<String> {
    [
        "connect",
        "health",
        "status",
        "ping",
        "node.pair.request",
        "node.pair.list",
        "node.pair.approve",
        "node.pair.reject",
        "node.pair.verify",
        "node.rename",
        "node.list",
        "node.describe",
        "node.invoke",
        "node.invoke.result",
        "node.event",
        "exec.approval.request",
        "exec.approval.resolve",
        "sessions.list",
        "sessions.patch",
        "sessions.resolve",
    ]
    .iter()
    .map(|m| m.to_string())
    .collect()
}

/// Events this server may push, as advertised in hello-ok
pub fn event_names() -> Vec<String> {
    [
        events::TICK,
        events::EXEC_APPROVAL_REQUESTED,
        events::EXEC_APPROVAL_RESOLVED,
        events::NODE_PAIR_REQUESTED,
        events::NODE_PAIR_RESOLVED,
        events::NODE_INVOKE_REQUEST,
        events::NODE_EVENT,
        events::SESSION_UPDATED,
    ]
    .iter()
    .map(|e| e.to_string())
    .collect()
}

type HandlerResult = std::result::Result<Value, ErrorShape>;

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> std::result::Result<T, ErrorShape> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| ErrorShape::invalid_request(format!("invalid params: {e}")))
}

fn require_operator(client: &Client, scope: &str) -> std::result::Result<(), ErrorShape> {
    if client.role != ClientRole::Operator {
        return Err(ErrorShape::from(Error::Forbidden(format!(
            "requires operator role, have {}",
            client.role
        ))));
    }
    if client.has_scope(crate::protocol::ADMIN_SCOPE) || client.has_scope(scope) {
        Ok(())
    } else {
        Err(ErrorShape::from(Error::Forbidden(format!(
            "requires scope {scope}"
        ))))
    }
}

fn require_role(client: &Client, role: ClientRole) -> std::result::Result<(), ErrorShape> {
    if client.role == role {
        Ok(())
    } else {
        Err(ErrorShape::from(Error::Forbidden(format!(
            "requires {role} role, have {}",
            client.role
        ))))
    }
}

/// The connection a node-sourced request must own
fn require_verified_node(
    client: &Client,
    node_id: &str,
) -> std::result::Result<(), ErrorShape> {
    if client.node_id.as_deref() == Some(node_id) {
        Ok(())
    } else {
        Err(ErrorShape::from(Error::Forbidden(format!(
            "connection is not the verified owner of node {node_id}"
        ))))
    }
}

async fn node_summary(gateway: &Gateway, node: &PairedNode) -> Value {
    let connected = gateway.registry.find_by_node(&node.node_id).await.is_some();
    json!({
        "nodeId": node.node_id,
        "displayName": node.display_name,
        "caps": node.caps,
        "commands": node.commands,
        "pairedAt": node.paired_at,
        "connected": connected,
    })
}

/// Dispatch one request from an authenticated connection.
pub async fn dispatch(gateway: &Gateway, conn_id: &str, request: RequestFrame) -> ResponseFrame {
    let Some(client) = gateway.registry.get(conn_id).await else {
        return ResponseFrame::failure(
            request.id,
            ErrorShape::auth_failed("connection is not registered"),
        );
    };
    gateway.registry.touch(conn_id).await;

    debug!(conn_id = %conn_id, method = %request.method, "dispatch");
    let result = handle(gateway, &client, &request.method, request.params).await;
    match result {
        Ok(payload) => ResponseFrame::success(request.id, payload),
        Err(error) => ResponseFrame::failure(request.id, error),
    }
}

async fn handle(
    gateway: &Gateway,
    client: &Client,
    method: &str,
    params: Option<Value>,
) -> HandlerResult {
    match method {
        "connect" => Err(ErrorShape::invalid_request("already connected")),
        "ping" => Ok(json!({ "pong": true })),
        "health" => handle_health(gateway).await,
        "status" => handle_status(gateway).await,

        "node.pair.request" => handle_pair_request(gateway, client, params).await,
        "node.pair.list" => handle_pair_list(gateway, client).await,
        "node.pair.approve" => handle_pair_approve(gateway, client, params).await,
        "node.pair.reject" => handle_pair_reject(gateway, client, params).await,
        "node.pair.verify" => handle_pair_verify(gateway, client, params).await,
        "node.rename" => handle_node_rename(gateway, client, params).await,
        "node.list" => handle_node_list(gateway, client).await,
        "node.describe" => handle_node_describe(gateway, client, params).await,
        "node.invoke" => handle_node_invoke(gateway, client, params).await,
        "node.invoke.result" => handle_invoke_result(gateway, client, params).await,
        "node.event" => handle_node_event(gateway, client, params).await,

        "exec.approval.request" => handle_approval_request(gateway, client, params).await,
        "exec.approval.resolve" => handle_approval_resolve(gateway, client, params).await,

        "sessions.list" => handle_sessions_list(gateway, client).await,
        "sessions.patch" => handle_sessions_patch(gateway, client, params).await,
        "sessions.resolve" => handle_sessions_resolve(gateway, client, params).await,

        other => Err(ErrorShape::method_not_found(other)),
    }
}

// ============================================================================
// Service methods
// ============================================================================

async fn handle_health(gateway: &Gateway) -> HandlerResult {
    let uptime = (chrono::Utc::now() - gateway.started_at).num_milliseconds();
    Ok(json!({
        "ok": true,
        "uptimeMs": uptime.max(0),
        "clients": gateway.registry.len().await,
    }))
}

async fn handle_status(gateway: &Gateway) -> HandlerResult {
    Ok(json!({
        "version": crate::VERSION,
        "protocol": PROTOCOL_VERSION,
        "startedAt": gateway.started_at,
        "clients": gateway.registry.len().await,
        "pairedNodes": gateway.nodes.paired_nodes().await.len(),
        "lastSeq": gateway.broadcaster.last_seq(),
    }))
}

// ============================================================================
// Pairing
// ============================================================================

async fn handle_pair_request(
    gateway: &Gateway,
    client: &Client,
    params: Option<Value>,
) -> HandlerResult {
    require_role(client, ClientRole::Node)?;
    let params: NodePairRequestParams = parse_params(params)?;
    let request = gateway.nodes.request_pairing(params).await;
    gateway
        .broadcaster
        .broadcast(
            events::NODE_PAIR_REQUESTED,
            Some(serde_json::to_value(&request).map_err(|e| ErrorShape::internal(e.to_string()))?),
            Default::default(),
        )
        .await;
    Ok(json!({ "requestId": request.request_id, "status": "pending" }))
}

async fn handle_pair_list(gateway: &Gateway, client: &Client) -> HandlerResult {
    require_operator(client, PAIRING_SCOPE)?;
    let requests = gateway.nodes.pending_requests().await;
    let mut nodes = Vec::new();
    for node in gateway.nodes.paired_nodes().await {
        nodes.push(node_summary(gateway, &node).await);
    }
    Ok(json!({ "requests": requests, "nodes": nodes }))
}

async fn handle_pair_approve(
    gateway: &Gateway,
    client: &Client,
    params: Option<Value>,
) -> HandlerResult {
    require_operator(client, PAIRING_SCOPE)?;
    let params: NodePairApproveParams = parse_params(params)?;
    let node = gateway.nodes.approve(&params.request_id).await?;
    gateway
        .broadcaster
        .broadcast(
            events::NODE_PAIR_RESOLVED,
            Some(json!({
                "requestId": params.request_id,
                "nodeId": node.node_id,
                "approved": true,
            })),
            Default::default(),
        )
        .await;
    // The token travels only in this response; the approving operator hands
    // it to the node out of band.
    Ok(json!({
        "nodeId": node.node_id,
        "displayName": node.display_name,
        "token": node.token,
    }))
}

async fn handle_pair_reject(
    gateway: &Gateway,
    client: &Client,
    params: Option<Value>,
) -> HandlerResult {
    require_operator(client, PAIRING_SCOPE)?;
    let params: NodePairRejectParams = parse_params(params)?;
    let request = gateway.nodes.reject(&params.request_id).await?;
    gateway
        .broadcaster
        .broadcast(
            events::NODE_PAIR_RESOLVED,
            Some(json!({
                "requestId": request.request_id,
                "nodeId": request.node_id,
                "approved": false,
            })),
            Default::default(),
        )
        .await;
    Ok(json!({ "requestId": request.request_id }))
}

async fn handle_pair_verify(
    gateway: &Gateway,
    client: &Client,
    params: Option<Value>,
) -> HandlerResult {
    require_role(client, ClientRole::Node)?;
    let params: NodePairVerifyParams = parse_params(params)?;
    let node = gateway.nodes.verify(&params.node_id, &params.token).await?;
    gateway.registry.bind_node(&client.id, &params.node_id).await;
    Ok(json!({
        "nodeId": node.node_id,
        "displayName": node.display_name,
        "verified": true,
    }))
}

async fn handle_node_rename(
    gateway: &Gateway,
    client: &Client,
    params: Option<Value>,
) -> HandlerResult {
    require_operator(client, PAIRING_SCOPE)?;
    let params: NodeRenameParams = parse_params(params)?;
    let node = gateway
        .nodes
        .rename(&params.node_id, &params.display_name)
        .await?;
    Ok(node_summary(gateway, &node).await)
}

async fn handle_node_list(gateway: &Gateway, client: &Client) -> HandlerResult {
    require_role(client, ClientRole::Operator)?;
    let mut nodes = Vec::new();
    for node in gateway.nodes.paired_nodes().await {
        nodes.push(node_summary(gateway, &node).await);
    }
    Ok(json!({ "nodes": nodes }))
}

async fn handle_node_describe(
    gateway: &Gateway,
    client: &Client,
    params: Option<Value>,
) -> HandlerResult {
    require_role(client, ClientRole::Operator)?;
    let params: NodeDescribeParams = parse_params(params)?;
    let node = gateway.nodes.describe(&params.node_id).await?;
    Ok(node_summary(gateway, &node).await)
}

// ============================================================================
// Invocation
// ============================================================================

async fn handle_node_invoke(
    gateway: &Gateway,
    client: &Client,
    params: Option<Value>,
) -> HandlerResult {
    if client.role == ClientRole::Node {
        return Err(ErrorShape::from(Error::Forbidden(
            "nodes cannot invoke other nodes".to_string(),
        )));
    }
    let params: NodeInvokeParams = parse_params(params)?;
    let timeout = params
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(gateway.config.limits.invoke_timeout);

    let Some(target) = gateway.registry.find_by_node(&params.node_id).await else {
        return Err(ErrorShape::from(Error::NodeOffline(params.node_id)));
    };

    let ticket = gateway
        .nodes
        .begin_invoke(&params.node_id, &params.idempotency_key, &client.id)
        .await;
    let (invoke_id, outcome) = match ticket {
        InvokeTicket::Dispatch { invoke_id, outcome } => {
            let event = NodeInvokeRequestEvent {
                id: invoke_id.clone(),
                node_id: params.node_id.clone(),
                command: params.command.clone(),
                params_json: params.params.as_ref().map(|p| p.to_string()),
                timeout_ms: Some(timeout.as_millis() as u64),
                idempotency_key: Some(params.idempotency_key.clone()),
            };
            let payload =
                serde_json::to_value(&event).map_err(|e| ErrorShape::internal(e.to_string()))?;
            gateway
                .broadcaster
                .send_to(&target, events::NODE_INVOKE_REQUEST, Some(payload))
                .await;
            (invoke_id, outcome)
        }
        InvokeTicket::Join { invoke_id, outcome } => (invoke_id, outcome),
        InvokeTicket::Settling => {
            return Err(ErrorShape::from(Error::Timeout(format!(
                "operation {} on {} recently timed out; retry later",
                params.idempotency_key, params.node_id
            ))));
        }
    };

    match nodes::await_outcome(&gateway.nodes, &invoke_id, outcome, timeout).await {
        Some(InvokeOutcome::Ok(payload)) => Ok(json!({
            "id": invoke_id,
            "nodeId": params.node_id,
            "payload": payload,
        })),
        Some(InvokeOutcome::Err { code, message }) => Err(ErrorShape::new(
            code.as_deref().unwrap_or(error_codes::INTERNAL_ERROR),
            message.unwrap_or_else(|| "node reported an error".to_string()),
        )),
        Some(InvokeOutcome::Disconnected) => Err(ErrorShape::from(Error::Timeout(format!(
            "node {} disconnected before a result arrived",
            params.node_id
        )))),
        None => Err(ErrorShape::from(Error::Timeout(format!(
            "node {} did not answer within {}ms",
            params.node_id,
            timeout.as_millis()
        )))),
    }
}

async fn handle_invoke_result(
    gateway: &Gateway,
    client: &Client,
    params: Option<Value>,
) -> HandlerResult {
    let params: NodeInvokeResultParams = parse_params(params)?;
    require_verified_node(client, &params.node_id)?;

    let outcome = if params.ok {
        InvokeOutcome::Ok(params.payload)
    } else {
        let error = params.error.unwrap_or_default();
        InvokeOutcome::Err {
            code: error.code,
            message: error.message,
        }
    };
    let accepted = gateway
        .nodes
        .resolve_invoke(&params.id, &params.node_id, outcome)
        .await;
    Ok(json!({ "accepted": accepted }))
}

async fn handle_node_event(
    gateway: &Gateway,
    client: &Client,
    params: Option<Value>,
) -> HandlerResult {
    let Some(node_id) = client.node_id.clone() else {
        return Err(ErrorShape::from(Error::Forbidden(
            "connection has no verified node".to_string(),
        )));
    };
    let params: NodeEventParams = parse_params(params)?;
    let seq = gateway
        .broadcaster
        .broadcast(
            events::NODE_EVENT,
            Some(json!({
                "nodeId": node_id,
                "event": params.event,
                "payload": params.payload,
            })),
            Default::default(),
        )
        .await;
    Ok(json!({ "seq": seq }))
}

// ============================================================================
// Exec approvals
// ============================================================================

async fn handle_approval_request(
    gateway: &Gateway,
    client: &Client,
    params: Option<Value>,
) -> HandlerResult {
    if client.role == ClientRole::Node {
        return Err(ErrorShape::from(Error::Forbidden(
            "nodes cannot request exec approvals".to_string(),
        )));
    }
    let params: ExecApprovalRequestParams = parse_params(params)?;
    let timeout = params
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(gateway.config.limits.approval_timeout);

    let (pending, rx) = gateway.approvals.create(&params).await;
    gateway
        .broadcaster
        .broadcast(
            events::EXEC_APPROVAL_REQUESTED,
            Some(serde_json::to_value(&pending).map_err(|e| ErrorShape::internal(e.to_string()))?),
            Default::default(),
        )
        .await;

    // Blocks the requester until a decision or the deadline; null decision
    // means nobody approved in time.
    let decision = gateway
        .approvals
        .wait_for_decision(&pending.id, rx, timeout)
        .await;
    Ok(json!({ "id": pending.id, "decision": decision }))
}

async fn handle_approval_resolve(
    gateway: &Gateway,
    client: &Client,
    params: Option<Value>,
) -> HandlerResult {
    require_operator(client, APPROVALS_SCOPE)?;
    let params: ExecApprovalResolveParams = parse_params(params)?;
    let resolved = gateway.approvals.resolve(&params.id, params.decision).await?;
    gateway
        .broadcaster
        .broadcast(
            events::EXEC_APPROVAL_RESOLVED,
            Some(json!({
                "id": resolved.id,
                "command": resolved.command,
                "decision": params.decision,
            })),
            Default::default(),
        )
        .await;
    Ok(json!({ "id": resolved.id, "decision": params.decision }))
}

// ============================================================================
// Sessions
// ============================================================================

async fn handle_sessions_list(gateway: &Gateway, client: &Client) -> HandlerResult {
    if client.role == ClientRole::Node {
        return Err(ErrorShape::from(Error::Forbidden(
            "nodes cannot read sessions".to_string(),
        )));
    }
    let sessions = gateway.sessions.list().await;
    Ok(json!({ "sessions": sessions }))
}

async fn handle_sessions_patch(
    gateway: &Gateway,
    client: &Client,
    params: Option<Value>,
) -> HandlerResult {
    if client.role == ClientRole::Node {
        return Err(ErrorShape::from(Error::Forbidden(
            "nodes cannot patch sessions".to_string(),
        )));
    }
    let params: SessionsPatchParams = parse_params(params)?;
    let entry = gateway.sessions.patch(&params.key, &params.patch).await?;
    let entry_value =
        serde_json::to_value(&entry).map_err(|e| ErrorShape::internal(e.to_string()))?;
    gateway
        .broadcaster
        .broadcast(
            events::SESSION_UPDATED,
            Some(json!({ "key": params.key, "entry": entry_value })),
            Default::default(),
        )
        .await;
    Ok(json!({ "key": params.key, "entry": entry_value }))
}

async fn handle_sessions_resolve(
    gateway: &Gateway,
    client: &Client,
    params: Option<Value>,
) -> HandlerResult {
    if client.role == ClientRole::Node {
        return Err(ErrorShape::from(Error::Forbidden(
            "nodes cannot read sessions".to_string(),
        )));
    }
    let params: SessionsResolveParams = parse_params(params)?;
    let (key, entry) = gateway.sessions.resolve(&params).await?;
    Ok(json!({
        "key": key,
        "entry": serde_json::to_value(&entry).map_err(|e| ErrorShape::internal(e.to_string()))?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gateway::registry::test_support::test_client;
    use crate::gateway::registry::Outbound;
    use crate::gateway::MemorySessionStore;
    use crate::protocol::ADMIN_SCOPE;
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn test_gateway() -> Arc<Gateway> {
        Gateway::with_store(Config::default(), Box::new(MemorySessionStore::default()))
            .await
            .unwrap()
    }

    async fn call(gateway: &Gateway, conn_id: &str, method: &str, params: Value) -> ResponseFrame {
        dispatch(
            gateway,
            conn_id,
            RequestFrame {
                id: "r1".to_string(),
                method: method.to_string(),
                params: Some(params),
            },
        )
        .await
    }

    fn next_event(rx: &mut UnboundedReceiver<Outbound>) -> Option<Value> {
        while let Ok(msg) = rx.try_recv() {
            if let Outbound::Frame(frame) = msg {
                let value: Value = serde_json::from_str(&frame).unwrap();
                if value["type"] == "event" {
                    return Some(value);
                }
            }
        }
        None
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let gateway = test_gateway().await;
        let (client, _rx) = test_client("op", ClientRole::Operator, &[]);
        gateway.registry.insert(client).await;

        let res = call(&gateway, "op", "node.frobnicate", json!({})).await;
        assert!(!res.ok);
        assert_eq!(res.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_params_rejected() {
        let gateway = test_gateway().await;
        let (client, _rx) = test_client("op", ClientRole::Operator, &[ADMIN_SCOPE]);
        gateway.registry.insert(client).await;

        // Unknown property must be rejected, not ignored.
        let res = call(
            &gateway,
            "op",
            "node.pair.approve",
            json!({"requestId": "x", "bogus": 1}),
        )
        .await;
        assert!(!res.ok);
        assert_eq!(res.error.unwrap().code, error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_pairing_requires_operator_scope() {
        let gateway = test_gateway().await;
        let (node, _n_rx) = test_client("n", ClientRole::Node, &[]);
        let (bare_op, _b_rx) = test_client("bare", ClientRole::Operator, &[]);
        gateway.registry.insert(node).await;
        gateway.registry.insert(bare_op).await;

        let res = call(&gateway, "n", "node.pair.approve", json!({"requestId": "x"})).await;
        assert_eq!(res.error.unwrap().code, error_codes::FORBIDDEN);

        let res = call(&gateway, "bare", "node.pair.approve", json!({"requestId": "x"})).await;
        assert_eq!(res.error.unwrap().code, error_codes::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_pairing_flow_end_to_end() {
        let gateway = test_gateway().await;
        let (node, _n_rx) = test_client("n", ClientRole::Node, &[]);
        let (operator, mut op_rx) =
            test_client("op", ClientRole::Operator, &[crate::protocol::PAIRING_SCOPE]);
        gateway.registry.insert(node).await;
        gateway.registry.insert(operator).await;

        let res = call(
            &gateway,
            "n",
            "node.pair.request",
            json!({"nodeId": "mac-mini", "displayName": "Mac mini", "commands": ["camera.snap"]}),
        )
        .await;
        assert!(res.ok);
        let request_id = res.payload.unwrap()["requestId"].as_str().unwrap().to_string();

        // Scoped operator was notified.
        let event = next_event(&mut op_rx).unwrap();
        assert_eq!(event["event"], events::NODE_PAIR_REQUESTED);
        assert_eq!(event["payload"]["nodeId"], "mac-mini");

        let res = call(&gateway, "op", "node.pair.approve", json!({"requestId": request_id})).await;
        assert!(res.ok);
        let token = res.payload.unwrap()["token"].as_str().unwrap().to_string();

        let res = call(
            &gateway,
            "n",
            "node.pair.verify",
            json!({"nodeId": "mac-mini", "token": token}),
        )
        .await;
        assert!(res.ok);

        let res = call(&gateway, "op", "node.list", json!({})).await;
        let nodes = res.payload.unwrap()["nodes"].clone();
        assert_eq!(nodes[0]["nodeId"], "mac-mini");
        assert_eq!(nodes[0]["connected"], true);
    }

    #[tokio::test]
    async fn test_invoke_offline_node() {
        let gateway = test_gateway().await;
        let (operator, _rx) = test_client("op", ClientRole::Operator, &[]);
        gateway.registry.insert(operator).await;

        let res = call(
            &gateway,
            "op",
            "node.invoke",
            json!({"nodeId": "ghost", "command": "x", "idempotencyKey": "k"}),
        )
        .await;
        assert_eq!(res.error.unwrap().code, error_codes::NODE_OFFLINE);
    }

    #[tokio::test]
    async fn test_invoke_round_trip() {
        let gateway = test_gateway().await;
        let (operator, _op_rx) = test_client("op", ClientRole::Operator, &[]);
        let (mut node, mut node_rx) = test_client("n", ClientRole::Node, &[]);
        node.node_id = Some("mac-mini".to_string());
        gateway.registry.insert(operator).await;
        gateway.registry.insert(node).await;

        let invoking = {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                call(
                    &gateway,
                    "op",
                    "node.invoke",
                    json!({
                        "nodeId": "mac-mini",
                        "command": "camera.snap",
                        "params": {"lens": "wide"},
                        "idempotencyKey": "snap-1",
                    }),
                )
                .await
            })
        };

        // Node side: receive the pushed invocation and answer it.
        let event = loop {
            if let Some(event) = next_event(&mut node_rx) {
                break event;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(event["event"], events::NODE_INVOKE_REQUEST);
        assert_eq!(event["payload"]["command"], "camera.snap");
        let invoke_id = event["payload"]["id"].as_str().unwrap().to_string();

        let res = call(
            &gateway,
            "n",
            "node.invoke.result",
            json!({"id": invoke_id, "nodeId": "mac-mini", "ok": true, "payload": {"file": "a.jpg"}}),
        )
        .await;
        assert!(res.ok);
        assert_eq!(res.payload.unwrap()["accepted"], true);

        let res = invoking.await.unwrap();
        assert!(res.ok);
        assert_eq!(res.payload.unwrap()["payload"]["file"], "a.jpg");
    }

    #[tokio::test]
    async fn test_invoke_result_from_unverified_connection_forbidden() {
        let gateway = test_gateway().await;
        let (node, _rx) = test_client("n", ClientRole::Node, &[]);
        gateway.registry.insert(node).await;

        let res = call(
            &gateway,
            "n",
            "node.invoke.result",
            json!({"id": "i1", "nodeId": "mac-mini", "ok": true}),
        )
        .await;
        assert_eq!(res.error.unwrap().code, error_codes::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_exec_approval_flow() {
        let gateway = test_gateway().await;
        let (agent, _a_rx) = test_client("agent", ClientRole::Agent, &[]);
        let (operator, mut op_rx) =
            test_client("op", ClientRole::Operator, &[crate::protocol::APPROVALS_SCOPE]);
        gateway.registry.insert(agent).await;
        gateway.registry.insert(operator).await;

        let requesting = {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                call(
                    &gateway,
                    "agent",
                    "exec.approval.request",
                    json!({"command": "rm -rf ./build", "timeoutMs": 5000}),
                )
                .await
            })
        };

        let event = loop {
            if let Some(event) = next_event(&mut op_rx) {
                break event;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(event["event"], events::EXEC_APPROVAL_REQUESTED);
        let id = event["payload"]["id"].as_str().unwrap().to_string();

        let res = call(
            &gateway,
            "op",
            "exec.approval.resolve",
            json!({"id": id, "decision": "allow-once"}),
        )
        .await;
        assert!(res.ok);

        let res = requesting.await.unwrap();
        assert!(res.ok);
        assert_eq!(res.payload.unwrap()["decision"], "allow-once");

        // Resolution is terminal.
        let res = call(
            &gateway,
            "op",
            "exec.approval.resolve",
            json!({"id": id, "decision": "deny"}),
        )
        .await;
        assert_eq!(res.error.unwrap().code, error_codes::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sessions_patch_broadcasts_update() {
        let gateway = test_gateway().await;
        let (operator, mut op_rx) = test_client("op", ClientRole::Operator, &[]);
        gateway.registry.insert(operator).await;

        let res = call(
            &gateway,
            "op",
            "sessions.patch",
            json!({"key": "agent:main", "patch": {"elevatedLevel": "on"}}),
        )
        .await;
        assert!(res.ok);
        assert_eq!(
            res.payload.unwrap()["entry"]["elevatedLevel"],
            "on"
        );

        let event = next_event(&mut op_rx).unwrap();
        assert_eq!(event["event"], events::SESSION_UPDATED);
        assert_eq!(event["payload"]["key"], "agent:main");

        let res = call(
            &gateway,
            "op",
            "sessions.patch",
            json!({"key": "agent:main", "patch": {"elevatedLevel": "sideways"}}),
        )
        .await;
        assert_eq!(res.error.unwrap().code, error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let gateway = test_gateway().await;
        let (operator, _rx) = test_client("op", ClientRole::Operator, &[]);
        gateway.registry.insert(operator).await;

        let res = call(&gateway, "op", "health", json!({})).await;
        assert!(res.ok);
        assert_eq!(res.payload.unwrap()["clients"], 1);

        let res = call(&gateway, "op", "status", json!({})).await;
        assert!(res.ok);
        let payload = res.payload.unwrap();
        assert_eq!(payload["protocol"], 3);
        assert_eq!(payload["version"], crate::VERSION);
    }
}
