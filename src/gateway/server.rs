//! WebSocket listener
//!
//! Accepts connections, runs the connect handshake, then pumps frames
//! between the socket and the dispatcher. Each connection gets a reader
//! (this task) and a writer task draining its outbound queue; requests are
//! handled concurrently so a blocking call (exec approvals, node invokes)
//! never stalls the connection's other traffic.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::handshake::{evaluate_connect, HandshakeOutcome};
use super::registry::{Outbound, OutboundHandle};
use super::{BroadcastOpts, Gateway};
use crate::error::Result;
use crate::protocol::events;
use crate::protocol::frames::{ErrorShape, GatewayFrame, RequestFrame, ResponseFrame};

/// Build the HTTP router: the WebSocket endpoint plus a plain health probe
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/", any(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Bind and serve until ctrl-c
pub async fn serve(gateway: Arc<Gateway>) -> Result<()> {
    let addr = format!(
        "{}:{}",
        gateway.config.gateway.bind, gateway.config.gateway.port
    );
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "gateway listening");

    spawn_tick(gateway.clone());

    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}

/// Periodic best-effort tick so clients can detect a stalled transport
fn spawn_tick(gateway: Arc<Gateway>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(gateway.config.limits.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            gateway
                .broadcaster
                .broadcast(
                    events::TICK,
                    Some(json!({ "ts": chrono::Utc::now().timestamp_millis() })),
                    BroadcastOpts {
                        drop_if_slow: true,
                        state_version: None,
                    },
                )
                .await;
        }
    });
}

async fn health_handler(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "clients": gateway.registry.len().await,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway>>,
) -> impl IntoResponse {
    let max_payload = gateway.config.limits.max_payload;
    ws.max_message_size(max_payload)
        .on_upgrade(move |socket| handle_socket(gateway, socket))
}

async fn handle_socket(gateway: Arc<Gateway>, socket: WebSocket) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();

    // Writer task: drain the outbound queue onto the socket.
    let (outbound, mut outbound_rx) = OutboundHandle::new();
    let flush_handle = outbound.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            match msg {
                Outbound::Frame(frame) => {
                    let len = frame.len();
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                    flush_handle.mark_flushed(len);
                }
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Handshake: the first frame must be a connect request, inside the
    // handshake deadline.
    let accepted = tokio::time::timeout(
        gateway.config.limits.handshake_timeout,
        run_handshake(&gateway, &conn_id, &outbound, &mut stream),
    )
    .await
    .unwrap_or(false);

    if accepted {
        read_loop(&gateway, &conn_id, &outbound, &mut stream).await;
    }

    gateway.handle_disconnect(&conn_id).await;
    drop(outbound);
    let _ = writer.await;
    debug!(conn_id = %conn_id, "connection closed");
}

async fn run_handshake(
    gateway: &Arc<Gateway>,
    conn_id: &str,
    outbound: &OutboundHandle,
    stream: &mut futures::stream::SplitStream<WebSocket>,
) -> bool {
    let request = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<GatewayFrame>(&text) {
                    Ok(GatewayFrame::Request(request)) if request.method == "connect" => {
                        break request;
                    }
                    _ => {
                        // Anything else before connect is structural.
                        debug!(conn_id = %conn_id, "non-connect frame before handshake");
                        return false;
                    }
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            _ => return false,
        }
    };

    match evaluate_connect(&gateway.config, conn_id, outbound.clone(), request.params) {
        HandshakeOutcome::Accepted { client, hello } => {
            let payload = match serde_json::to_value(&hello) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(conn_id = %conn_id, error = %err, "failed to encode hello");
                    return false;
                }
            };
            gateway.registry.insert(client).await;
            send_response(outbound, ResponseFrame::success(request.id, payload));
            true
        }
        HandshakeOutcome::Rejected(error) => {
            send_response(outbound, ResponseFrame::failure(request.id, error));
            false
        }
        HandshakeOutcome::Close => false,
    }
}

async fn read_loop(
    gateway: &Arc<Gateway>,
    conn_id: &str,
    outbound: &OutboundHandle,
    stream: &mut futures::stream::SplitStream<WebSocket>,
) {
    while let Some(Ok(msg)) = stream.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Binary frames are not part of the protocol.
            Message::Binary(_) => {
                debug!(conn_id = %conn_id, "ignoring binary frame");
                continue;
            }
            _ => continue,
        };

        let request = match serde_json::from_str::<GatewayFrame>(&text) {
            Ok(GatewayFrame::Request(request)) => request,
            Ok(_) => {
                debug!(conn_id = %conn_id, "ignoring non-request frame");
                continue;
            }
            Err(err) => {
                send_response(
                    outbound,
                    ResponseFrame::failure(
                        extract_id(&text),
                        ErrorShape::invalid_request(format!("malformed frame: {err}")),
                    ),
                );
                continue;
            }
        };

        spawn_request(gateway.clone(), conn_id.to_string(), outbound.clone(), request);
    }
}

/// Handle one request off-loop so blocking methods don't stall the socket
fn spawn_request(
    gateway: Arc<Gateway>,
    conn_id: String,
    outbound: OutboundHandle,
    request: RequestFrame,
) {
    tokio::spawn(async move {
        let response = super::dispatch::dispatch(&gateway, &conn_id, request).await;
        send_response(&outbound, response);
    });
}

fn send_response(outbound: &OutboundHandle, response: ResponseFrame) {
    match serde_json::to_string(&GatewayFrame::Response(response)) {
        Ok(encoded) => {
            outbound.send_frame(encoded);
        }
        Err(err) => warn!(error = %err, "failed to encode response frame"),
    }
}

/// Best-effort request id recovery from a frame that failed to parse, so
/// the error response still correlates when possible.
fn extract_id(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(String::from))
        .unwrap_or_default()
}
