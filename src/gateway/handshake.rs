//! Connection handshake & auth
//!
//! Validates an inbound client's protocol version range and credentials,
//! assigns role and scopes, and accepts or rejects before any other traffic
//! is processed. Structural failures close the socket with no response so
//! protocol details never leak to unauthenticated peers; auth failures are
//! reported as a normal error response over the still-open transport.

use std::collections::HashSet;

use chrono::Utc;
use secrecy::ExposeSecret;
use serde_json::Value;
use tracing::{debug, info};

use super::registry::{Client, OutboundHandle};
use crate::config::{AuthConfig, AuthMode, Config};
use crate::protocol::frames::{error_codes, ErrorShape};
use crate::protocol::{
    ClientRole, ConnectParams, HelloOk, HelloPolicy, HelloServer, PROTOCOL_VERSION,
    PROTOCOL_VERSION_MIN,
};

/// Outcome of evaluating a connect request
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Handshake accepted; register the client and send hello-ok
    Accepted {
        /// Registry entry for the new connection
        client: Client,
        /// Payload for the success response
        hello: HelloOk,
    },
    /// Handshake rejected; send the error response, then close
    Rejected(ErrorShape),
    /// Structurally invalid; close without any response
    Close,
}

/// Narrow the requested scopes for a role. The server may narrow but never
/// widen: operators keep what they asked for, other roles lose every
/// operator scope.
fn narrow_scopes(role: ClientRole, requested: &[String]) -> HashSet<String> {
    requested
        .iter()
        .filter(|scope| role == ClientRole::Operator || !scope.starts_with("operator."))
        .cloned()
        .collect()
}

fn check_auth(auth: &AuthConfig, params: &ConnectParams) -> Result<(), ErrorShape> {
    match auth.mode {
        AuthMode::None => Ok(()),
        AuthMode::Token => {
            let presented = params
                .auth
                .as_ref()
                .and_then(|a| a.token.as_deref())
                .unwrap_or_default();
            if !presented.is_empty()
                && auth
                    .tokens
                    .iter()
                    .any(|token| token.expose_secret() == presented)
            {
                Ok(())
            } else {
                Err(ErrorShape::auth_failed("invalid or missing token"))
            }
        }
        AuthMode::Password => {
            let presented = params
                .auth
                .as_ref()
                .and_then(|a| a.password.as_deref())
                .unwrap_or_default();
            let expected = auth.password.as_ref().map(|p| p.expose_secret());
            match expected {
                Some(expected) if !presented.is_empty() && presented == expected => Ok(()),
                Some(_) => Err(ErrorShape::auth_failed("invalid or missing password")),
                None => Err(ErrorShape::auth_failed("password auth not configured")),
            }
        }
    }
}

/// Evaluate a connect request.
///
/// The version-range check runs before credentials are looked at, so a
/// client with both a bad range and bad credentials is told about the
/// version mismatch.
pub fn evaluate_connect(
    config: &Config,
    conn_id: &str,
    outbound: OutboundHandle,
    params: Option<Value>,
) -> HandshakeOutcome {
    let Some(params) = params else {
        return HandshakeOutcome::Close;
    };
    let params: ConnectParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(err) => {
            debug!(conn_id = %conn_id, error = %err, "malformed connect params");
            return HandshakeOutcome::Close;
        }
    };

    if params.min_protocol > params.max_protocol
        || params.max_protocol < PROTOCOL_VERSION_MIN
        || params.min_protocol > PROTOCOL_VERSION
    {
        return HandshakeOutcome::Rejected(ErrorShape::new(
            error_codes::PROTOCOL_MISMATCH,
            format!(
                "unsupported protocol range [{}, {}]; server speaks [{}, {}]",
                params.min_protocol, params.max_protocol, PROTOCOL_VERSION_MIN, PROTOCOL_VERSION
            ),
        ));
    }

    if let Err(error) = check_auth(&config.auth, &params) {
        return HandshakeOutcome::Rejected(error);
    }

    let role = params.role;
    let scopes = narrow_scopes(role, &params.scopes);

    let client = Client {
        id: conn_id.to_string(),
        client_id: params.client.id.clone(),
        role,
        scopes: scopes.clone(),
        caps: params.caps.clone(),
        commands: params.commands.clone(),
        protocol: PROTOCOL_VERSION.min(params.max_protocol),
        outbound,
        last_seen: Utc::now(),
        node_id: None,
    };

    let mut granted: Vec<String> = scopes.into_iter().collect();
    granted.sort();

    let hello = HelloOk {
        protocol: client.protocol,
        server: HelloServer {
            version: crate::VERSION.to_string(),
            conn_id: conn_id.to_string(),
        },
        methods: super::dispatch::method_names(),
        events: super::dispatch::event_names(),
        role,
        scopes: granted,
        policy: HelloPolicy {
            max_payload: config.limits.max_payload,
            max_buffered_bytes: config.limits.max_buffered_bytes,
            tick_interval_ms: config.limits.tick_interval.as_millis() as u64,
        },
    };

    info!(conn_id = %conn_id, client_id = %params.client.id, role = %role, "handshake accepted");
    HandshakeOutcome::Accepted { client, hello }
}
