//! Gateway frame envelopes
//!
//! Top-level wire format for gateway messages: requests, responses, and
//! server-pushed events, JSON-encoded over a message-oriented WebSocket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::StateVersion;

/// Protocol version spoken by this server
pub const PROTOCOL_VERSION: u32 = 3;

/// Oldest protocol version this server still accepts
pub const PROTOCOL_VERSION_MIN: u32 = 3;

/// Gateway frame - Top-level message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    /// Request from client
    #[serde(rename = "req")]
    Request(RequestFrame),
    /// Response from server
    #[serde(rename = "res")]
    Response(ResponseFrame),
    /// Event pushed by server
    #[serde(rename = "event")]
    Event(EventFrame),
}

/// Request frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestFrame {
    /// Unique request ID (caller-chosen)
    pub id: String,
    /// Method name
    pub method: String,
    /// Parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Response frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResponseFrame {
    /// Request ID this responds to
    pub id: String,
    /// Whether the request succeeded
    pub ok: bool,
    /// Result payload (success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Error details (failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

/// Event frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EventFrame {
    /// Event name
    pub event: String,
    /// Event payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Process-wide broadcast sequence number
    pub seq: u64,
    /// Optional presence/health state versions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_version: Option<StateVersion>,
}

/// Structured error carried in failed responses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    /// Error code (stable, machine-readable)
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Additional data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Whether the caller may retry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// Suggested retry delay
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Standard error codes
pub mod error_codes {
    /// Malformed or schema-invalid request
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    /// Method not found
    pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
    /// Protocol version range does not overlap the server's
    pub const PROTOCOL_MISMATCH: &str = "PROTOCOL_MISMATCH";
    /// Credentials rejected
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    /// Caller lacks the role or scope for a guarded action
    pub const FORBIDDEN: &str = "FORBIDDEN";
    /// Resource not found
    pub const NOT_FOUND: &str = "NOT_FOUND";
    /// Target node has no live connection
    pub const NODE_OFFLINE: &str = "NODE_OFFLINE";
    /// Invocation exceeded its deadline
    pub const TIMEOUT: &str = "TIMEOUT";
    /// Internal error
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

impl ErrorShape {
    /// Create a new error shape
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        ErrorShape {
            code: code.to_string(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    /// Add details to the error
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Mark the error as retryable
    pub fn retryable(mut self) -> Self {
        self.retryable = Some(true);
        self
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_REQUEST, message)
    }

    /// Create a method not found error
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(error_codes::NOT_FOUND, message)
    }

    /// Create an auth failed error
    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new(error_codes::AUTH_FAILED, message)
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }
}

impl From<crate::error::Error> for ErrorShape {
    fn from(err: crate::error::Error) -> Self {
        ErrorShape::from(&err)
    }
}

impl From<&crate::error::Error> for ErrorShape {
    fn from(err: &crate::error::Error) -> Self {
        use crate::error::Error;
        let code = match err {
            Error::Protocol(_) => error_codes::INVALID_REQUEST,
            Error::Auth(_) => error_codes::AUTH_FAILED,
            Error::Forbidden(_) => error_codes::FORBIDDEN,
            Error::InvalidInput(_) => error_codes::INVALID_REQUEST,
            Error::NotFound(_) => error_codes::NOT_FOUND,
            Error::NodeOffline(_) => error_codes::NODE_OFFLINE,
            Error::Timeout(_) => error_codes::TIMEOUT,
            _ => error_codes::INTERNAL_ERROR,
        };
        let mut shape = ErrorShape::new(code, err.to_string());
        if err.is_retryable() {
            shape.retryable = Some(true);
        }
        shape
    }
}

impl ResponseFrame {
    /// Create a success response
    pub fn success(id: impl Into<String>, payload: Value) -> Self {
        ResponseFrame {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    /// Create an error response
    pub fn failure(id: impl Into<String>, error: ErrorShape) -> Self {
        ResponseFrame {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

impl EventFrame {
    /// Create a new event frame
    pub fn new(event: impl Into<String>, payload: Option<Value>, seq: u64) -> Self {
        EventFrame {
            event: event.into(),
            payload,
            seq,
            state_version: None,
        }
    }

    /// Attach presence/health state versions
    pub fn with_state_version(mut self, state_version: StateVersion) -> Self {
        self.state_version = Some(state_version);
        self
    }
}
