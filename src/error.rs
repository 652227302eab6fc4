//! Error types for Agentgate

use thiserror::Error;

/// Result type alias using Agentgate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Agentgate
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed frame or handshake shape; fatal to the connection
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Credentials rejected
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Client lacks the scope or role for a guarded action
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Well-formed but semantically invalid params
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Target node has no live connection
    #[error("Node offline: {0}")]
    NodeOffline(String),

    /// Operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Environment variable error
    #[error("Environment error: {0}")]
    Env(#[from] std::env::VarError),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Io(_))
    }

    /// Check if error is a client error (caller's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidInput(_)
                | Error::NotFound(_)
                | Error::Auth(_)
                | Error::Forbidden(_)
                | Error::Protocol(_)
        )
    }
}
