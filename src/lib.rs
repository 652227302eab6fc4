//! # Agentgate
//!
//! A multi-client WebSocket control plane for LLM chat-agent platforms.
//!
//! ## Features
//!
//! - **Authenticated Connections:** Protocol-version negotiation plus token or
//!   password auth before any other traffic is processed
//! - **Scope-Gated Broadcast:** Sensitive events reach operator clients only,
//!   with per-client backpressure policies
//! - **Request/Response RPC:** Every request correlates to exactly one
//!   response, with per-method schema validation
//! - **Node Invocation:** Remote node pairing, trust verification, and command
//!   invocation with timeout and idempotency semantics
//! - **Session Patching:** Guarded mutations onto an externally-owned session
//!   store with cross-field invariants

pub mod config;
pub mod error;
pub mod gateway;
pub mod protocol;

pub use config::Config;
pub use error::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
