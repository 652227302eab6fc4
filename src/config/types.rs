//! Configuration types

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Gateway listener configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Transport limits and timing
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Session store configuration
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Model catalog offered to session patches
    #[serde(default = "default_models")]
    pub models: Vec<ModelEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gateway: GatewayConfig::default(),
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
            sessions: SessionsConfig::default(),
            models: default_models(),
        }
    }
}

impl Config {
    /// Load configuration from files and environment variables
    pub fn from_env() -> crate::error::Result<Self> {
        super::io::load_config()
    }
}

/// Gateway listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

fn default_port() -> u16 {
    18789
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Authentication mode
    #[serde(default)]
    pub mode: AuthMode,
    /// Shared password (for password mode)
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_opt_secret"
    )]
    pub password: Option<SecretString>,
    /// Allowed tokens (for token mode)
    #[serde(default, serialize_with = "serialize_secret_list")]
    pub tokens: Vec<SecretString>,
}

// Config files are the source of truth for credentials, so saving must
// round-trip them; SecretString only guards the in-memory copies.
fn serialize_opt_secret<S: Serializer>(
    value: &Option<SecretString>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(secret) => serializer.serialize_some(secret.expose_secret()),
        None => serializer.serialize_none(),
    }
}

fn serialize_secret_list<S: Serializer>(
    value: &[SecretString],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(value.iter().map(|secret| secret.expose_secret()))
}

/// Authentication mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// No authentication (local only)
    #[default]
    None,
    /// Password authentication
    Password,
    /// Token-based authentication
    Token,
}

/// Transport limits and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound frame size in bytes
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    /// Outbound queue threshold before a client counts as slow
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,
    /// Interval between best-effort tick events
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Deadline for the connect handshake
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Default node.invoke deadline when the caller omits timeoutMs
    #[serde(default = "default_invoke_timeout", with = "humantime_serde")]
    pub invoke_timeout: Duration,
    /// Deadline for exec approval decisions
    #[serde(default = "default_approval_timeout", with = "humantime_serde")]
    pub approval_timeout: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_payload: default_max_payload(),
            max_buffered_bytes: default_max_buffered_bytes(),
            tick_interval: default_tick_interval(),
            handshake_timeout: default_handshake_timeout(),
            invoke_timeout: default_invoke_timeout(),
            approval_timeout: default_approval_timeout(),
        }
    }
}

fn default_max_payload() -> usize {
    1024 * 1024
}

fn default_max_buffered_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_invoke_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_approval_timeout() -> Duration {
    Duration::from_secs(120)
}

/// Session store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Path to the JSON session store; defaults to sessions.json in the
    /// state directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
}

/// One entry in the model catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Provider name (anthropic, openai, ...)
    pub provider: String,
    /// Model identifier within the provider
    pub id: String,
}

fn default_models() -> Vec<ModelEntry> {
    vec![
        ModelEntry {
            provider: "anthropic".to_string(),
            id: "claude-opus-4-5".to_string(),
        },
        ModelEntry {
            provider: "anthropic".to_string(),
            id: "claude-sonnet-4".to_string(),
        },
        ModelEntry {
            provider: "openai".to_string(),
            id: "gpt-5.2".to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.gateway.port, 18789);
        assert_eq!(config.auth.mode, AuthMode::None);
        assert_eq!(config.limits.max_buffered_bytes, 4 * 1024 * 1024);
        assert!(config.models.iter().any(|m| m.provider == "anthropic"));
    }
}
