//! Configuration file paths

use std::path::PathBuf;

/// Directory holding the config file (~/.agentgate)
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("AGENTGATE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .map(|h| h.join(".agentgate"))
        .unwrap_or_else(|| PathBuf::from(".agentgate"))
}

/// Path to the config file
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Directory for runtime state (session store, pairing records)
pub fn state_dir() -> PathBuf {
    config_dir().join("state")
}

/// Default path of the JSON session store
pub fn sessions_path() -> PathBuf {
    state_dir().join("sessions.json")
}
