//! Session store & patch semantics
//!
//! Session entries are keyed by a store key and patched with tri-state
//! fields: an absent key leaves the field alone, an explicit null clears it,
//! a value sets it. A patch is all-or-nothing: every field is validated
//! before any of them is applied. Changing the model selection invalidates
//! any auth-profile override the entry carried, since the override was
//! negotiated for the previous model.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ModelEntry;
use crate::error::{Error, Result};
use crate::protocol::{PatchField, SessionPatch, SessionsResolveParams};

/// One session entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionEntry {
    /// Session id recorded by the agent runtime
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Last time this entry was patched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Elevated permissions level ("on" or "off")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevated_level: Option<String>,
    /// Provider half of the model override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_override: Option<String>,
    /// Model half of the model override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
    /// Auth profile pinned for this session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_profile_override: Option<String>,
    /// Where the auth profile override came from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_profile_override_source: Option<String>,
    /// Compaction count at override time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_profile_override_compaction_count: Option<u64>,
    /// Free-form label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Persistence for the session map
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the full session map
    async fn load(&self) -> Result<HashMap<String, SessionEntry>>;
    /// Persist the full session map
    async fn save(&self, sessions: &HashMap<String, SessionEntry>) -> Result<()>;
}

/// In-memory store (tests, ephemeral gateways)
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<HashMap<String, SessionEntry>> {
        Ok(self.sessions.lock().await.clone())
    }

    async fn save(&self, sessions: &HashMap<String, SessionEntry>) -> Result<()> {
        *self.sessions.lock().await = sessions.clone();
        Ok(())
    }
}

/// JSON-file-backed store
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    /// Create a store over a JSON file; the file is created on first save
    pub fn new(path: PathBuf) -> Self {
        FileSessionStore { path }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<HashMap<String, SessionEntry>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "invalid session store {}: {e}",
                self.path.display()
            ))
        })
    }

    async fn save(&self, sessions: &HashMap<String, SessionEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(sessions)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

/// Model lookup seam for session patches
pub trait ModelCatalog: Send + Sync {
    /// Exact provider/model lookup
    fn find(&self, provider: &str, model: &str) -> Option<ModelEntry>;
    /// All entries matching a bare model id
    fn find_by_id(&self, model: &str) -> Vec<ModelEntry>;
}

/// Catalog over the configured model list
#[derive(Debug, Clone)]
pub struct StaticModelCatalog {
    models: Vec<ModelEntry>,
}

impl StaticModelCatalog {
    /// Build a catalog from configured entries
    pub fn new(models: Vec<ModelEntry>) -> Self {
        StaticModelCatalog { models }
    }
}

impl ModelCatalog for StaticModelCatalog {
    fn find(&self, provider: &str, model: &str) -> Option<ModelEntry> {
        self.models
            .iter()
            .find(|m| m.provider == provider && m.id == model)
            .cloned()
    }

    fn find_by_id(&self, model: &str) -> Vec<ModelEntry> {
        self.models
            .iter()
            .filter(|m| m.id == model)
            .cloned()
            .collect()
    }
}

/// Owns the session map, its persistence, and patch application
pub struct SessionManager {
    store: Box<dyn SessionStore>,
    catalog: Box<dyn ModelCatalog>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

/// Validated model half of a patch
enum ModelChange {
    Untouched,
    Clear,
    Select(ModelEntry),
}

impl SessionManager {
    /// Create a manager, loading existing entries from the store
    pub async fn new(store: Box<dyn SessionStore>, catalog: Box<dyn ModelCatalog>) -> Result<Self> {
        let sessions = store.load().await?;
        debug!(entries = sessions.len(), "session store loaded");
        Ok(SessionManager {
            store,
            catalog,
            sessions: Mutex::new(sessions),
        })
    }

    /// All entries, keyed by store key
    pub async fn list(&self) -> HashMap<String, SessionEntry> {
        self.sessions.lock().await.clone()
    }

    /// Resolve a single entry by exactly one selector
    pub async fn resolve(
        &self,
        params: &SessionsResolveParams,
    ) -> Result<(String, SessionEntry)> {
        let selectors = [
            params.key.is_some(),
            params.session_id.is_some(),
            params.label.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if selectors != 1 {
            return Err(Error::InvalidInput(
                "exactly one of key, sessionId, label must be set".to_string(),
            ));
        }

        let sessions = self.sessions.lock().await;
        let found = if let Some(key) = &params.key {
            sessions.get_key_value(key)
        } else if let Some(session_id) = &params.session_id {
            sessions
                .iter()
                .find(|(_, entry)| entry.session_id.as_ref() == Some(session_id))
        } else if let Some(label) = &params.label {
            sessions
                .iter()
                .find(|(_, entry)| entry.label.as_ref() == Some(label))
        } else {
            None
        };
        found
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .ok_or_else(|| Error::NotFound("no matching session".to_string()))
    }

    /// Apply a patch to one entry (created if missing). All-or-nothing: any
    /// invalid field rejects the whole patch with the entry untouched.
    pub async fn patch(&self, key: &str, patch: &SessionPatch) -> Result<SessionEntry> {
        // Validate everything before mutating anything.
        if let PatchField::Set(level) = &patch.elevated_level {
            if level != "on" && level != "off" {
                return Err(Error::InvalidInput(format!(
                    "elevatedLevel must be \"on\" or \"off\", got {level:?}"
                )));
            }
        }
        let model_change = match &patch.model {
            PatchField::Absent => ModelChange::Untouched,
            PatchField::Clear => ModelChange::Clear,
            PatchField::Set(selection) => ModelChange::Select(self.resolve_model(selection)?),
        };

        let mut sessions = self.sessions.lock().await;
        let entry = sessions.entry(key.to_string()).or_default();

        match &patch.elevated_level {
            PatchField::Absent => {}
            PatchField::Clear => entry.elevated_level = None,
            PatchField::Set(level) => entry.elevated_level = Some(level.clone()),
        }

        match model_change {
            ModelChange::Untouched => {}
            ModelChange::Clear => {
                entry.provider_override = None;
                entry.model_override = None;
                clear_auth_profile_override(entry);
            }
            ModelChange::Select(model) => {
                let changed = entry.provider_override.as_deref() != Some(model.provider.as_str())
                    || entry.model_override.as_deref() != Some(model.id.as_str());
                entry.provider_override = Some(model.provider);
                entry.model_override = Some(model.id);
                // The auth profile was negotiated for the previous model.
                if changed {
                    clear_auth_profile_override(entry);
                }
            }
        }

        match &patch.label {
            PatchField::Absent => {}
            PatchField::Clear => entry.label = None,
            PatchField::Set(label) => entry.label = Some(label.clone()),
        }

        entry.updated_at = Some(Utc::now());
        let updated = entry.clone();

        self.store.save(&sessions).await?;
        info!(key = %key, "session patched");
        Ok(updated)
    }

    /// Resolve a model selection: a "provider/model" slug, or a bare model
    /// id that is unambiguous in the catalog.
    fn resolve_model(&self, selection: &str) -> Result<ModelEntry> {
        if let Some((provider, id)) = selection.split_once('/') {
            return self
                .catalog
                .find(provider, id)
                .ok_or_else(|| Error::InvalidInput(format!("unknown model: {selection}")));
        }
        let mut matches = self.catalog.find_by_id(selection);
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(Error::InvalidInput(format!("unknown model: {selection}"))),
            _ => Err(Error::InvalidInput(format!(
                "ambiguous model id: {selection}"
            ))),
        }
    }

    /// Insert or replace an entry wholesale (used by tests and import paths)
    pub async fn put(&self, key: &str, entry: SessionEntry) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(key.to_string(), entry);
        self.store.save(&sessions).await
    }
}

fn clear_auth_profile_override(entry: &mut SessionEntry) {
    entry.auth_profile_override = None;
    entry.auth_profile_override_source = None;
    entry.auth_profile_override_compaction_count = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn catalog() -> Box<dyn ModelCatalog> {
        Box::new(StaticModelCatalog::new(vec![
            ModelEntry {
                provider: "anthropic".to_string(),
                id: "claude-opus-4-5".to_string(),
            },
            ModelEntry {
                provider: "openai".to_string(),
                id: "gpt-5.2".to_string(),
            },
        ]))
    }

    async fn manager() -> SessionManager {
        SessionManager::new(Box::new(MemorySessionStore::default()), catalog())
            .await
            .unwrap()
    }

    fn patch(raw: serde_json::Value) -> SessionPatch {
        serde_json::from_value(raw).unwrap()
    }

    #[tokio::test]
    async fn test_elevated_level_tri_state() {
        let sessions = manager().await;

        let entry = sessions
            .patch("agent:main", &patch(serde_json::json!({"elevatedLevel": "on"})))
            .await
            .unwrap();
        assert_eq!(entry.elevated_level.as_deref(), Some("on"));

        // Absent key leaves the field alone.
        let entry = sessions
            .patch("agent:main", &patch(serde_json::json!({"label": "x"})))
            .await
            .unwrap();
        assert_eq!(entry.elevated_level.as_deref(), Some("on"));

        // Explicit null clears.
        let entry = sessions
            .patch("agent:main", &patch(serde_json::json!({"elevatedLevel": null})))
            .await
            .unwrap();
        assert_eq!(entry.elevated_level, None);
    }

    #[tokio::test]
    async fn test_elevated_level_off_persists_as_off() {
        let sessions = manager().await;
        sessions
            .patch("agent:main", &patch(serde_json::json!({"elevatedLevel": "off"})))
            .await
            .unwrap();

        // "off" is a stored value, distinct from the field being unset.
        let listed = sessions.list().await;
        let entry = listed.get("agent:main").unwrap();
        assert_eq!(entry.elevated_level.as_deref(), Some("off"));
    }

    #[tokio::test]
    async fn test_invalid_elevated_level_rejects_whole_patch() {
        let sessions = manager().await;
        let err = sessions
            .patch(
                "agent:main",
                &patch(serde_json::json!({"elevatedLevel": "sudo", "label": "x"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(err.to_string().contains("elevatedLevel"));

        // Nothing was applied, not even the valid label.
        assert!(sessions.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_model_slug_and_bare_id() {
        let sessions = manager().await;

        let entry = sessions
            .patch(
                "agent:main",
                &patch(serde_json::json!({"model": "anthropic/claude-opus-4-5"})),
            )
            .await
            .unwrap();
        assert_eq!(entry.provider_override.as_deref(), Some("anthropic"));
        assert_eq!(entry.model_override.as_deref(), Some("claude-opus-4-5"));

        // Bare id resolves through the catalog.
        let entry = sessions
            .patch("agent:main", &patch(serde_json::json!({"model": "gpt-5.2"})))
            .await
            .unwrap();
        assert_eq!(entry.provider_override.as_deref(), Some("openai"));

        let err = sessions
            .patch("agent:main", &patch(serde_json::json!({"model": "gpt-1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_model_change_clears_auth_profile_override() {
        let sessions = manager().await;
        sessions
            .put(
                "agent:main",
                SessionEntry {
                    provider_override: Some("anthropic".to_string()),
                    model_override: Some("claude-opus-4-5".to_string()),
                    auth_profile_override: Some("work".to_string()),
                    auth_profile_override_source: Some("user".to_string()),
                    auth_profile_override_compaction_count: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let entry = sessions
            .patch(
                "agent:main",
                &patch(serde_json::json!({"model": "openai/gpt-5.2"})),
            )
            .await
            .unwrap();
        assert_eq!(entry.model_override.as_deref(), Some("gpt-5.2"));
        assert_eq!(entry.auth_profile_override, None);
        assert_eq!(entry.auth_profile_override_source, None);
        assert_eq!(entry.auth_profile_override_compaction_count, None);
    }

    #[tokio::test]
    async fn test_same_model_keeps_auth_profile_override() {
        let sessions = manager().await;
        sessions
            .put(
                "agent:main",
                SessionEntry {
                    provider_override: Some("anthropic".to_string()),
                    model_override: Some("claude-opus-4-5".to_string()),
                    auth_profile_override: Some("work".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let entry = sessions
            .patch(
                "agent:main",
                &patch(serde_json::json!({"model": "anthropic/claude-opus-4-5"})),
            )
            .await
            .unwrap();
        assert_eq!(entry.auth_profile_override.as_deref(), Some("work"));
    }

    #[tokio::test]
    async fn test_resolve_requires_exactly_one_selector() {
        let sessions = manager().await;
        sessions
            .put(
                "agent:main",
                SessionEntry {
                    session_id: Some("s-1".to_string()),
                    label: Some("primary".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let (key, _) = sessions
            .resolve(&SessionsResolveParams {
                session_id: Some("s-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(key, "agent:main");

        let (key, _) = sessions
            .resolve(&SessionsResolveParams {
                label: Some("primary".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(key, "agent:main");

        assert!(matches!(
            sessions.resolve(&SessionsResolveParams::default()).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            sessions
                .resolve(&SessionsResolveParams {
                    key: Some("agent:main".to_string()),
                    label: Some("primary".to_string()),
                    ..Default::default()
                })
                .await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            sessions
                .resolve(&SessionsResolveParams {
                    key: Some("missing".to_string()),
                    ..Default::default()
                })
                .await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        {
            let sessions =
                SessionManager::new(Box::new(FileSessionStore::new(path.clone())), catalog())
                    .await
                    .unwrap();
            sessions
                .patch(
                    "agent:main",
                    &patch(serde_json::json!({"label": "primary", "elevatedLevel": "on"})),
                )
                .await
                .unwrap();
        }

        let reloaded = SessionManager::new(Box::new(FileSessionStore::new(path)), catalog())
            .await
            .unwrap();
        let entries = reloaded.list().await;
        assert_eq!(entries["agent:main"].label.as_deref(), Some("primary"));
        assert_eq!(entries["agent:main"].elevated_level.as_deref(), Some("on"));
    }
}
