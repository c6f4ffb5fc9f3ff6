//! Plugin State Store
//!
//! Durable per-plugin lifecycle state:
//! - `PluginStateStore` trait for pluggable persistence
//! - In-memory store for tests and embedded hosts
//! - JSON file store

pub mod file;
pub mod memory;

pub use file::JsonFileStateStore;
pub use memory::InMemoryStateStore;

use crate::core::{now, Result, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Persisted plugin state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// No record exists
    NotInstalled,
    /// Installed, not enabled
    Disabled,
    /// Installed and enabled
    Enabled,
    /// Last enable or load failed
    Error,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginState::NotInstalled => write!(f, "not_installed"),
            PluginState::Disabled => write!(f, "disabled"),
            PluginState::Enabled => write!(f, "enabled"),
            PluginState::Error => write!(f, "error"),
        }
    }
}

/// One persisted status record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginStatusRecord {
    /// Plugin id
    pub plugin_id: String,
    /// Current state
    pub state: PluginState,
    /// Whether the plugin should load on startup
    pub enabled: bool,
    /// Whether the plugin is installed
    pub installed: bool,
    /// Last error message, set only in the error state
    pub error: Option<String>,
    /// Creation time
    pub created_at: Timestamp,
    /// Last update time
    pub updated_at: Timestamp,
}

impl PluginStatusRecord {
    /// Create a fresh record in the given state.
    pub fn new(plugin_id: &str, state: PluginState) -> Self {
        let at = now();
        let mut record = Self {
            plugin_id: plugin_id.to_string(),
            state,
            enabled: false,
            installed: true,
            error: None,
            created_at: at,
            updated_at: at,
        };
        record.apply(state, None);
        record
    }

    /// Move to a new state, keeping the derived flags consistent.
    pub(crate) fn apply(&mut self, state: PluginState, error: Option<String>) {
        self.state = state;
        self.enabled = state == PluginState::Enabled;
        self.installed = state != PluginState::NotInstalled;
        self.error = if state == PluginState::Error { error } else { None };
        self.updated_at = now();
    }
}

/// Persistence for plugin state.
#[async_trait]
pub trait PluginStateStore: Send + Sync {
    /// All records.
    async fn get_all(&self) -> Result<Vec<PluginStatusRecord>>;

    /// One record.
    async fn get(&self, plugin_id: &str) -> Result<Option<PluginStatusRecord>>;

    /// Mark enabled, creating the record if needed.
    async fn set_enabled(&self, plugin_id: &str) -> Result<()>;

    /// Mark disabled, creating the record if needed.
    async fn set_disabled(&self, plugin_id: &str) -> Result<()>;

    /// Mark failed with a message, creating the record if needed.
    async fn set_error(&self, plugin_id: &str, message: &str) -> Result<()>;

    /// Remove a record.
    async fn delete(&self, plugin_id: &str) -> Result<()>;

    /// State of a plugin; a missing record is `NotInstalled`.
    async fn state_of(&self, plugin_id: &str) -> Result<PluginState> {
        Ok(self
            .get(plugin_id)
            .await?
            .map(|r| r.state)
            .unwrap_or(PluginState::NotInstalled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_flags_follow_state() {
        let mut record = PluginStatusRecord::new("notes", PluginState::Disabled);
        assert!(record.installed);
        assert!(!record.enabled);

        record.apply(PluginState::Error, Some("boom".to_string()));
        assert_eq!(record.error.as_deref(), Some("boom"));
        assert!(!record.enabled);

        record.apply(PluginState::Enabled, Some("ignored".to_string()));
        assert!(record.enabled);
        assert!(record.error.is_none());
        assert!(record.updated_at >= record.created_at);
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&PluginState::NotInstalled).unwrap();
        assert_eq!(json, "\"not_installed\"");
        assert_eq!(PluginState::Enabled.to_string(), "enabled");
    }
}
