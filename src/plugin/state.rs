//! Plugin lifecycle state.

use crate::core::Timestamp;
use crate::manifest::Manifest;
use crate::sandbox::PluginComponent;
use crate::store::PluginState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// In-memory lifecycle state of a plugin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Not loaded
    NotLoaded,
    /// Load in progress
    Loading,
    /// Loaded and active
    Loaded,
    /// Unload in progress
    Unloading,
    /// Load failed or an unrecovered fault occurred
    Error,
}

impl Default for LifecycleState {
    fn default() -> Self {
        LifecycleState::NotLoaded
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::NotLoaded => write!(f, "not_loaded"),
            LifecycleState::Loading => write!(f, "loading"),
            LifecycleState::Loaded => write!(f, "loaded"),
            LifecycleState::Unloading => write!(f, "unloading"),
            LifecycleState::Error => write!(f, "error"),
        }
    }
}

/// Lifecycle entry kept by the manager.
#[derive(Clone, Debug, Default)]
pub(crate) struct RuntimeStatus {
    pub state: LifecycleState,
    pub error: Option<String>,
}

/// A plugin that finished loading.
pub struct LoadedPlugin {
    /// Manifest it was loaded from
    pub manifest: Manifest,
    /// Sandboxed component
    pub component: Arc<PluginComponent>,
    /// Load completion time
    pub loaded_at: Timestamp,
}

impl LoadedPlugin {
    /// Plugin id.
    pub fn id(&self) -> &str {
        &self.manifest.id
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("id", &self.manifest.id)
            .field("version", &self.manifest.version)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

/// Status of one plugin as shown to the host UI.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginStatusView {
    /// Plugin id
    pub plugin_id: String,
    /// Display name
    pub name: String,
    /// Version
    pub version: String,
    /// Description
    pub description: String,
    /// Persisted state
    pub state: PluginState,
    /// In-memory lifecycle state
    pub lifecycle: LifecycleState,
    /// Last error, from memory or the store
    pub error: Option<String>,
    /// Fault currently shown by the fault boundary
    pub fault: Option<String>,
    /// When the plugin finished loading
    pub loaded_at: Option<Timestamp>,
    /// Last persisted change
    pub updated_at: Option<Timestamp>,
}

impl PluginStatusView {
    /// Whether the host should show the plugin as failed.
    pub fn is_error(&self) -> bool {
        self.state == PluginState::Error || self.lifecycle == LifecycleState::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_default_and_display() {
        assert_eq!(LifecycleState::default(), LifecycleState::NotLoaded);
        assert_eq!(LifecycleState::Unloading.to_string(), "unloading");
        assert_eq!(serde_json::to_string(&LifecycleState::NotLoaded).unwrap(), "\"not_loaded\"");
    }
}
