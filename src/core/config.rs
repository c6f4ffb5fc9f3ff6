//! Runtime configuration.
//!
//! Aggregates the per-component configuration sections. Every section has
//! defaults, so a config file only needs to name what it changes.

use crate::core::{Error, Result};
use crate::messaging::EventBusConfig;
use crate::monitoring::LoggingConfig;
use crate::plugin::ManagerConfig;
use crate::reload::HotReloadConfig;
use crate::sandbox::SandboxConfig;
use crate::validator::ValidatorConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level runtime configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Plugin manager settings
    pub manager: ManagerConfig,
    /// Manifest validation thresholds
    pub validator: ValidatorConfig,
    /// Sandbox settings
    pub sandbox: SandboxConfig,
    /// Event bus settings
    pub events: EventBusConfig,
    /// Hot reload settings
    pub hot_reload: HotReloadConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Parse a configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load a configuration file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
