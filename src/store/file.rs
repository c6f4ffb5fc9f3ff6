//! JSON file state store.
//!
//! The whole table is rewritten on every change through a temporary file
//! and a rename, so a crash leaves either the old or the new table.

use crate::core::{Error, Result};
use crate::store::{PluginState, PluginStateStore, PluginStatusRecord};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// State store backed by a single JSON file.
pub struct JsonFileStateStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, PluginStatusRecord>>,
}

impl JsonFileStateStore {
    /// Open a store, reading existing records if the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => {
                let list: Vec<PluginStatusRecord> = serde_json::from_str(&text)
                    .map_err(|e| Error::Store(format!("{}: {}", path.display(), e)))?;
                list.into_iter().map(|r| (r.plugin_id.clone(), r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::Store(format!("{}: {}", path.display(), e))),
        };
        debug!(path = %path.display(), records = records.len(), "opened plugin state file");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &BTreeMap<String, PluginStatusRecord>) -> Result<()> {
        let list: Vec<&PluginStatusRecord> = records.values().collect();
        let text = serde_json::to_string_pretty(&list)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn transition(&self, plugin_id: &str, state: PluginState, error: Option<String>) -> Result<()> {
        let mut records = self.records.lock().await;
        match records.get_mut(plugin_id) {
            Some(record) => record.apply(state, error),
            None => {
                let mut record = PluginStatusRecord::new(plugin_id, state);
                record.apply(state, error);
                records.insert(plugin_id.to_string(), record);
            }
        }
        self.persist(&records).await
    }
}

#[async_trait]
impl PluginStateStore for JsonFileStateStore {
    async fn get_all(&self) -> Result<Vec<PluginStatusRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn get(&self, plugin_id: &str) -> Result<Option<PluginStatusRecord>> {
        Ok(self.records.lock().await.get(plugin_id).cloned())
    }

    async fn set_enabled(&self, plugin_id: &str) -> Result<()> {
        self.transition(plugin_id, PluginState::Enabled, None).await
    }

    async fn set_disabled(&self, plugin_id: &str) -> Result<()> {
        self.transition(plugin_id, PluginState::Disabled, None).await
    }

    async fn set_error(&self, plugin_id: &str, message: &str) -> Result<()> {
        self.transition(plugin_id, PluginState::Error, Some(message.to_string()))
            .await
    }

    async fn delete(&self, plugin_id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        if records.remove(plugin_id).is_some() {
            self.persist(&records).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("plugins.json");

        let store = JsonFileStateStore::open(&path).await.unwrap();
        store.set_enabled("notes").await.unwrap();
        store.set_error("broken", "bad entry").await.unwrap();
        drop(store);

        let reopened = JsonFileStateStore::open(&path).await.unwrap();
        assert_eq!(reopened.state_of("notes").await.unwrap(), PluginState::Enabled);
        let broken = reopened.get("broken").await.unwrap().unwrap();
        assert_eq!(broken.error.as_deref(), Some("bad entry"));

        reopened.delete("notes").await.unwrap();
        let again = JsonFileStateStore::open(&path).await.unwrap();
        assert_eq!(again.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();
        assert!(matches!(
            JsonFileStateStore::open(&path).await,
            Err(Error::Store(_))
        ));
    }
}
