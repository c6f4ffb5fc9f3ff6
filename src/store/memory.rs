//! In-memory state store.

use crate::core::Result;
use crate::store::{PluginState, PluginStateStore, PluginStatusRecord};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// State store held in memory. Records are returned in id order.
#[derive(Default)]
pub struct InMemoryStateStore {
    records: RwLock<BTreeMap<String, PluginStatusRecord>>,
}

impl InMemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with records.
    pub fn with_records(records: impl IntoIterator<Item = PluginStatusRecord>) -> Self {
        Self {
            records: RwLock::new(
                records
                    .into_iter()
                    .map(|r| (r.plugin_id.clone(), r))
                    .collect(),
            ),
        }
    }

    async fn transition(&self, plugin_id: &str, state: PluginState, error: Option<String>) {
        let mut records = self.records.write().await;
        match records.get_mut(plugin_id) {
            Some(record) => record.apply(state, error),
            None => {
                let mut record = PluginStatusRecord::new(plugin_id, state);
                record.apply(state, error);
                records.insert(plugin_id.to_string(), record);
            }
        }
    }
}

#[async_trait]
impl PluginStateStore for InMemoryStateStore {
    async fn get_all(&self) -> Result<Vec<PluginStatusRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn get(&self, plugin_id: &str) -> Result<Option<PluginStatusRecord>> {
        Ok(self.records.read().await.get(plugin_id).cloned())
    }

    async fn set_enabled(&self, plugin_id: &str) -> Result<()> {
        self.transition(plugin_id, PluginState::Enabled, None).await;
        Ok(())
    }

    async fn set_disabled(&self, plugin_id: &str) -> Result<()> {
        self.transition(plugin_id, PluginState::Disabled, None).await;
        Ok(())
    }

    async fn set_error(&self, plugin_id: &str, message: &str) -> Result<()> {
        self.transition(plugin_id, PluginState::Error, Some(message.to_string()))
            .await;
        Ok(())
    }

    async fn delete(&self, plugin_id: &str) -> Result<()> {
        self.records.write().await.remove(plugin_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let store = InMemoryStateStore::new();
        assert_eq!(store.state_of("notes").await.unwrap(), PluginState::NotInstalled);

        store.set_disabled("notes").await.unwrap();
        assert_eq!(store.state_of("notes").await.unwrap(), PluginState::Disabled);

        store.set_enabled("notes").await.unwrap();
        let record = store.get("notes").await.unwrap().unwrap();
        assert!(record.enabled);

        store.set_error("notes", "load failed").await.unwrap();
        let record = store.get("notes").await.unwrap().unwrap();
        assert_eq!(record.state, PluginState::Error);
        assert_eq!(record.error.as_deref(), Some("load failed"));
        assert!(record.updated_at >= record.created_at);

        store.delete("notes").await.unwrap();
        assert!(store.get("notes").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_all_sorted() {
        let store = InMemoryStateStore::with_records([
            PluginStatusRecord::new("zeta", PluginState::Enabled),
            PluginStatusRecord::new("alpha", PluginState::Disabled),
        ]);
        let ids: Vec<String> = store
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.plugin_id)
            .collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }
}
