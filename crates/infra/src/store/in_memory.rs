use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use super::r#trait::{DurableStore, StoreError};

/// In-memory durable store.
///
/// Intended for tests/dev. State is lost on process exit; share one instance
/// through an `Arc` to simulate an orchestrator restart over the same storage.
#[derive(Debug, Default)]
pub struct InMemoryDurableStore {
    entries: RwLock<BTreeMap<String, JsonValue>>,
    alarm: RwLock<Option<DateTime<Utc>>>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys (alarm excluded).
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: JsonValue) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, JsonValue)>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn first(&self, prefix: &str) -> Result<Option<(String, JsonValue)>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .next()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    async fn count(&self, prefix: &str) -> Result<usize, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .count())
    }

    async fn get_alarm(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(*self.alarm.read().await)
    }

    async fn set_alarm(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        *self.alarm.write().await = Some(at);
        Ok(())
    }

    async fn delete_alarm(&self) -> Result<(), StoreError> {
        *self.alarm.write().await = None;
        Ok(())
    }
}
