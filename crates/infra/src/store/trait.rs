use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::error;

use curator_core::CoreError;

/// Durable store operation error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backing storage failed (connection, query, lock).
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored value could not be (de)serialized into the expected shape.
    #[error("store serialization error for key {key}: {message}")]
    Serialization { key: String, message: String },
}

impl StoreError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn serialization(key: &str, err: impl core::fmt::Display) -> Self {
        Self::Serialization {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(value: StoreError) -> Self {
        CoreError::storage(value.to_string())
    }
}

/// Key-value persistence local to one orchestrator instance.
///
/// ## Semantics
///
/// - `list` returns entries whose key starts with `prefix`, ordered by key;
///   `first` and `count` follow the same prefix rule.
/// - There is exactly one alarm slot: `set_alarm` replaces any previous value.
/// - Values are JSON documents; typed access goes through [`get_json`] and
///   [`put_json`].
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, StoreError>;

    async fn put(&self, key: &str, value: JsonValue) -> Result<(), StoreError>;

    /// Delete a key. Returns whether a value was present.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn list(&self, prefix: &str) -> Result<Vec<(String, JsonValue)>, StoreError>;

    /// The entry with the smallest key under `prefix`.
    async fn first(&self, prefix: &str) -> Result<Option<(String, JsonValue)>, StoreError>;

    /// Number of keys under `prefix`, without reading their values.
    async fn count(&self, prefix: &str) -> Result<usize, StoreError>;

    async fn get_alarm(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn set_alarm(&self, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn delete_alarm(&self) -> Result<(), StoreError>;
}

/// Read and decode a typed value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn DurableStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| StoreError::serialization(key, e)),
        None => Ok(None),
    }
}

/// Encode and write a typed value.
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn DurableStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(value).map_err(|e| StoreError::serialization(key, e))?;
    store.put(key, value).await
}

/// List and decode every value under `prefix`, in key order.
///
/// An entry that no longer decodes is logged and deleted instead of failing
/// the whole listing.
pub async fn list_json_discarding<T: DeserializeOwned>(
    store: &dyn DurableStore,
    prefix: &str,
) -> Result<Vec<(String, T)>, StoreError> {
    let entries = store.list(prefix).await?;
    let mut out = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        match serde_json::from_value(value) {
            Ok(decoded) => out.push((key, decoded)),
            Err(e) => discard(store, &key, &e).await?,
        }
    }
    Ok(out)
}

/// Delete an entry whose value cannot be decoded.
pub async fn discard(
    store: &dyn DurableStore,
    key: &str,
    reason: &(dyn core::fmt::Display + Sync),
) -> Result<(), StoreError> {
    error!(key, error = %reason, "undecodable entry; discarding");
    store.delete(key).await?;
    Ok(())
}
