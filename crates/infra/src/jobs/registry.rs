//! Job registry: one durable entry per outstanding provider job.

use std::sync::Arc;

use curator_core::JobHandle;

use crate::store::{DurableStore, StoreError, get_json, list_json_discarding, put_json};

use super::keys;
use super::types::BatchJob;

pub struct JobRegistry {
    store: Arc<dyn DurableStore>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, handle: &JobHandle) -> Result<Option<BatchJob>, StoreError> {
        get_json(self.store.as_ref(), &keys::job(handle)).await
    }

    pub async fn put(&self, job: &BatchJob) -> Result<(), StoreError> {
        put_json(self.store.as_ref(), &keys::job(&job.handle), job).await
    }

    /// Insert unless the handle is already tracked. Returns whether it was inserted.
    pub async fn insert_if_absent(&self, job: &BatchJob) -> Result<bool, StoreError> {
        if self.store.get(&keys::job(&job.handle)).await?.is_some() {
            return Ok(false);
        }
        self.put(job).await?;
        Ok(true)
    }

    pub async fn remove(&self, handle: &JobHandle) -> Result<bool, StoreError> {
        self.store.delete(&keys::job(handle)).await
    }

    /// Every tracked job, by handle. Entries that no longer decode are
    /// logged and deleted.
    pub async fn list(&self) -> Result<Vec<BatchJob>, StoreError> {
        Ok(list_json_discarding(self.store.as_ref(), keys::JOB_PREFIX)
            .await?
            .into_iter()
            .map(|(_, job)| job)
            .collect())
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        self.store.count(keys::JOB_PREFIX).await
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }
}
