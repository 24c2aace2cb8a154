//! Domain store boundary for article embeddings.
//!
//! The orchestrator only ever writes vectors through
//! [`VectorStore::batch_update_vectors`]; everything else about article rows
//! belongs to the surrounding application.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use curator_core::ArticleId;

pub mod postgres;

pub use postgres::PostgresVectorStore;

/// One (correlation id, vector) pair produced by result ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: ArticleId,
    pub vector: Vec<f64>,
}

/// Per-record outcome of a batch update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub id: ArticleId,
    pub rows_affected: u64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VectorStoreError {
    #[error("vector store backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Write every record, reporting how many rows each id touched.
    ///
    /// Outcomes are returned in input order.
    async fn batch_update_vectors(
        &self,
        records: &[VectorRecord],
    ) -> Result<Vec<UpdateOutcome>, VectorStoreError>;
}

/// In-memory vector store for tests/dev.
///
/// Only ids registered with [`InMemoryVectorStore::insert_article`] count as
/// existing rows; updates to unknown ids report zero affected rows.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    rows: RwLock<HashMap<ArticleId, Option<Vec<f64>>>>,
    updates: RwLock<Vec<ArticleId>>,
    accept_unknown: bool,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that treats every id as an existing row.
    pub fn permissive() -> Self {
        Self {
            accept_unknown: true,
            ..Self::default()
        }
    }

    pub async fn insert_article(&self, id: ArticleId) {
        self.rows.write().await.entry(id).or_insert(None);
    }

    pub async fn vector(&self, id: &ArticleId) -> Option<Vec<f64>> {
        self.rows.read().await.get(id).cloned().flatten()
    }

    /// Every id an update was issued for, in call order.
    pub async fn updates(&self) -> Vec<ArticleId> {
        self.updates.read().await.clone()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn batch_update_vectors(
        &self,
        records: &[VectorRecord],
    ) -> Result<Vec<UpdateOutcome>, VectorStoreError> {
        let mut rows = self.rows.write().await;
        let mut updates = self.updates.write().await;
        let mut outcomes = Vec::with_capacity(records.len());

        for record in records {
            updates.push(record.id.clone());
            let rows_affected = match rows.get_mut(&record.id) {
                Some(slot) => {
                    *slot = Some(record.vector.clone());
                    1
                }
                None if self.accept_unknown => {
                    rows.insert(record.id.clone(), Some(record.vector.clone()));
                    1
                }
                None => 0,
            };
            outcomes.push(UpdateOutcome {
                id: record.id.clone(),
                rows_affected,
            });
        }

        Ok(outcomes)
    }
}
