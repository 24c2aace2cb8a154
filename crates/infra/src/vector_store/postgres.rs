//! Postgres-backed vector store.
//!
//! Embeddings live in `articles.embedding` (`DOUBLE PRECISION[]`), keyed by
//! `articles.article_id`. A batch is written inside one transaction so a
//! connection failure never leaves half a batch applied.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use super::{UpdateOutcome, VectorRecord, VectorStore, VectorStoreError};

#[derive(Debug, Clone)]
pub struct PostgresVectorStore {
    pool: Arc<PgPool>,
}

impl PostgresVectorStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl VectorStore for PostgresVectorStore {
    #[instrument(skip(self, records), fields(records = records.len()), err)]
    async fn batch_update_vectors(
        &self,
        records: &[VectorRecord],
    ) -> Result<Vec<UpdateOutcome>, VectorStoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let mut outcomes = Vec::with_capacity(records.len());

        for record in records {
            let result = sqlx::query(
                "UPDATE articles SET embedding = $1, embedded_at = now() WHERE article_id = $2",
            )
            .bind(&record.vector)
            .bind(record.id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

            outcomes.push(UpdateOutcome {
                id: record.id.clone(),
                rows_affected: result.rows_affected(),
            });
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(outcomes)
    }
}

fn map_sqlx_error(err: sqlx::Error) -> VectorStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            VectorStoreError::Backend(format!("database error: {}", db_err.message()))
        }
        other => VectorStoreError::Backend(other.to_string()),
    }
}
