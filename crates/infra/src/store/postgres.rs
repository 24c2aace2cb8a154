//! Postgres-backed durable store.
//!
//! All rows are partitioned by `scope`, the name of the orchestrator instance,
//! so several instances can share one database without seeing each other's
//! queue, registry or alarm.
//!
//! ## Schema
//!
//! ```sql
//! orchestrator_kv(scope TEXT, key TEXT, value JSONB, updated_at TIMESTAMPTZ, PRIMARY KEY (scope, key))
//! orchestrator_alarm(scope TEXT PRIMARY KEY, fire_at TIMESTAMPTZ)
//! ```
//!
//! Both tables are created by [`PostgresDurableStore::ensure_schema`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::instrument;

use super::r#trait::{DurableStore, StoreError};

#[derive(Debug, Clone)]
pub struct PostgresDurableStore {
    pool: Arc<PgPool>,
    scope: String,
}

impl PostgresDurableStore {
    /// Create a store for one orchestrator instance.
    pub fn new(pool: PgPool, scope: impl Into<String>) -> Self {
        Self {
            pool: Arc::new(pool),
            scope: scope.into(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Create the backing tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator_kv (
                scope       TEXT        NOT NULL,
                key         TEXT        NOT NULL,
                value       JSONB       NOT NULL,
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (scope, key)
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator_alarm (
                scope    TEXT        PRIMARY KEY,
                fire_at  TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        Ok(())
    }
}

#[async_trait]
impl DurableStore for PostgresDurableStore {
    #[instrument(skip(self), fields(scope = %self.scope), err)]
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, StoreError> {
        let row = sqlx::query("SELECT value FROM orchestrator_kv WHERE scope = $1 AND key = $2")
            .bind(&self.scope)
            .bind(key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| r.try_get::<JsonValue, _>("value"))
            .transpose()
            .map_err(|e| map_sqlx_error("get", e))
    }

    #[instrument(skip(self, value), fields(scope = %self.scope), err)]
    async fn put(&self, key: &str, value: JsonValue) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO orchestrator_kv (scope, key, value, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (scope, key)
            DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&self.scope)
        .bind(key)
        .bind(value)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("put", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(scope = %self.scope), err)]
    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM orchestrator_kv WHERE scope = $1 AND key = $2")
            .bind(&self.scope)
            .bind(key)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(scope = %self.scope), err)]
    async fn list(&self, prefix: &str) -> Result<Vec<(String, JsonValue)>, StoreError> {
        // `left()` instead of LIKE so '%' and '_' in a prefix stay literal.
        let rows = sqlx::query(
            r#"
            SELECT key, value
            FROM orchestrator_kv
            WHERE scope = $1 AND left(key, char_length($2)) = $2
            ORDER BY key COLLATE "C" ASC
            "#,
        )
        .bind(&self.scope)
        .bind(prefix)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("key").map_err(|e| map_sqlx_error("list", e))?;
            let value: JsonValue = row.try_get("value").map_err(|e| map_sqlx_error("list", e))?;
            out.push((key, value));
        }
        Ok(out)
    }

    #[instrument(skip(self), fields(scope = %self.scope), err)]
    async fn first(&self, prefix: &str) -> Result<Option<(String, JsonValue)>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT key, value
            FROM orchestrator_kv
            WHERE scope = $1 AND left(key, char_length($2)) = $2
            ORDER BY key COLLATE "C" ASC
            LIMIT 1
            "#,
        )
        .bind(&self.scope)
        .bind(prefix)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("first", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let key: String = row.try_get("key").map_err(|e| map_sqlx_error("first", e))?;
        let value: JsonValue = row.try_get("value").map_err(|e| map_sqlx_error("first", e))?;
        Ok(Some((key, value)))
    }

    #[instrument(skip(self), fields(scope = %self.scope), err)]
    async fn count(&self, prefix: &str) -> Result<usize, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n
            FROM orchestrator_kv
            WHERE scope = $1 AND left(key, char_length($2)) = $2
            "#,
        )
        .bind(&self.scope)
        .bind(prefix)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count", e))?;

        let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("count", e))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    async fn get_alarm(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query("SELECT fire_at FROM orchestrator_alarm WHERE scope = $1")
            .bind(&self.scope)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_alarm", e))?;

        row.map(|r| r.try_get::<DateTime<Utc>, _>("fire_at"))
            .transpose()
            .map_err(|e| map_sqlx_error("get_alarm", e))
    }

    async fn set_alarm(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO orchestrator_alarm (scope, fire_at)
            VALUES ($1, $2)
            ON CONFLICT (scope) DO UPDATE SET fire_at = EXCLUDED.fire_at
            "#,
        )
        .bind(&self.scope)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_alarm", e))?;
        Ok(())
    }

    async fn delete_alarm(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM orchestrator_alarm WHERE scope = $1")
            .bind(&self.scope)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_alarm", e))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::backend(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::backend(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::ColumnDecode { index, source } => StoreError::backend(format!(
            "failed to decode column {index} in {operation}: {source}"
        )),
        other => StoreError::backend(format!("{operation} failed: {other}")),
    }
}
