//! Result ingestion: decode a provider result blob and write the vectors.
//!
//! The blob is JSONL. Each line is parsed on its own; a bad line is logged and
//! dropped and never aborts the rest of the blob.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

use curator_core::{ArticleId, CoreError, OwnerId};

use crate::vector_store::{VectorRecord, VectorStore, VectorStoreError};

/// Correlation id carried through the provider in `custom_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationId {
    pub article_id: ArticleId,
    /// Owning user, when the chunk had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<OwnerId>,
}

impl CorrelationId {
    pub fn new(article_id: ArticleId, user_id: Option<OwnerId>) -> Self {
        Self {
            article_id,
            user_id,
        }
    }

    pub fn encode(&self) -> String {
        let mut value = serde_json::json!({ "articleId": self.article_id.as_str() });
        if let Some(user) = &self.user_id {
            value["userId"] = JsonValue::from(user.as_str());
        }
        value.to_string()
    }

    /// Decode a `custom_id`. A bare string is taken as the article id.
    pub fn decode(raw: &str) -> Result<Self, CoreError> {
        if let Ok(id) = serde_json::from_str::<Self>(raw) {
            return Ok(id);
        }
        Ok(Self::new(ArticleId::new(raw)?, None))
    }
}

/// A result line that was dropped, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedLine {
    /// 1-based line number in the blob.
    pub line: usize,
    pub custom_id: Option<String>,
    pub reason: String,
}

/// Outcome of parsing a whole result blob.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResults {
    pub records: Vec<VectorRecord>,
    /// First owning user found in the correlation ids.
    pub owner_id: Option<OwnerId>,
    pub dropped: Vec<DroppedLine>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IngestError {
    /// The update touched no row for these ids.
    #[error("no rows updated for {} article(s): {}", .ids.len(), join_ids(.ids))]
    MissingRows { ids: Vec<ArticleId> },

    #[error(transparent)]
    Store(#[from] VectorStoreError),
}

impl From<IngestError> for CoreError {
    fn from(value: IngestError) -> Self {
        match value {
            IngestError::MissingRows { .. } => CoreError::partial(value.to_string()),
            IngestError::Store(e) => CoreError::storage(e.to_string()),
        }
    }
}

fn join_ids(ids: &[ArticleId]) -> String {
    ids.iter().map(ArticleId::as_str).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Deserialize)]
struct ResultLine {
    #[serde(default)]
    custom_id: Option<String>,
    #[serde(default)]
    response: Option<ResultResponse>,
    #[serde(default)]
    error: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct ResultResponse {
    status_code: u16,
    #[serde(default)]
    body: Option<ResultBody>,
}

#[derive(Debug, Deserialize)]
struct ResultBody {
    #[serde(default)]
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f64>,
}

/// Parse every line of `blob`, appending `placeholder` to each vector.
pub fn parse_result_blob(blob: &str, placeholder: Option<f64>) -> ParsedResults {
    let mut parsed = ParsedResults::default();

    for (idx, line) in blob.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_line(line) {
            Ok((correlation, mut vector)) => {
                if let Some(extra) = placeholder {
                    vector.push(extra);
                }
                if parsed.owner_id.is_none() {
                    parsed.owner_id = correlation.user_id;
                }
                parsed.records.push(VectorRecord {
                    id: correlation.article_id,
                    vector,
                });
            }
            Err((custom_id, reason)) => {
                warn!(
                    line = idx + 1,
                    custom_id = custom_id.as_deref().unwrap_or("-"),
                    reason = %reason,
                    "dropping result line"
                );
                parsed.dropped.push(DroppedLine {
                    line: idx + 1,
                    custom_id,
                    reason,
                });
            }
        }
    }

    parsed
}

fn parse_line(line: &str) -> Result<(CorrelationId, Vec<f64>), (Option<String>, String)> {
    let decoded: ResultLine =
        serde_json::from_str(line).map_err(|e| (None, format!("malformed line: {e}")))?;
    let custom_id = decoded.custom_id;
    let fail = |reason: String| (custom_id.clone(), reason);

    if let Some(error) = decoded.error.filter(|e| !e.is_null()) {
        return Err(fail(format!("provider error: {error}")));
    }
    let response = decoded
        .response
        .ok_or_else(|| fail("missing response".to_string()))?;
    if !(200..300).contains(&response.status_code) {
        return Err(fail(format!("HTTP {}", response.status_code)));
    }
    let vector = response
        .body
        .and_then(|body| body.data.into_iter().next())
        .map(|datum| datum.embedding)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| fail("no embedding in response".to_string()))?;

    let raw = custom_id
        .as_deref()
        .ok_or_else(|| fail("missing custom_id".to_string()))?;
    let correlation = CorrelationId::decode(raw).map_err(|e| fail(e.to_string()))?;

    Ok((correlation, vector))
}

/// Write parsed records through the vector store.
///
/// Fails with [`IngestError::MissingRows`] when any id matched no row.
pub async fn apply(store: &dyn VectorStore, records: &[VectorRecord]) -> Result<(), IngestError> {
    if records.is_empty() {
        return Ok(());
    }

    let outcomes = store.batch_update_vectors(records).await?;
    let missing: Vec<ArticleId> = outcomes
        .into_iter()
        .filter(|o| o.rows_affected == 0)
        .map(|o| o.id)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(IngestError::MissingRows { ids: missing })
    }
}
