//! Core orchestrator entities and the retry backoff policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use curator_core::{ArticleId, FileId, JobHandle, OwnerId};

use crate::vector_store::VectorRecord;

/// One article to embed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleInput {
    pub article_id: ArticleId,
    pub text: String,
}

/// A unit of submission work: one provider upload + one provider job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Position of this chunk in the caller's batch.
    pub index: u32,
    pub articles: Vec<ArticleInput>,
    /// Failed submission attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, alias = "userId")]
    pub owner_id: Option<OwnerId>,
}

/// Orchestrator-side view of a provider job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Accepted by the provider, not yet observed running
    Submitted,
    /// Observed in a non-terminal provider state
    Running,
    /// Provider finished; results are ready
    Completed,
    /// Provider failed or expired the job
    Failed,
    /// Provider cancelled (or is cancelling) the job
    Cancelled,
}

/// Tracking record for one externally running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    pub handle: JobHandle,
    /// Reference to the uploaded input.
    pub input_file_id: FileId,
    pub status: BatchStatus,
    /// Last raw status string reported by the provider.
    #[serde(default)]
    pub provider_status: Option<String>,
    /// Transient polling failures so far.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub owner_id: Option<OwnerId>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    pub fn new(handle: JobHandle, input_file_id: FileId, owner_id: Option<OwnerId>) -> Self {
        Self {
            handle,
            input_file_id,
            status: BatchStatus::Submitted,
            provider_status: None,
            retry_count: 0,
            owner_id,
            submitted_at: Utc::now(),
            last_polled_at: None,
        }
    }
}

/// Body delivered to the downstream consumer after a successful ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyPayload {
    pub records: Vec<VectorRecord>,
    pub owner_id: Option<OwnerId>,
}

/// A notification waiting in the ledger for another delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCallback {
    pub payload: NotifyPayload,
    /// Failed ledger attempts (immediate attempts are not counted).
    pub retry_count: u32,
    pub first_failed_at: DateTime<Utc>,
    /// Earliest time the next ledger attempt may run.
    pub next_attempt_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Exponential backoff with random jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0): up to this share of the delay is added at random
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// Backoff that never waits; used where the caller controls pacing.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (1-indexed): `base * 2^(attempt-1)`,
    /// capped at `max_delay`, plus jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = 2_u32.saturating_pow(attempt.saturating_sub(1).min(31));
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);

        let jitter_range = delay.as_secs_f64() * self.jitter.clamp(0.0, 1.0);
        if jitter_range > 0.0 {
            let jitter = rand::thread_rng().gen_range(0.0..jitter_range);
            delay.saturating_add(Duration::from_secs_f64(jitter))
        } else {
            delay
        }
    }
}
