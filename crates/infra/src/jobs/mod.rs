//! Durable batch-job orchestrator.
//!
//! ## Design
//!
//! - Chunks wait in a FIFO queue until the drain worker submits them
//! - One registry entry per provider job, polled from a single durable alarm
//! - The alarm interval widens the longer polling has been running
//! - Completed jobs are ingested once, then the consumer is notified
//! - Notifications that exhaust their immediate retries wait in a ledger
//!
//! ## Components
//!
//! - `Orchestrator`: owns the state machine; built with `Orchestrator::boot`
//! - `AlarmScheduler`: the alarm slot and the polling clock
//! - `AlarmExecutor`: tokio task that fires the alarm
//! - `JobProvider` / `CallbackSink`: outbound collaborator boundaries

pub mod alarm;
pub mod callback;
pub mod executor;
pub mod ingest;
pub mod keys;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod registry;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use alarm::{AlarmScheduler, FAST_INTERVAL, PollingClock, interval_for_elapsed};
pub use callback::{
    CallbackSink, DeliveryError, LedgerReport, PendingCallbackLedger, UnconfiguredSink,
    deliver_with_retries,
};
pub use executor::{AlarmExecutor, AlarmExecutorConfig, AlarmExecutorHandle};
pub use ingest::{CorrelationId, DroppedLine, IngestError, ParsedResults, parse_result_blob};
pub use orchestrator::{
    AlarmReport, Collaborators, DrainStep, Orchestrator, OrchestratorStatus, RecoveryReport,
};
pub use provider::{JobProvider, JobStatusReport, ProviderError, ProviderStatus};
pub use queue::ChunkQueue;
pub use registry::JobRegistry;
pub use types::{
    ArticleInput, Backoff, BatchJob, BatchStatus, Chunk, NotifyPayload, PendingCallback,
};
