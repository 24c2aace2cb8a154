//! The batch orchestrator.
//!
//! Everything it knows lives in the durable store; in-memory state is limited
//! to the drain-worker flag, the alarm gate and handles of in-flight
//! notification tasks. Construct it with [`Orchestrator::boot`], which
//! replays persisted state before the instance is handed out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::futures::Notified;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use curator_core::{ChunkId, CoreError, CoreResult, FileId, JobHandle, OwnerId};

use crate::config::OrchestratorConfig;
use crate::store::{DurableStore, StoreError};
use crate::vector_store::VectorStore;

use super::alarm::AlarmScheduler;
use super::callback::{
    CallbackSink, DeliveryError, PendingCallbackLedger, UnconfiguredSink, deliver_with_retries,
};
use super::ingest::{self, IngestError};
use super::provider::{JobProvider, JobStatusReport, ProviderError, ProviderStatus};
use super::queue::{self, ChunkQueue};
use super::registry::JobRegistry;
use super::types::{BatchJob, BatchStatus, Chunk, NotifyPayload};

/// External collaborators of one orchestrator instance.
pub struct Collaborators {
    pub store: Arc<dyn DurableStore>,
    pub provider: Arc<dyn JobProvider>,
    pub vectors: Arc<dyn VectorStore>,
    /// `None` when no downstream consumer is configured.
    pub sink: Option<Arc<dyn CallbackSink>>,
}

/// What one drain iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainStep {
    Empty,
    Submitted { chunk_id: ChunkId, handle: JobHandle },
    /// The chunk had nothing to embed and was removed.
    Skipped { chunk_id: ChunkId },
    Retried { chunk_id: ChunkId, retry_count: u32 },
    Dropped { chunk_id: ChunkId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollOutcome {
    Completed,
    Failed,
    Abandoned,
    Pending,
}

/// Summary of one alarm cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmReport {
    pub polled: usize,
    pub completed: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub pending: usize,
    pub callbacks_delivered: usize,
    pub callbacks_dropped: usize,
    pub callbacks_pending: usize,
    /// `None` when polling was torn down.
    pub next_alarm: Option<DateTime<Utc>>,
}

/// State found on startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub queued_chunks: usize,
    pub pending_jobs: usize,
    pub pending_callbacks: usize,
    /// Alarm armed by recovery, if one was missing.
    pub armed_alarm: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub queued_chunks: usize,
    pub pending_jobs: usize,
    pub pending_callbacks: usize,
    pub alarm_at: Option<DateTime<Utc>>,
    pub polling_started_at: Option<DateTime<Utc>>,
    pub polling_interval_secs: Option<u64>,
    pub draining: bool,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    queue: ChunkQueue,
    registry: JobRegistry,
    ledger: PendingCallbackLedger,
    alarm: AlarmScheduler,
    provider: Arc<dyn JobProvider>,
    vectors: Arc<dyn VectorStore>,
    sink: Arc<dyn CallbackSink>,
    worker_active: AtomicBool,
    /// Held for the whole alarm handler and for every alarm write outside it.
    alarm_gate: Mutex<()>,
    deliveries: StdMutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build an instance over `collaborators` and run recovery before
    /// returning it.
    pub async fn boot(
        collaborators: Collaborators,
        config: OrchestratorConfig,
    ) -> CoreResult<Arc<Self>> {
        let Collaborators {
            store,
            provider,
            vectors,
            sink,
        } = collaborators;

        let sink = sink.unwrap_or_else(|| {
            warn!("no downstream consumer configured; notifications will wait in the ledger");
            Arc::new(UnconfiguredSink) as Arc<dyn CallbackSink>
        });

        let orchestrator = Arc::new(Self {
            queue: ChunkQueue::new(store.clone()),
            registry: JobRegistry::new(store.clone()),
            ledger: PendingCallbackLedger::new(
                store.clone(),
                config.ledger_retry_ceiling,
                config.callback_backoff.clone(),
            ),
            alarm: AlarmScheduler::new(store),
            config,
            provider,
            vectors,
            sink,
            worker_active: AtomicBool::new(false),
            alarm_gate: Mutex::new(()),
            deliveries: StdMutex::new(Vec::new()),
        });

        orchestrator.recover().await?;
        Ok(orchestrator)
    }

    pub fn queue(&self) -> &ChunkQueue {
        &self.queue
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &PendingCallbackLedger {
        &self.ledger
    }

    pub fn alarm(&self) -> &AlarmScheduler {
        &self.alarm
    }

    /// Restart the drain worker and arm a missing alarm from persisted state.
    #[instrument(skip(self), err)]
    pub async fn recover(self: &Arc<Self>) -> CoreResult<RecoveryReport> {
        let queued_chunks = self.queue.len().await?;
        let pending_jobs = self.registry.len().await?;
        let pending_callbacks = self.ledger.len().await?;

        if queued_chunks > 0 {
            self.start_drain_worker();
        }

        let armed_alarm = if pending_jobs > 0 || pending_callbacks > 0 {
            self.arm_if_idle().await?
        } else {
            None
        };

        let report = RecoveryReport {
            queued_chunks,
            pending_jobs,
            pending_callbacks,
            armed_alarm,
        };
        info!(
            queued_chunks,
            pending_jobs,
            pending_callbacks,
            armed = armed_alarm.is_some(),
            "orchestrator recovered"
        );
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // Admission
    // ---------------------------------------------------------------------

    /// Queue chunks for submission and make sure the drain worker runs.
    pub async fn enqueue(self: &Arc<Self>, chunks: Vec<Chunk>) -> CoreResult<Vec<ChunkId>> {
        if chunks.is_empty() {
            return Err(CoreError::invalid_input("chunks cannot be empty"));
        }

        let ids = self.queue.enqueue(chunks).await?;
        info!(count = ids.len(), "chunks enqueued");
        self.start_drain_worker();
        Ok(ids)
    }

    /// Track a job created outside the chunk queue.
    ///
    /// An already tracked handle is left untouched. Returns whether a new
    /// entry was created.
    pub async fn start_polling(
        &self,
        handle: JobHandle,
        input_file_id: FileId,
        owner_id: Option<OwnerId>,
    ) -> CoreResult<bool> {
        let job = BatchJob::new(handle, input_file_id, owner_id);
        let inserted = self.registry.insert_if_absent(&job).await?;
        if inserted {
            info!(job_handle = %job.handle, "external job registered");
        } else {
            debug!(job_handle = %job.handle, "job already tracked");
        }
        self.arm_if_idle().await?;
        Ok(inserted)
    }

    pub async fn status(&self) -> CoreResult<OrchestratorStatus> {
        let clock = self.alarm.clock().await?;
        Ok(OrchestratorStatus {
            queued_chunks: self.queue.len().await?,
            pending_jobs: self.registry.len().await?,
            pending_callbacks: self.ledger.len().await?,
            alarm_at: self.alarm.scheduled_at().await?,
            polling_started_at: clock.as_ref().map(|c| c.started_at),
            polling_interval_secs: clock.map(|c| c.interval.as_secs()),
            draining: self.is_draining(),
        })
    }

    // ---------------------------------------------------------------------
    // Chunk queue worker
    // ---------------------------------------------------------------------

    pub fn is_draining(&self) -> bool {
        self.worker_active.load(Ordering::Acquire)
    }

    /// Spawn the drain worker unless one is already running.
    pub fn start_drain_worker(self: &Arc<Self>) -> bool {
        if self
            .worker_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("drain worker already running");
            return false;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.drain_loop().await });
        info!("drain worker started");
        true
    }

    async fn drain_loop(&self) {
        loop {
            match self.drain_step().await {
                Ok(DrainStep::Empty) => {
                    self.worker_active.store(false, Ordering::Release);
                    // Chunks enqueued after the empty read found the flag still set.
                    let more = matches!(self.queue.is_empty().await, Ok(false));
                    if more
                        && self
                            .worker_active
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                    {
                        continue;
                    }
                    info!("chunk queue drained; worker stopping");
                    return;
                }
                Ok(step) => {
                    debug!(?step, "drain step finished");
                    let delay = self.config.inter_item_delay;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "drain worker stopped");
                    self.worker_active.store(false, Ordering::Release);
                    return;
                }
            }
        }
    }

    /// Submit the oldest queued chunk.
    pub async fn drain_step(&self) -> CoreResult<DrainStep> {
        let Some((chunk_id, mut chunk)) = self.queue.oldest().await? else {
            return Ok(DrainStep::Empty);
        };

        match self.submit_chunk(&chunk).await {
            Ok(Some(job)) => {
                let handle = job.handle.clone();
                // Registered before the chunk is deleted; a crash in between resubmits it.
                self.registry.insert_if_absent(&job).await?;
                self.queue.remove(&chunk_id).await?;
                self.arm_if_idle().await?;
                info!(
                    chunk_id = %chunk_id,
                    job_handle = %handle,
                    index = chunk.index,
                    articles = chunk.articles.len(),
                    "chunk submitted"
                );
                Ok(DrainStep::Submitted { chunk_id, handle })
            }
            Ok(None) => {
                warn!(chunk_id = %chunk_id, index = chunk.index, "chunk has nothing to embed; removing");
                self.queue.remove(&chunk_id).await?;
                Ok(DrainStep::Skipped { chunk_id })
            }
            Err(e) => {
                chunk.retry_count += 1;
                if chunk.retry_count > self.config.chunk_retry_ceiling {
                    error!(
                        chunk_id = %chunk_id,
                        index = chunk.index,
                        retry_count = chunk.retry_count,
                        error = %e,
                        "chunk retry ceiling exceeded; dropping"
                    );
                    self.queue.remove(&chunk_id).await?;
                    Ok(DrainStep::Dropped { chunk_id })
                } else {
                    warn!(
                        chunk_id = %chunk_id,
                        index = chunk.index,
                        retry_count = chunk.retry_count,
                        error = %e,
                        "chunk submission failed; will retry"
                    );
                    self.queue.put(&chunk_id, &chunk).await?;
                    Ok(DrainStep::Retried {
                        chunk_id,
                        retry_count: chunk.retry_count,
                    })
                }
            }
        }
    }

    async fn submit_chunk(&self, chunk: &Chunk) -> Result<Option<BatchJob>, ProviderError> {
        let Some(body) = queue::build_request_jsonl(chunk, &self.config.embedding_model) else {
            return Ok(None);
        };
        let name = queue::upload_name(chunk.index, Utc::now());
        let input_file_id = self.provider.upload(&name, body.into_bytes(), "batch").await?;
        let handle = self.provider.create_job(&input_file_id).await?;
        Ok(Some(BatchJob::new(handle, input_file_id, chunk.owner_id.clone())))
    }

    // ---------------------------------------------------------------------
    // Alarm handler
    // ---------------------------------------------------------------------

    pub async fn alarm_at(&self) -> CoreResult<Option<DateTime<Utc>>> {
        Ok(self.alarm.scheduled_at().await?)
    }

    /// Resolves when the alarm slot changes.
    pub fn alarm_changed(&self) -> Notified<'_> {
        self.alarm.changed()
    }

    /// Run the alarm handler immediately, whatever the schedule.
    pub async fn on_alarm(self: &Arc<Self>) -> CoreResult<AlarmReport> {
        let _gate = self.alarm_gate.lock().await;
        self.run_alarm_cycle().await
    }

    /// Timer entry point: consume the alarm and run the handler if it is due
    /// at `now`. Returns `None` when nothing was due.
    pub async fn fire_alarm(self: &Arc<Self>, now: DateTime<Utc>) -> CoreResult<Option<AlarmReport>> {
        let _gate = self.alarm_gate.lock().await;
        match self.alarm.scheduled_at().await? {
            Some(at) if at <= now => {}
            _ => return Ok(None),
        }
        self.alarm.clear_fired().await?;
        self.run_alarm_cycle().await.map(Some)
    }

    async fn run_alarm_cycle(self: &Arc<Self>) -> CoreResult<AlarmReport> {
        let result = self.alarm_cycle().await;
        if let Err(e) = &result {
            error!(error = %e, "alarm handler failed");
            if let Err(arm_err) = self.alarm.ensure_armed(Utc::now()).await {
                error!(error = %arm_err, "could not re-arm alarm after failure");
            }
        }
        result
    }

    async fn alarm_cycle(self: &Arc<Self>) -> CoreResult<AlarmReport> {
        let mut report = AlarmReport::default();

        for job in self.registry.list().await? {
            report.polled += 1;
            match self.poll_job(job).await? {
                PollOutcome::Completed => report.completed += 1,
                PollOutcome::Failed => report.failed += 1,
                PollOutcome::Abandoned => report.abandoned += 1,
                PollOutcome::Pending => report.pending += 1,
            }
        }

        let ledger = self.ledger.retry_due(self.sink.as_ref(), Utc::now()).await?;
        report.callbacks_delivered = ledger.delivered;
        report.callbacks_dropped = ledger.dropped;
        report.callbacks_pending = ledger.remaining;

        if !self.registry.is_empty().await? || !self.ledger.is_empty().await? {
            report.next_alarm = Some(self.alarm.rearm(Utc::now()).await?);
        } else {
            self.alarm.teardown().await?;
        }

        info!(
            polled = report.polled,
            completed = report.completed,
            failed = report.failed,
            abandoned = report.abandoned,
            pending = report.pending,
            callbacks_delivered = report.callbacks_delivered,
            callbacks_dropped = report.callbacks_dropped,
            callbacks_pending = report.callbacks_pending,
            next_alarm = ?report.next_alarm,
            "alarm cycle finished"
        );
        Ok(report)
    }

    #[instrument(skip(self, job), fields(job_handle = %job.handle))]
    async fn poll_job(self: &Arc<Self>, mut job: BatchJob) -> Result<PollOutcome, StoreError> {
        job.last_polled_at = Some(Utc::now());

        let report = match self.provider.get_status(&job.handle).await {
            Ok(Some(report)) => report,
            Ok(None) => return self.record_poll_failure(job, "empty status response").await,
            Err(e) => return self.record_poll_failure(job, &e.to_string()).await,
        };

        match report.status {
            ProviderStatus::Completed => match self.complete_job(&job, &report).await {
                Ok(payload) => {
                    if let Some(payload) = payload {
                        self.dispatch_notification(payload);
                    }
                    self.registry.remove(&job.handle).await?;
                    Ok(PollOutcome::Completed)
                }
                Err(e) => {
                    error!(
                        error = %e,
                        "results of completed job could not be ingested; removing"
                    );
                    self.registry.remove(&job.handle).await?;
                    Ok(PollOutcome::Failed)
                }
            },
            status if status.is_terminal_failure() => {
                let failure = CoreError::terminal(format!("provider reported {}", report.raw_status));
                error!(error = %failure, "job failed permanently; removing");
                self.registry.remove(&job.handle).await?;
                Ok(PollOutcome::Failed)
            }
            _ => {
                job.status = BatchStatus::Running;
                job.provider_status = Some(report.raw_status);
                self.registry.put(&job).await?;
                debug!(status = ?job.provider_status, "job still running");
                Ok(PollOutcome::Pending)
            }
        }
    }

    async fn record_poll_failure(
        &self,
        mut job: BatchJob,
        reason: &str,
    ) -> Result<PollOutcome, StoreError> {
        job.retry_count += 1;
        if job.retry_count > self.config.poll_retry_ceiling {
            error!(
                job_handle = %job.handle,
                retry_count = job.retry_count,
                reason,
                "polling retry ceiling exceeded; abandoning job"
            );
            self.registry.remove(&job.handle).await?;
            Ok(PollOutcome::Abandoned)
        } else {
            warn!(
                job_handle = %job.handle,
                retry_count = job.retry_count,
                reason,
                "transient polling failure"
            );
            self.registry.put(&job).await?;
            Ok(PollOutcome::Pending)
        }
    }

    /// Ingest a completed job. `Ok(None)` means there is nothing to notify.
    /// The job is never polled again, whatever the outcome.
    async fn complete_job(
        &self,
        job: &BatchJob,
        report: &JobStatusReport,
    ) -> CoreResult<Option<NotifyPayload>> {
        let Some(output) = &report.output_file_id else {
            info!(job_handle = %job.handle, "job completed without output");
            return Ok(None);
        };

        let blob = self.provider.get_result(output).await?;
        let parsed = ingest::parse_result_blob(&blob, self.config.freshness_placeholder);
        if !parsed.dropped.is_empty() {
            warn!(
                job_handle = %job.handle,
                dropped = parsed.dropped.len(),
                error_file_id = ?report.error_file_id,
                "completed job has unusable result lines"
            );
        }
        if parsed.records.is_empty() {
            info!(
                job_handle = %job.handle,
                dropped = parsed.dropped.len(),
                "job completed with nothing to ingest"
            );
            return Ok(None);
        }

        match ingest::apply(self.vectors.as_ref(), &parsed.records).await {
            Ok(()) => {}
            Err(e @ IngestError::MissingRows { .. }) => {
                warn!(job_handle = %job.handle, error = %e, "ingestion touched missing rows; not notifying");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            job_handle = %job.handle,
            records = parsed.records.len(),
            dropped = parsed.dropped.len(),
            "job results ingested"
        );
        Ok(Some(NotifyPayload {
            records: parsed.records,
            owner_id: job.owner_id.clone().or(parsed.owner_id),
        }))
    }

    // ---------------------------------------------------------------------
    // Notification delivery
    // ---------------------------------------------------------------------

    fn dispatch_notification(self: &Arc<Self>, payload: NotifyPayload) {
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.deliver(payload).await });

        let mut tasks = self
            .deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    async fn deliver(&self, payload: NotifyPayload) {
        let result = deliver_with_retries(
            self.sink.as_ref(),
            &payload,
            self.config.callback_attempts,
            &self.config.callback_backoff,
        )
        .await;

        match result {
            Ok(()) => info!(records = payload.records.len(), "notification delivered"),
            Err(e) => {
                if let Err(store_err) = self.escalate(payload, &e).await {
                    error!(
                        error = %store_err,
                        delivery_error = %e,
                        "could not persist undelivered notification"
                    );
                }
            }
        }
    }

    async fn escalate(&self, payload: NotifyPayload, error: &DeliveryError) -> Result<(), StoreError> {
        self.ledger.append(payload, error, Utc::now()).await?;
        self.arm_if_idle().await?;
        Ok(())
    }

    /// Wait for every detached notification task started so far.
    pub async fn wait_for_deliveries(&self) {
        let tasks = std::mem::take(
            &mut *self
                .deliveries
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "notification task failed");
            }
        }
    }

    async fn arm_if_idle(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let _gate = self.alarm_gate.lock().await;
        self.alarm.ensure_armed(Utc::now()).await
    }
}
