//! Downstream notification delivery and the pending-callback ledger.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use curator_core::CoreError;

use crate::store::{DurableStore, StoreError, get_json, put_json};

use super::alarm::to_chrono;
use super::keys;
use super::types::{Backoff, NotifyPayload, PendingCallback};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("consumer rejected the notification with HTTP {status}")]
    Rejected { status: u16 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no downstream consumer configured")]
    NotConfigured,
}

impl From<DeliveryError> for CoreError {
    fn from(value: DeliveryError) -> Self {
        CoreError::delivery(value.to_string())
    }
}

/// Receiver of completion notifications.
#[async_trait]
pub trait CallbackSink: Send + Sync {
    async fn notify(&self, payload: &NotifyPayload) -> Result<(), DeliveryError>;
}

/// Sink used when no consumer address is configured. Every notification ends
/// up in the ledger.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredSink;

#[async_trait]
impl CallbackSink for UnconfiguredSink {
    async fn notify(&self, _payload: &NotifyPayload) -> Result<(), DeliveryError> {
        Err(DeliveryError::NotConfigured)
    }
}

/// Try `attempts` times in total, sleeping `backoff` between attempts.
///
/// Returns the last error once the budget is spent. A missing consumer is not
/// retried.
pub async fn deliver_with_retries(
    sink: &dyn CallbackSink,
    payload: &NotifyPayload,
    attempts: u32,
    backoff: &Backoff,
) -> Result<(), DeliveryError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match sink.notify(payload).await {
            Ok(()) => {
                debug!(attempt, "notification delivered");
                return Ok(());
            }
            Err(DeliveryError::NotConfigured) => return Err(DeliveryError::NotConfigured),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "notification failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Summary of one ledger pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerReport {
    pub delivered: usize,
    pub failed: usize,
    pub dropped: usize,
    /// Entries still in the ledger afterwards.
    pub remaining: usize,
}

/// Persisted list of notifications awaiting another delivery attempt.
///
/// The whole list lives under one key; the mutex serialises its
/// read-modify-write cycles within this process.
pub struct PendingCallbackLedger {
    store: Arc<dyn DurableStore>,
    lock: Mutex<()>,
    retry_ceiling: u32,
    backoff: Backoff,
}

impl PendingCallbackLedger {
    pub fn new(store: Arc<dyn DurableStore>, retry_ceiling: u32, backoff: Backoff) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
            retry_ceiling,
            backoff,
        }
    }

    pub async fn entries(&self) -> Result<Vec<PendingCallback>, StoreError> {
        Ok(get_json(self.store.as_ref(), keys::PENDING_CALLBACKS)
            .await?
            .unwrap_or_default())
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Record a notification whose immediate attempts are exhausted.
    pub async fn append(
        &self,
        payload: NotifyPayload,
        last_error: &DeliveryError,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.entries().await?;
        entries.push(PendingCallback {
            payload,
            retry_count: 0,
            first_failed_at: now,
            next_attempt_at: now + to_chrono(self.backoff.delay_for_attempt(1)),
            last_error: Some(last_error.to_string()),
        });
        self.save(&entries).await?;
        warn!(pending = entries.len(), error = %last_error, "notification moved to pending ledger");
        Ok(())
    }

    /// Give every due entry one more attempt.
    pub async fn retry_due(
        &self,
        sink: &dyn CallbackSink,
        now: DateTime<Utc>,
    ) -> Result<LedgerReport, StoreError> {
        let _guard = self.lock.lock().await;
        let entries = self.entries().await?;
        if entries.is_empty() {
            return Ok(LedgerReport::default());
        }

        let mut report = LedgerReport::default();
        let mut kept = Vec::with_capacity(entries.len());

        for mut entry in entries {
            if entry.next_attempt_at > now {
                kept.push(entry);
                continue;
            }

            match sink.notify(&entry.payload).await {
                Ok(()) => {
                    report.delivered += 1;
                    info!(
                        retry_count = entry.retry_count,
                        records = entry.payload.records.len(),
                        "pending notification delivered"
                    );
                }
                Err(e) => {
                    entry.retry_count += 1;
                    entry.last_error = Some(e.to_string());
                    if entry.retry_count > self.retry_ceiling {
                        report.dropped += 1;
                        error!(
                            retry_count = entry.retry_count,
                            first_failed_at = %entry.first_failed_at,
                            owner_id = entry.payload.owner_id.as_ref().map(|o| o.as_str()).unwrap_or("-"),
                            records = entry.payload.records.len(),
                            error = %e,
                            "notification permanently undelivered; dropping"
                        );
                    } else {
                        report.failed += 1;
                        entry.next_attempt_at =
                            now + to_chrono(self.backoff.delay_for_attempt(entry.retry_count + 1));
                        warn!(retry_count = entry.retry_count, error = %e, "pending notification failed");
                        kept.push(entry);
                    }
                }
            }
        }

        report.remaining = kept.len();
        self.save(&kept).await?;
        Ok(report)
    }

    async fn save(&self, entries: &[PendingCallback]) -> Result<(), StoreError> {
        if entries.is_empty() {
            self.store.delete(keys::PENDING_CALLBACKS).await?;
            Ok(())
        } else {
            put_json(self.store.as_ref(), keys::PENDING_CALLBACKS, entries).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::FlakySink;
    use crate::store::InMemoryDurableStore;
    use crate::vector_store::VectorRecord;
    use curator_core::{ArticleId, OwnerId};

    fn payload() -> NotifyPayload {
        NotifyPayload {
            records: vec![VectorRecord {
                id: ArticleId::new("a1").unwrap(),
                vector: vec![0.5, 0.0],
            }],
            owner_id: Some(OwnerId::new("u1").unwrap()),
        }
    }

    fn ledger(store: Arc<InMemoryDurableStore>) -> PendingCallbackLedger {
        PendingCallbackLedger::new(store, 5, Backoff::immediate())
    }

    #[tokio::test]
    async fn retries_until_success() {
        let sink = FlakySink::failing(2);
        deliver_with_retries(&sink, &payload(), 5, &Backoff::immediate())
            .await
            .unwrap();
        assert_eq!(sink.attempts(), 3);
        assert_eq!(sink.delivered().len(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_the_attempt_budget() {
        let sink = FlakySink::always_failing();
        let err = deliver_with_retries(&sink, &payload(), 5, &Backoff::immediate())
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::Rejected { status: 503 });
        assert_eq!(sink.attempts(), 5);
    }

    #[tokio::test]
    async fn missing_consumer_is_not_retried() {
        let err = deliver_with_retries(&UnconfiguredSink, &payload(), 5, &Backoff::immediate())
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::NotConfigured);
    }

    #[tokio::test]
    async fn ledger_drops_entry_after_ceiling() {
        let store = Arc::new(InMemoryDurableStore::new());
        let ledger = ledger(store.clone());
        let sink = FlakySink::always_failing();
        let now = Utc::now();

        ledger
            .append(payload(), &DeliveryError::Transport("refused".into()), now)
            .await
            .unwrap();
        assert_eq!(ledger.entries().await.unwrap()[0].retry_count, 0);

        for cycle in 1..=5 {
            let report = ledger.retry_due(&sink, now).await.unwrap();
            assert_eq!(report.failed, 1);
            assert_eq!(ledger.entries().await.unwrap()[0].retry_count, cycle);
        }

        let report = ledger.retry_due(&sink, now).await.unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.remaining, 0);
        assert!(store.get(keys::PENDING_CALLBACKS).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ledger_removes_delivered_entries() {
        let store = Arc::new(InMemoryDurableStore::new());
        let ledger = ledger(store);
        let now = Utc::now();
        ledger
            .append(payload(), &DeliveryError::NotConfigured, now)
            .await
            .unwrap();

        let sink = FlakySink::healthy();
        let report = ledger.retry_due(&sink, now).await.unwrap();

        assert_eq!(report.delivered, 1);
        assert!(ledger.is_empty().await.unwrap());
        assert_eq!(sink.delivered(), vec![payload()]);
    }

    #[tokio::test]
    async fn entries_not_yet_due_are_skipped() {
        let store = Arc::new(InMemoryDurableStore::new());
        let ledger = PendingCallbackLedger::new(store, 5, Backoff::default());
        let now = Utc::now();
        ledger
            .append(payload(), &DeliveryError::Rejected { status: 500 }, now)
            .await
            .unwrap();

        let sink = FlakySink::healthy();
        let report = ledger.retry_due(&sink, now).await.unwrap();
        assert_eq!(report, LedgerReport { remaining: 1, ..Default::default() });
        assert_eq!(sink.attempts(), 0);
    }
}
