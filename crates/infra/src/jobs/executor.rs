//! Alarm executor: the tokio task that fires the durable alarm.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::orchestrator::Orchestrator;

/// Alarm executor configuration.
#[derive(Debug, Clone)]
pub struct AlarmExecutorConfig {
    /// How long to wait before re-reading the store when no alarm is set
    pub idle_recheck: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for AlarmExecutorConfig {
    fn default() -> Self {
        Self {
            idle_recheck: Duration::from_secs(30),
            name: "alarm-executor".to_string(),
        }
    }
}

impl AlarmExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_idle_recheck(mut self, idle_recheck: Duration) -> Self {
        self.idle_recheck = idle_recheck;
        self
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct AlarmExecutorHandle {
    shutdown: Arc<Notify>,
    join: Option<JoinHandle<()>>,
}

impl AlarmExecutorHandle {
    /// Request graceful shutdown and wait for the loop to exit.
    ///
    /// An alarm cycle already in progress is allowed to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "alarm executor task failed");
            }
        }
    }
}

/// Sleeps until the stored alarm is due, then runs the alarm handler.
///
/// Wakes early whenever the alarm is re-armed or cleared. Because the alarm
/// lives in the durable store, a fresh process picks up where the last one
/// stopped.
pub struct AlarmExecutor {
    orchestrator: Arc<Orchestrator>,
}

impl AlarmExecutor {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn spawn(self, config: AlarmExecutorConfig) -> AlarmExecutorHandle {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();
        let join = tokio::spawn(async move {
            executor_loop(self.orchestrator, config, signal).await;
        });

        AlarmExecutorHandle {
            shutdown,
            join: Some(join),
        }
    }
}

async fn executor_loop(
    orchestrator: Arc<Orchestrator>,
    config: AlarmExecutorConfig,
    shutdown: Arc<Notify>,
) {
    info!(name = %config.name, "alarm executor started");

    loop {
        let changed = orchestrator.alarm_changed();

        let (wait, due) = match orchestrator.alarm_at().await {
            Ok(Some(at)) => {
                let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                (wait, true)
            }
            Ok(None) => (config.idle_recheck, false),
            Err(e) => {
                warn!(name = %config.name, error = %e, "could not read alarm");
                (config.idle_recheck, false)
            }
        };
        debug!(name = %config.name, wait_ms = wait.as_millis() as u64, due, "alarm executor waiting");

        tokio::select! {
            _ = shutdown.notified() => {
                info!(name = %config.name, "alarm executor received shutdown signal");
                break;
            }
            _ = changed => {
                debug!(name = %config.name, "alarm changed");
            }
            _ = tokio::time::sleep(wait) => {
                if !due {
                    continue;
                }
                match orchestrator.fire_alarm(Utc::now()).await {
                    Ok(Some(report)) => debug!(
                        name = %config.name,
                        polled = report.polled,
                        next_alarm = ?report.next_alarm,
                        "alarm fired"
                    ),
                    Ok(None) => debug!(name = %config.name, "alarm not due yet"),
                    Err(e) => {
                        error!(name = %config.name, error = %e, "alarm cycle failed");
                        // The alarm may still be past due; do not spin on it.
                        tokio::select! {
                            _ = shutdown.notified() => {
                                info!(name = %config.name, "alarm executor received shutdown signal");
                                break;
                            }
                            _ = tokio::time::sleep(config.idle_recheck) => {}
                        }
                    }
                }
            }
        }
    }

    info!(name = %config.name, "alarm executor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::DateTime;
    use serde_json::Value as JsonValue;

    use crate::jobs::orchestrator::Collaborators;
    use crate::jobs::testing::{FlakySink, Harness, ScriptedProvider, result_line, test_config};
    use crate::store::{DurableStore, InMemoryDurableStore, StoreError};
    use crate::vector_store::InMemoryVectorStore;
    use curator_core::{FileId, JobHandle};

    #[tokio::test]
    async fn fires_a_due_alarm_and_stops_on_shutdown() {
        let h = Harness::new(FlakySink::healthy()).await;
        let job = JobHandle::new("batch_1").unwrap();
        h.orchestrator
            .start_polling(job.clone(), FileId::new("in-1").unwrap(), None)
            .await
            .unwrap();
        h.provider.complete(&job, &result_line("a1", &[1.0]));

        // Pull the alarm into the past so the executor fires right away.
        h.store
            .set_alarm(Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();

        let handle = AlarmExecutor::new(h.orchestrator.clone()).spawn(
            AlarmExecutorConfig::default()
                .with_name("test-executor")
                .with_idle_recheck(Duration::from_millis(20)),
        );

        for _ in 0..200 {
            if h.orchestrator.registry().is_empty().await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;
        h.settle().await;

        assert!(h.orchestrator.registry().is_empty().await.unwrap());
        assert!(h.store.get_alarm().await.unwrap().is_none());
        assert_eq!(h.sink.delivered().len(), 1);
    }

    /// Store whose alarm can never be cleared.
    struct StuckAlarmStore {
        inner: InMemoryDurableStore,
        clear_attempts: AtomicU32,
    }

    #[async_trait]
    impl DurableStore for StuckAlarmStore {
        async fn get(&self, key: &str) -> Result<Option<JsonValue>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: JsonValue) -> Result<(), StoreError> {
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<(String, JsonValue)>, StoreError> {
            self.inner.list(prefix).await
        }

        async fn first(&self, prefix: &str) -> Result<Option<(String, JsonValue)>, StoreError> {
            self.inner.first(prefix).await
        }

        async fn count(&self, prefix: &str) -> Result<usize, StoreError> {
            self.inner.count(prefix).await
        }

        async fn get_alarm(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
            self.inner.get_alarm().await
        }

        async fn set_alarm(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
            self.inner.set_alarm(at).await
        }

        async fn delete_alarm(&self) -> Result<(), StoreError> {
            self.clear_attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::backend("alarm table unavailable"))
        }
    }

    #[tokio::test]
    async fn failing_alarm_cycle_waits_before_retrying() {
        let store = Arc::new(StuckAlarmStore {
            inner: InMemoryDurableStore::new(),
            clear_attempts: AtomicU32::new(0),
        });
        store
            .set_alarm(Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        let orchestrator = Orchestrator::boot(
            Collaborators {
                store: store.clone(),
                provider: Arc::new(ScriptedProvider::default()),
                vectors: Arc::new(InMemoryVectorStore::permissive()),
                sink: Some(Arc::new(FlakySink::healthy())),
            },
            test_config(),
        )
        .await
        .unwrap();

        let handle = AlarmExecutor::new(orchestrator).spawn(
            AlarmExecutorConfig::default().with_idle_recheck(Duration::from_millis(50)),
        );
        tokio::time::sleep(Duration::from_millis(175)).await;
        handle.shutdown().await;

        let attempts = store.clear_attempts.load(Ordering::SeqCst);
        assert!(attempts >= 1);
        assert!(attempts <= 6, "alarm retried {attempts} times");
    }

    #[tokio::test]
    async fn idle_executor_shuts_down() {
        let h = Harness::new(FlakySink::healthy()).await;
        let handle = AlarmExecutor::new(h.orchestrator.clone()).spawn(AlarmExecutorConfig::default());
        tokio::task::yield_now().await;
        handle.shutdown().await;
    }
}
