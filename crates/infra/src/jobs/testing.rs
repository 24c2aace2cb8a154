//! In-memory collaborators for orchestrator tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use curator_core::{ArticleId, FileId, JobHandle};

use crate::config::OrchestratorConfig;
use crate::store::{DurableStore, InMemoryDurableStore};
use crate::vector_store::InMemoryVectorStore;

use super::callback::{CallbackSink, DeliveryError};
use super::keys;
use super::orchestrator::{Collaborators, Orchestrator};
use super::provider::{JobProvider, JobStatusReport, ProviderError};
use super::types::{ArticleInput, Backoff, Chunk, NotifyPayload};

pub type StatusReply = Result<Option<JobStatusReport>, ProviderError>;

#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub body: String,
    pub purpose: String,
}

/// Job provider whose answers are scripted per handle.
///
/// Unscripted status queries report `in_progress`.
#[derive(Default)]
pub struct ScriptedProvider {
    store: Option<Arc<dyn DurableStore>>,
    upload_failures: AtomicU32,
    uploads: Mutex<Vec<Upload>>,
    jobs_created: AtomicU32,
    statuses: Mutex<HashMap<JobHandle, VecDeque<StatusReply>>>,
    status_calls: Mutex<HashMap<JobHandle, u32>>,
    results: Mutex<HashMap<FileId, String>>,
    retries_seen: Mutex<Vec<u32>>,
}

impl ScriptedProvider {
    /// A provider that records the retry count of queued chunks on every
    /// upload attempt.
    pub fn observing(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::default()
        }
    }

    pub fn fail_uploads(&self, n: u32) {
        self.upload_failures.store(n, Ordering::SeqCst);
    }

    pub fn push_status(&self, handle: &JobHandle, reply: StatusReply) {
        self.statuses
            .lock()
            .unwrap()
            .entry(handle.clone())
            .or_default()
            .push_back(reply);
    }

    pub fn report(&self, handle: &JobHandle, raw_status: &str) {
        self.push_status(handle, Ok(Some(JobStatusReport::from_raw(raw_status, None, None))));
    }

    /// Script a completion whose result blob is `blob`.
    pub fn complete(&self, handle: &JobHandle, blob: &str) {
        let output = FileId::new(format!("out-{handle}")).unwrap();
        self.results
            .lock()
            .unwrap()
            .insert(output.clone(), blob.to_string());
        self.push_status(
            handle,
            Ok(Some(JobStatusReport::from_raw("completed", Some(output), None))),
        );
    }

    /// Successful uploads, in order.
    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn status_calls(&self, handle: &JobHandle) -> u32 {
        self.status_calls
            .lock()
            .unwrap()
            .get(handle)
            .copied()
            .unwrap_or(0)
    }

    /// Highest queued-chunk retry count seen at each upload attempt.
    pub fn retries_seen(&self) -> Vec<u32> {
        self.retries_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobProvider for ScriptedProvider {
    async fn upload(
        &self,
        name: &str,
        bytes: Vec<u8>,
        purpose: &str,
    ) -> Result<FileId, ProviderError> {
        if let Some(store) = &self.store {
            let max = store
                .list(keys::CHUNK_PREFIX)
                .await
                .unwrap()
                .into_iter()
                .filter_map(|(_, value)| serde_json::from_value::<Chunk>(value).ok())
                .map(|c| c.retry_count)
                .max()
                .unwrap_or(0);
            self.retries_seen.lock().unwrap().push(max);
        }

        let failing = self
            .upload_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProviderError::Http {
                status: 503,
                body: "unavailable".to_string(),
            });
        }

        let mut uploads = self.uploads.lock().unwrap();
        uploads.push(Upload {
            name: name.to_string(),
            body: String::from_utf8_lossy(&bytes).into_owned(),
            purpose: purpose.to_string(),
        });
        Ok(FileId::new(format!("file-{}", uploads.len())).unwrap())
    }

    async fn create_job(&self, _input_file_id: &FileId) -> Result<JobHandle, ProviderError> {
        let n = self.jobs_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(JobHandle::new(format!("batch_{n}")).unwrap())
    }

    async fn get_status(&self, handle: &JobHandle) -> StatusReply {
        *self
            .status_calls
            .lock()
            .unwrap()
            .entry(handle.clone())
            .or_default() += 1;

        let scripted = self
            .statuses
            .lock()
            .unwrap()
            .get_mut(handle)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(Some(JobStatusReport::from_raw("in_progress", None, None))))
    }

    async fn get_result(&self, result_ref: &FileId) -> Result<String, ProviderError> {
        self.results
            .lock()
            .unwrap()
            .get(result_ref)
            .cloned()
            .ok_or(ProviderError::Http {
                status: 404,
                body: format!("no such file: {result_ref}"),
            })
    }
}

/// Consumer that rejects a fixed number of notifications first.
#[derive(Default)]
pub struct FlakySink {
    failures_left: AtomicU32,
    always_fail: bool,
    attempts: AtomicU32,
    delivered: Mutex<Vec<NotifyPayload>>,
}

impl FlakySink {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn failing(n: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(n),
            ..Self::default()
        }
    }

    pub fn always_failing() -> Self {
        Self {
            always_fail: true,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<NotifyPayload> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl CallbackSink for FlakySink {
    async fn notify(&self, payload: &NotifyPayload) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let reject = self.always_fail
            || self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if reject {
            return Err(DeliveryError::Rejected { status: 503 });
        }
        self.delivered.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

/// Defaults with every pause removed.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        inter_item_delay: Duration::ZERO,
        callback_backoff: Backoff::immediate(),
        ..OrchestratorConfig::default()
    }
}

pub fn chunk(index: u32, article_ids: &[&str]) -> Chunk {
    Chunk {
        index,
        articles: article_ids
            .iter()
            .map(|id| ArticleInput {
                article_id: ArticleId::new(*id).unwrap(),
                text: format!("text of {id}"),
            })
            .collect(),
        retry_count: 0,
        owner_id: None,
    }
}

pub fn result_line(article_id: &str, embedding: &[f64]) -> String {
    serde_json::json!({
        "custom_id": format!(r#"{{"articleId":"{article_id}"}}"#),
        "response": { "status_code": 200, "body": { "data": [{ "embedding": embedding }] } },
        "error": null
    })
    .to_string()
}

pub fn error_line(article_id: &str) -> String {
    serde_json::json!({
        "custom_id": format!(r#"{{"articleId":"{article_id}"}}"#),
        "response": null,
        "error": { "code": "server_error", "message": "failed" }
    })
    .to_string()
}

/// Wait for the drain worker to stop and every notification task to finish.
pub async fn settle(orchestrator: &Orchestrator) {
    for _ in 0..400 {
        if !orchestrator.is_draining() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    orchestrator.wait_for_deliveries().await;
}

pub struct Harness {
    pub store: Arc<InMemoryDurableStore>,
    pub provider: Arc<ScriptedProvider>,
    pub vectors: Arc<InMemoryVectorStore>,
    pub sink: Arc<FlakySink>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
    pub async fn new(sink: FlakySink) -> Self {
        Self::with_store(Arc::new(InMemoryDurableStore::new()), sink).await
    }

    pub async fn with_store(store: Arc<InMemoryDurableStore>, sink: FlakySink) -> Self {
        Self::custom(store, InMemoryVectorStore::permissive(), sink).await
    }

    pub async fn custom(
        store: Arc<InMemoryDurableStore>,
        vectors: InMemoryVectorStore,
        sink: FlakySink,
    ) -> Self {
        let provider = Arc::new(ScriptedProvider::observing(store.clone()));
        let vectors = Arc::new(vectors);
        let sink = Arc::new(sink);
        let orchestrator = boot(&store, &provider, &vectors, &sink).await;
        Self {
            store,
            provider,
            vectors,
            sink,
            orchestrator,
        }
    }

    /// Boot a second instance over the same store and fakes.
    pub async fn restart(&self) -> Arc<Orchestrator> {
        boot(&self.store, &self.provider, &self.vectors, &self.sink).await
    }

    pub async fn settle(&self) {
        settle(&self.orchestrator).await;
    }
}

async fn boot(
    store: &Arc<InMemoryDurableStore>,
    provider: &Arc<ScriptedProvider>,
    vectors: &Arc<InMemoryVectorStore>,
    sink: &Arc<FlakySink>,
) -> Arc<Orchestrator> {
    Orchestrator::boot(
        Collaborators {
            store: store.clone(),
            provider: provider.clone(),
            vectors: vectors.clone(),
            sink: Some(sink.clone()),
        },
        test_config(),
    )
    .await
    .unwrap()
}
