//! OpenAI-style batch API client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use curator_core::{FileId, JobHandle};

use crate::config::{ConfigError, ProviderConfig};
use crate::jobs::provider::{JobProvider, JobStatusReport, ProviderError};

use super::join_url;

const EMBEDDINGS_ENDPOINT: &str = "/v1/embeddings";
const COMPLETION_WINDOW: &str = "24h";

/// [`JobProvider`] over the `/files` and `/batches` endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiBatchClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    request_timeout: Duration,
    upload_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BatchObject {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    output_file_id: Option<String>,
    #[serde(default)]
    error_file_id: Option<String>,
}

impl OpenAiBatchClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            api_key: config.require_api_key()?.to_string(),
            request_timeout: config.request_timeout,
            upload_timeout: config.upload_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String, ProviderError> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport(e.to_string())
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, ProviderError> {
    serde_json::from_str(body).map_err(|e| ProviderError::Decode(e.to_string()))
}

fn file_id(raw: Option<String>) -> Option<FileId> {
    raw.and_then(|id| FileId::new(id).ok())
}

/// Decode a `GET /batches/{id}` body. An empty body, `null`, or a batch
/// without a status yields `None`.
pub(crate) fn decode_status(body: &str) -> Result<Option<JobStatusReport>, ProviderError> {
    let body = body.trim();
    if body.is_empty() || body == "null" {
        return Ok(None);
    }
    let batch: BatchObject = decode(body)?;
    let Some(status) = batch.status.filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    debug!(batch_id = %batch.id, status = %status, "batch status decoded");
    Ok(Some(JobStatusReport::from_raw(
        status,
        file_id(batch.output_file_id),
        file_id(batch.error_file_id),
    )))
}

#[async_trait]
impl JobProvider for OpenAiBatchClient {
    #[instrument(skip(self, bytes), fields(size = bytes.len()), err)]
    async fn upload(
        &self,
        name: &str,
        bytes: Vec<u8>,
        purpose: &str,
    ) -> Result<FileId, ProviderError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(name.to_string())
            .mime_str("application/jsonl")
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", purpose.to_string())
            .part("file", part);

        let body = self
            .send(
                self.http
                    .post(self.url("files"))
                    .timeout(self.upload_timeout)
                    .multipart(form),
            )
            .await?;
        let file: FileObject = decode(&body)?;
        FileId::new(file.id).map_err(|e| ProviderError::Decode(e.to_string()))
    }

    #[instrument(skip(self), err)]
    async fn create_job(&self, input_file_id: &FileId) -> Result<JobHandle, ProviderError> {
        let request = serde_json::json!({
            "input_file_id": input_file_id.as_str(),
            "endpoint": EMBEDDINGS_ENDPOINT,
            "completion_window": COMPLETION_WINDOW,
        });
        let body = self
            .send(
                self.http
                    .post(self.url("batches"))
                    .timeout(self.request_timeout)
                    .json(&request),
            )
            .await?;
        let batch: BatchObject = decode(&body)?;
        JobHandle::new(batch.id).map_err(|e| ProviderError::Decode(e.to_string()))
    }

    #[instrument(skip(self), err)]
    async fn get_status(
        &self,
        handle: &JobHandle,
    ) -> Result<Option<JobStatusReport>, ProviderError> {
        let body = self
            .send(
                self.http
                    .get(self.url(&format!("batches/{handle}")))
                    .timeout(self.request_timeout),
            )
            .await?;
        decode_status(&body)
    }

    #[instrument(skip(self), err)]
    async fn get_result(&self, result_ref: &FileId) -> Result<String, ProviderError> {
        self.send(
            self.http
                .get(self.url(&format!("files/{result_ref}/content")))
                .timeout(self.upload_timeout),
        )
        .await
    }
}
