use serde::{Deserialize, Serialize};

use curator_core::{ChunkId, CoreError, FileId, JobHandle, OwnerId};
use curator_infra::jobs::Chunk;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    /// A missing list is treated like an empty one.
    #[serde(default)]
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPollingRequest {
    #[serde(default, alias = "batchId")]
    pub job_handle: Option<String>,
    #[serde(default, alias = "inputFileId")]
    pub input_ref: Option<String>,
    #[serde(default, alias = "userId")]
    pub owner_id: Option<String>,
}

/// A [`StartPollingRequest`] with every identifier validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartPolling {
    pub job_handle: JobHandle,
    pub input_ref: FileId,
    pub owner_id: Option<OwnerId>,
}

impl StartPollingRequest {
    pub fn validate(self) -> Result<StartPolling, CoreError> {
        let job_handle = self
            .job_handle
            .ok_or_else(|| CoreError::invalid_input("jobHandle is required"))
            .and_then(JobHandle::new)?;
        let input_ref = self
            .input_ref
            .ok_or_else(|| CoreError::invalid_input("inputRef is required"))
            .and_then(FileId::new)?;
        // A blank owner means "no owner", not a malformed request.
        let owner_id = self
            .owner_id
            .filter(|owner| !owner.trim().is_empty())
            .map(OwnerId::new)
            .transpose()?;

        Ok(StartPolling {
            job_handle,
            input_ref,
            owner_id,
        })
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub enqueued: usize,
    pub chunk_ids: Vec<String>,
}

impl EnqueueResponse {
    pub fn from_ids(ids: &[ChunkId]) -> Self {
        Self {
            enqueued: ids.len(),
            chunk_ids: ids.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPollingResponse {
    pub job_handle: String,
    /// `false` when the job was already being tracked.
    pub registered: bool,
}
