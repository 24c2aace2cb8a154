//! Job provider boundary: upload input, create a job, poll it, fetch results.

use async_trait::async_trait;
use thiserror::Error;

use curator_core::{CoreError, FileId, JobHandle};

/// Job provider call error.
///
/// Every variant is treated as transient by the orchestrator: it bumps the
/// retry count of the affected chunk or job and is never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("failed to decode provider response: {0}")]
    Decode(String),
}

impl From<ProviderError> for CoreError {
    fn from(value: ProviderError) -> Self {
        CoreError::transient(value.to_string())
    }
}

/// Provider job state, collapsed to what the polling state machine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    /// validating / in_progress / finalizing, or anything unrecognised
    Pending,
    Completed,
    Failed,
    Expired,
    Cancelling,
    Cancelled,
}

impl ProviderStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "expired" => Self::Expired,
            "cancelling" => Self::Cancelling,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    /// Failed, expired or cancel(l)ing: never retried.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Expired | Self::Cancelling | Self::Cancelled
        )
    }
}

/// Response of a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusReport {
    pub status: ProviderStatus,
    /// Status string as the provider sent it.
    pub raw_status: String,
    /// Result reference, present once the job completed with output.
    pub output_file_id: Option<FileId>,
    /// Per-request error file, if the provider produced one.
    pub error_file_id: Option<FileId>,
}

impl JobStatusReport {
    pub fn from_raw(
        raw_status: impl Into<String>,
        output_file_id: Option<FileId>,
        error_file_id: Option<FileId>,
    ) -> Self {
        let raw_status = raw_status.into();
        Self {
            status: ProviderStatus::parse(&raw_status),
            raw_status,
            output_file_id,
            error_file_id,
        }
    }
}

#[async_trait]
pub trait JobProvider: Send + Sync {
    /// Upload a work payload and return its file reference.
    async fn upload(&self, name: &str, bytes: Vec<u8>, purpose: &str)
    -> Result<FileId, ProviderError>;

    /// Start a job over a previously uploaded file.
    async fn create_job(&self, input_file_id: &FileId) -> Result<JobHandle, ProviderError>;

    /// Query job state. `Ok(None)` means the provider answered without a
    /// usable status (empty or null body).
    async fn get_status(&self, handle: &JobHandle)
    -> Result<Option<JobStatusReport>, ProviderError>;

    /// Download a result blob.
    async fn get_result(&self, result_ref: &FileId) -> Result<String, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_map_to_states() {
        assert_eq!(ProviderStatus::parse("validating"), ProviderStatus::Pending);
        assert_eq!(ProviderStatus::parse("in_progress"), ProviderStatus::Pending);
        assert_eq!(ProviderStatus::parse("finalizing"), ProviderStatus::Pending);
        assert_eq!(ProviderStatus::parse("Completed"), ProviderStatus::Completed);
        assert_eq!(ProviderStatus::parse("cancelling"), ProviderStatus::Cancelling);
        assert!(ProviderStatus::parse("expired").is_terminal_failure());
        assert!(ProviderStatus::parse("failed").is_terminal_failure());
        assert!(!ProviderStatus::parse("something_new").is_terminal_failure());
    }
}
