//! Orchestrator error taxonomy.

use thiserror::Error;

/// Result type used at the orchestrator's admission boundary.
pub type CoreResult<T> = Result<T, CoreError>;

/// Failure classes shared by every component of the batch pipeline.
///
/// Only `InvalidInput` and `Storage` are ever surfaced to a caller. The other
/// classes describe asynchronous failures that are logged at the point where
/// the affected entity is retried or dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A caller request was malformed (surfaced as 4xx, never retried).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Network failure or 5xx from the job provider; retried with a bounded counter.
    #[error("transient provider error: {0}")]
    TransientProvider(String),

    /// The provider reported the job as failed, expired or cancelled.
    #[error("terminal job failure: {0}")]
    TerminalJobFailure(String),

    /// A single result line could not be used; the rest of the batch continues.
    #[error("partial result error: {0}")]
    PartialResult(String),

    /// The downstream consumer rejected or never received a notification.
    #[error("downstream delivery failure: {0}")]
    DownstreamDelivery(String),

    /// The durable store failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientProvider(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::TerminalJobFailure(msg.into())
    }

    pub fn partial(msg: impl Into<String>) -> Self {
        Self::PartialResult(msg.into())
    }

    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::DownstreamDelivery(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether the failure should be reported back to the caller as a client error.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }
}
