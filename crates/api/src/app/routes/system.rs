use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use curator_infra::jobs::Orchestrator;

use crate::app::errors;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Queue, registry and ledger sizes plus the alarm and polling clock.
pub async fn status(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
) -> axum::response::Response {
    match orchestrator.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => errors::core_error_to_response(e),
    }
}
