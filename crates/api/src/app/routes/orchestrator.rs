use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, rejection::JsonRejection},
    response::IntoResponse,
};
use tracing::info;

use curator_infra::jobs::Orchestrator;

use crate::app::{dto, errors};

pub async fn enqueue(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    body: Result<Json<dto::EnqueueRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };

    match orchestrator.enqueue(body.chunks).await {
        Ok(ids) => Json(dto::EnqueueResponse::from_ids(&ids)).into_response(),
        Err(e) => errors::core_error_to_response(e),
    }
}

pub async fn start_polling(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    body: Result<Json<dto::StartPollingRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };
    let request = match body.validate() {
        Ok(request) => request,
        Err(e) => return errors::core_error_to_response(e),
    };

    let job_handle = request.job_handle.to_string();
    match orchestrator
        .start_polling(request.job_handle, request.input_ref, request.owner_id)
        .await
    {
        Ok(registered) => Json(dto::StartPollingResponse {
            job_handle,
            registered,
        })
        .into_response(),
        Err(e) => errors::core_error_to_response(e),
    }
}

/// Run the alarm handler now, outside the schedule.
pub async fn trigger_alarm(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
) -> axum::response::Response {
    info!("alarm triggered over http");
    match orchestrator.on_alarm().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::core_error_to_response(e),
    }
}
