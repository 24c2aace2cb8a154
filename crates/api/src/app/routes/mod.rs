use axum::{
    Router,
    routing::{get, post},
};

pub mod orchestrator;
pub mod system;

/// Router for the orchestrator endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/enqueue", post(orchestrator::enqueue))
        .route("/start-polling", post(orchestrator::start_polling))
        .route("/alarm", post(orchestrator::trigger_alarm))
        .route("/status", get(system::status))
}
