use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::scheduler::store::{TaskFilter, TaskStore};
use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    store: String,
}

/// Health check endpoint.
///
/// Returns 200 OK when the task store answers, 503 otherwise.
pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let store_status = match tokio::time::timeout(
        std::time::Duration::from_secs(5),
        state.store.list_tasks(&TaskFilter {
            task_type: Some("eventizer".to_string()),
            status: None,
        }),
    )
    .await
    {
        Ok(Ok(_)) => "ok",
        Ok(Err(_)) => "error",
        Err(_) => "timeout",
    };

    let healthy = store_status == "ok";
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            store: store_status.to_string(),
        }),
    )
}
