//! Application setup and router wiring.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::scheduler::{JobRunner, Scheduler, SchedulerError, TaskRegistry, TaskStore};

use super::routes;

/// Shared state of the HTTP API.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<TaskRegistry>,
    pub store: Arc<dyn TaskStore>,
    pub runner: Arc<dyn JobRunner>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            registry: scheduler.registry().clone(),
            store: scheduler.store().clone(),
            runner: scheduler.runner().clone(),
            scheduler,
        }
    }
}

/// Error surfaced by the API handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::UnknownTaskType(_) => Self::bad_request("Unknown task type"),
            SchedulerError::NotFound { .. } => Self::not_found(e.to_string()),
            SchedulerError::Validation(message) => Self::bad_request(message),
            SchedulerError::Conflict(_) => Self::new(StatusCode::CONFLICT, e.to_string()),
            SchedulerError::Storage(_) | SchedulerError::TransientRunner(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/task-types", get(routes::tasks::list_task_types))
        .route(
            "/tasks/:task_type",
            get(routes::tasks::list_tasks).post(routes::tasks::create_task),
        )
        .route(
            "/tasks/:task_type/:task_uuid",
            get(routes::tasks::get_task).delete(routes::tasks::delete_task),
        )
        .route(
            "/tasks/:task_type/:task_uuid/reschedule",
            post(routes::tasks::reschedule_task),
        )
        .route(
            "/tasks/:task_type/:task_uuid/cancel",
            post(routes::tasks::cancel_task),
        )
        .route(
            "/tasks/:task_type/:task_uuid/jobs",
            get(routes::tasks::list_jobs),
        )
        .route(
            "/tasks/:task_type/:task_uuid/jobs/:job_uuid",
            get(routes::tasks::get_job),
        )
        .route(
            "/tasks/:task_type/:task_uuid/jobs/:job_uuid/logs",
            get(routes::tasks::get_job_logs),
        )
        .route("/health", get(routes::health::health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
