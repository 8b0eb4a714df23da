//! Scheduler error taxonomy.

use thiserror::Error;

/// Errors surfaced by the scheduler and its storage layer.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("{kind} {uuid} not found")]
    NotFound { kind: &'static str, uuid: String },

    #[error("task type {0} is already registered")]
    Conflict(String),

    #[error("invalid task parameters: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("job runner error: {0}")]
    TransientRunner(String),
}

impl SchedulerError {
    pub fn task_not_found(uuid: impl Into<String>) -> Self {
        SchedulerError::NotFound {
            kind: "task",
            uuid: uuid.into(),
        }
    }

    pub fn job_not_found(uuid: impl Into<String>) -> Self {
        SchedulerError::NotFound {
            kind: "job",
            uuid: uuid.into(),
        }
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(e: sqlx::Error) -> Self {
        SchedulerError::Storage(e.into())
    }
}

/// Errors raised while a job function runs.
///
/// These never reach the HTTP layer; the worker folds them into the task and
/// job status via the failure callback.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("datasource backend not found: {0}")]
    BackendNotFound(String),

    #[error("job was canceled")]
    Canceled,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}
