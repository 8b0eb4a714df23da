//! Job model.
//!
//! A job is a single attempt to run a task with concrete arguments. Jobs
//! never outlive their task; deleting a task cascades to its jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::task::SchedulerStatus;

/// One run of a task.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub uuid: String,
    pub task_uuid: String,
    /// Per-task ordinal, starting at 1 and strictly monotonic.
    pub job_num: i32,
    /// Named worker queue the job is dispatched to.
    pub queue: String,
    pub status: SchedulerStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Fully-materialized arguments passed to the job function.
    pub job_args: Value,
    /// Latest progress checkpoint, written while the job runs.
    pub progress: Option<Value>,
    /// Captured log output, persisted on the terminal transition.
    pub logs: Option<String>,
    /// Opaque result summary on success.
    pub result: Option<Value>,
    /// Set when a cancellation was requested; the worker observes it at the
    /// next progress checkpoint.
    pub cancel_requested: bool,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
}

impl Job {
    pub fn new(
        task_uuid: &str,
        job_num: i32,
        queue: &str,
        job_args: Value,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            task_uuid: task_uuid.to_string(),
            job_num,
            queue: queue.to_string(),
            status: SchedulerStatus::Enqueued,
            scheduled_at,
            started_at: None,
            finished_at: None,
            job_args,
            progress: None,
            logs: None,
            result: None,
            cancel_requested: false,
            lease_expires_at: None,
            worker_id: None,
        }
    }

    /// Whether the job already reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the job is due to run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SchedulerStatus::Enqueued
            && self.scheduled_at.map(|at| at <= now).unwrap_or(true)
    }
}
