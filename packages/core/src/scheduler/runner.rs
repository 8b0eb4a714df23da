//! Job runner contract.
//!
//! The scheduler talks to the worker queue through the [`JobRunner`] trait:
//! submission of jobs to named queues, live views of running jobs and
//! best-effort cancellation. The queue guarantees that exactly one of the
//! success/failure callbacks fires (at least once) per submitted job.
//!
//! [`QueueJobRunner`] is the store-backed implementation: the persisted job
//! row is the queue entry, workers claim due rows per queue, and cancellation
//! is a durable flag the running worker observes at its next progress
//! checkpoint.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::error::SchedulerError;
use super::job::Job;
use super::registry::JobLogBuffer;
use super::store::TaskStore;
use super::task::SchedulerStatus;

/// Submission options forwarded to the queue.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Hard execution timeout for the job.
    pub job_timeout: Duration,
    /// Retry budget of the owning task, for queue-level accounting.
    pub max_retries: i32,
}

/// Live view of a job as seen through the runner.
#[derive(Debug, Clone, Serialize)]
pub struct RunningJobView {
    pub status: SchedulerStatus,
    pub progress: Option<Value>,
    pub logs: Option<String>,
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Submit a job to its queue.
    async fn enqueue(&self, job: &Job, options: &EnqueueOptions) -> Result<(), SchedulerError>;

    /// Fetch the live status, progress and logs of a job.
    async fn fetch(&self, queue: &str, job_uuid: &str) -> Result<RunningJobView, SchedulerError>;

    /// Best-effort, idempotent cancellation.
    async fn cancel(&self, queue: &str, job_uuid: &str) -> Result<(), SchedulerError>;
}

/// Log buffers of the jobs currently running in this process.
///
/// Lets the runner serve live logs while the persisted row still has none.
#[derive(Clone, Default)]
pub struct LiveLogRegistry {
    inner: Arc<RwLock<HashMap<String, JobLogBuffer>>>,
}

impl LiveLogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_uuid: &str, logs: JobLogBuffer) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_uuid.to_string(), logs);
    }

    pub fn unregister(&self, job_uuid: &str) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_uuid);
    }

    pub fn snapshot(&self, job_uuid: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_uuid)
            .map(|logs| logs.snapshot())
    }
}

/// Store-backed runner: the job table is the queue.
pub struct QueueJobRunner {
    store: Arc<dyn TaskStore>,
    live_logs: LiveLogRegistry,
}

impl QueueJobRunner {
    pub fn new(store: Arc<dyn TaskStore>, live_logs: LiveLogRegistry) -> Self {
        Self { store, live_logs }
    }

    pub fn live_logs(&self) -> &LiveLogRegistry {
        &self.live_logs
    }
}

#[async_trait]
impl JobRunner for QueueJobRunner {
    async fn enqueue(&self, job: &Job, _options: &EnqueueOptions) -> Result<(), SchedulerError> {
        // The persisted row is the queue entry; workers polling the queue
        // will claim it once it is due. Submission only verifies the row
        // landed.
        match self.store.fetch_job(&job.uuid).await? {
            Some(_) => Ok(()),
            None => Err(SchedulerError::TransientRunner(format!(
                "job {} was not persisted before submission",
                job.uuid
            ))),
        }
    }

    async fn fetch(&self, _queue: &str, job_uuid: &str) -> Result<RunningJobView, SchedulerError> {
        let job = self
            .store
            .fetch_job(job_uuid)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(job_uuid))?;

        let logs = match job.status {
            SchedulerStatus::Running => self.live_logs.snapshot(job_uuid).or(job.logs),
            _ => job.logs,
        };

        Ok(RunningJobView {
            status: job.status,
            progress: job.progress,
            logs,
        })
    }

    async fn cancel(&self, _queue: &str, job_uuid: &str) -> Result<(), SchedulerError> {
        self.store.request_cancel(job_uuid).await?;
        Ok(())
    }
}
