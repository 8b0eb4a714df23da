//! Durable storage of tasks and jobs.
//!
//! The [`TaskStore`] trait abstracts the persistence layer so the scheduler
//! and the workers can run against PostgreSQL in production and against an
//! in-memory store in tests. All state transitions are single-row,
//! conditional writes; the scheduler reads the latest job optimistically and
//! commits with a compare-and-set on the task status.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;

use super::error::SchedulerError;
use super::job::Job;
use super::task::{SchedulerStatus, Task};

/// Filter for task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub task_type: Option<String>,
    pub status: Option<SchedulerStatus>,
}

/// Acknowledgement returned for each progress checkpoint.
///
/// Carrying the cancellation flag back to the job lets a running job observe
/// `cancel_task` at its next checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct ProgressAck {
    pub cancel_requested: bool,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &Task) -> Result<(), SchedulerError>;
    async fn fetch_task(&self, uuid: &str) -> Result<Option<Task>, SchedulerError>;
    async fn save_task(&self, task: &Task) -> Result<(), SchedulerError>;
    /// Delete a task and, cascading, all of its jobs.
    async fn delete_task(&self, uuid: &str) -> Result<bool, SchedulerError>;
    /// Tasks matching the filter, ordered by creation time.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, SchedulerError>;
    /// Conditionally move a task to `to` if its status is one of `expected`.
    /// Returns whether the transition happened.
    async fn transition_task(
        &self,
        uuid: &str,
        expected: &[SchedulerStatus],
        to: SchedulerStatus,
    ) -> Result<bool, SchedulerError>;

    async fn insert_job(&self, job: &Job) -> Result<(), SchedulerError>;
    async fn fetch_job(&self, uuid: &str) -> Result<Option<Job>, SchedulerError>;
    async fn save_job(&self, job: &Job) -> Result<(), SchedulerError>;
    /// All jobs of a task, most recent first (greatest `job_num`).
    async fn jobs_for_task(&self, task_uuid: &str) -> Result<Vec<Job>, SchedulerError>;
    async fn latest_job(&self, task_uuid: &str) -> Result<Option<Job>, SchedulerError>;
    async fn last_completed_job(&self, task_uuid: &str) -> Result<Option<Job>, SchedulerError>;
    /// The `job_num` the task's next job must use.
    async fn next_job_num(&self, task_uuid: &str) -> Result<i32, SchedulerError>;

    /// Atomically claim due jobs from the given queues, moving them to
    /// RUNNING under a lease. Jobs whose lease expired are claimable again.
    async fn claim_due_jobs(
        &self,
        queues: &[String],
        worker_id: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, SchedulerError>;
    /// Extend the lease of a running job.
    async fn heartbeat_job(&self, uuid: &str, lease: Duration) -> Result<(), SchedulerError>;
    /// Store a progress checkpoint and report whether cancellation was
    /// requested meanwhile.
    async fn write_progress(
        &self,
        uuid: &str,
        progress: &Value,
    ) -> Result<ProgressAck, SchedulerError>;
    /// Best-effort cancellation: enqueued jobs are canceled outright,
    /// running jobs get the cancellation flag set.
    async fn request_cancel(&self, uuid: &str) -> Result<bool, SchedulerError>;
}

/// Write handle a running job uses to checkpoint its progress.
///
/// Write-only for the job; the scheduler and the API read the checkpoints
/// back from the store.
#[derive(Clone)]
pub struct ProgressHandle {
    store: Arc<dyn TaskStore>,
    job_uuid: String,
}

impl ProgressHandle {
    pub fn new(store: Arc<dyn TaskStore>, job_uuid: &str) -> Self {
        Self {
            store,
            job_uuid: job_uuid.to_string(),
        }
    }

    pub async fn checkpoint(&self, progress: &Value) -> Result<ProgressAck, SchedulerError> {
        self.store.write_progress(&self.job_uuid, progress).await
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    tasks: HashMap<String, Task>,
    jobs: HashMap<String, Job>,
}

/// In-memory task store with the same transition semantics as the
/// PostgreSQL one. Backs the unit and scenario tests.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert_task(&self, task: &Task) -> Result<(), SchedulerError> {
        self.write().tasks.insert(task.uuid.clone(), task.clone());
        Ok(())
    }

    async fn fetch_task(&self, uuid: &str) -> Result<Option<Task>, SchedulerError> {
        Ok(self.read().tasks.get(uuid).cloned())
    }

    async fn save_task(&self, task: &Task) -> Result<(), SchedulerError> {
        let mut inner = self.write();
        let mut task = task.clone();
        task.updated_at = Utc::now();
        inner.tasks.insert(task.uuid.clone(), task);
        Ok(())
    }

    async fn delete_task(&self, uuid: &str) -> Result<bool, SchedulerError> {
        let mut inner = self.write();
        let removed = inner.tasks.remove(uuid).is_some();
        if removed {
            inner.jobs.retain(|_, job| job.task_uuid != uuid);
        }
        Ok(removed)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, SchedulerError> {
        let inner = self.read();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| {
                filter
                    .task_type
                    .as_deref()
                    .map(|ty| t.task_type() == ty)
                    .unwrap_or(true)
                    && filter.status.map(|s| t.status == s).unwrap_or(true)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.uuid.cmp(&b.uuid)));
        Ok(tasks)
    }

    async fn transition_task(
        &self,
        uuid: &str,
        expected: &[SchedulerStatus],
        to: SchedulerStatus,
    ) -> Result<bool, SchedulerError> {
        let mut inner = self.write();
        match inner.tasks.get_mut(uuid) {
            Some(task) if expected.contains(&task.status) => {
                task.status = to;
                task.updated_at = Utc::now();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(SchedulerError::task_not_found(uuid)),
        }
    }

    async fn insert_job(&self, job: &Job) -> Result<(), SchedulerError> {
        self.write().jobs.insert(job.uuid.clone(), job.clone());
        Ok(())
    }

    async fn fetch_job(&self, uuid: &str) -> Result<Option<Job>, SchedulerError> {
        Ok(self.read().jobs.get(uuid).cloned())
    }

    async fn save_job(&self, job: &Job) -> Result<(), SchedulerError> {
        self.write().jobs.insert(job.uuid.clone(), job.clone());
        Ok(())
    }

    async fn jobs_for_task(&self, task_uuid: &str) -> Result<Vec<Job>, SchedulerError> {
        let inner = self.read();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.task_uuid == task_uuid)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.job_num.cmp(&a.job_num));
        Ok(jobs)
    }

    async fn latest_job(&self, task_uuid: &str) -> Result<Option<Job>, SchedulerError> {
        Ok(self.jobs_for_task(task_uuid).await?.into_iter().next())
    }

    async fn last_completed_job(&self, task_uuid: &str) -> Result<Option<Job>, SchedulerError> {
        Ok(self
            .jobs_for_task(task_uuid)
            .await?
            .into_iter()
            .find(|j| j.status == SchedulerStatus::Completed))
    }

    async fn next_job_num(&self, task_uuid: &str) -> Result<i32, SchedulerError> {
        let inner = self.read();
        let max = inner
            .jobs
            .values()
            .filter(|j| j.task_uuid == task_uuid)
            .map(|j| j.job_num)
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    async fn claim_due_jobs(
        &self,
        queues: &[String],
        worker_id: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, SchedulerError> {
        let now = Utc::now();
        let mut inner = self.write();

        let mut due: Vec<String> = inner
            .jobs
            .values()
            .filter(|j| queues.contains(&j.queue))
            .filter(|j| {
                j.is_due(now)
                    || (j.status == SchedulerStatus::Running
                        && j.lease_expires_at.map(|at| at < now).unwrap_or(false))
            })
            .map(|j| j.uuid.clone())
            .collect();
        due.sort_by_key(|uuid| inner.jobs[uuid].scheduled_at);
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for uuid in due {
            if let Some(job) = inner.jobs.get_mut(&uuid) {
                job.status = SchedulerStatus::Running;
                job.started_at.get_or_insert(now);
                job.lease_expires_at =
                    Some(now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero()));
                job.worker_id = Some(worker_id.to_string());
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn heartbeat_job(&self, uuid: &str, lease: Duration) -> Result<(), SchedulerError> {
        let mut inner = self.write();
        if let Some(job) = inner.jobs.get_mut(uuid) {
            if job.status == SchedulerStatus::Running {
                job.lease_expires_at =
                    Some(Utc::now()
                        + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero()));
            }
        }
        Ok(())
    }

    async fn write_progress(
        &self,
        uuid: &str,
        progress: &Value,
    ) -> Result<ProgressAck, SchedulerError> {
        let mut inner = self.write();
        match inner.jobs.get_mut(uuid) {
            Some(job) => {
                job.progress = Some(progress.clone());
                Ok(ProgressAck {
                    cancel_requested: job.cancel_requested,
                })
            }
            None => Err(SchedulerError::job_not_found(uuid)),
        }
    }

    async fn request_cancel(&self, uuid: &str) -> Result<bool, SchedulerError> {
        let mut inner = self.write();
        match inner.jobs.get_mut(uuid) {
            Some(job) => {
                match job.status {
                    SchedulerStatus::Enqueued => {
                        job.status = SchedulerStatus::Canceled;
                        job.finished_at = Some(Utc::now());
                    }
                    SchedulerStatus::Running => {
                        job.cancel_requested = true;
                    }
                    _ => {}
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ============================================================================
// PostgreSQL store
// ============================================================================

const TASK_COLUMNS: &str = "uuid, status, runs, failures, last_run, scheduled_at, job_interval, \
                            job_max_retries, burst, task_args, details, created_at, updated_at";

const JOB_COLUMNS: &str = "uuid, task_uuid, job_num, queue, status, scheduled_at, started_at, \
                           finished_at, job_args, progress, logs, result, cancel_requested, \
                           lease_expires_at, worker_id";

/// PostgreSQL-backed task store.
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert_task(&self, task: &Task) -> Result<(), SchedulerError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                uuid, task_type, status, runs, failures, last_run, scheduled_at,
                job_interval, job_max_retries, burst, task_args, details,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&task.uuid)
        .bind(task.task_type())
        .bind(task.status)
        .bind(task.runs)
        .bind(task.failures)
        .bind(task.last_run)
        .bind(task.scheduled_at)
        .bind(task.job_interval)
        .bind(task.job_max_retries)
        .bind(task.burst)
        .bind(&task.task_args)
        .bind(sqlx::types::Json(&task.details))
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_task(&self, uuid: &str) -> Result<Option<Task>, SchedulerError> {
        let task = sqlx::query_as::<_, Task>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE uuid = $1"
        ))
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(task)
    }

    async fn save_task(&self, task: &Task) -> Result<(), SchedulerError> {
        sqlx::query(
            r#"
            UPDATE tasks SET
                status = $2, runs = $3, failures = $4, last_run = $5,
                scheduled_at = $6, job_interval = $7, job_max_retries = $8,
                burst = $9, task_args = $10, details = $11, updated_at = NOW()
            WHERE uuid = $1
            "#,
        )
        .bind(&task.uuid)
        .bind(task.status)
        .bind(task.runs)
        .bind(task.failures)
        .bind(task.last_run)
        .bind(task.scheduled_at)
        .bind(task.job_interval)
        .bind(task.job_max_retries)
        .bind(task.burst)
        .bind(&task.task_args)
        .bind(sqlx::types::Json(&task.details))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_task(&self, uuid: &str) -> Result<bool, SchedulerError> {
        // Jobs go with the task via ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM tasks WHERE uuid = $1")
            .bind(uuid)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, SchedulerError> {
        let tasks = sqlx::query_as::<_, Task>(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks
            WHERE ($1::text IS NULL OR task_type = $1)
              AND ($2::text IS NULL OR status = $2::scheduler_status)
            ORDER BY created_at, uuid
            "#
        ))
        .bind(filter.task_type.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        Ok(tasks)
    }

    async fn transition_task(
        &self,
        uuid: &str,
        expected: &[SchedulerStatus],
        to: SchedulerStatus,
    ) -> Result<bool, SchedulerError> {
        let expected: Vec<String> = expected.iter().map(|s| s.as_str().to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2, updated_at = NOW()
            WHERE uuid = $1 AND status = ANY($3::scheduler_status[])
            "#,
        )
        .bind(uuid)
        .bind(to)
        .bind(&expected)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // Distinguish a lost compare-and-set from a missing task.
        match self.fetch_task(uuid).await? {
            Some(_) => Ok(false),
            None => Err(SchedulerError::task_not_found(uuid)),
        }
    }

    async fn insert_job(&self, job: &Job) -> Result<(), SchedulerError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                uuid, task_uuid, job_num, queue, status, scheduled_at, started_at,
                finished_at, job_args, progress, logs, result, cancel_requested,
                lease_expires_at, worker_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(&job.uuid)
        .bind(&job.task_uuid)
        .bind(job.job_num)
        .bind(&job.queue)
        .bind(job.status)
        .bind(job.scheduled_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.job_args)
        .bind(&job.progress)
        .bind(&job.logs)
        .bind(&job.result)
        .bind(job.cancel_requested)
        .bind(job.lease_expires_at)
        .bind(&job.worker_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_job(&self, uuid: &str) -> Result<Option<Job>, SchedulerError> {
        let job =
            sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE uuid = $1"))
                .bind(uuid)
                .fetch_optional(&self.pool)
                .await?;

        Ok(job)
    }

    async fn save_job(&self, job: &Job) -> Result<(), SchedulerError> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2, scheduled_at = $3, started_at = $4, finished_at = $5,
                job_args = $6, progress = $7, logs = $8, result = $9,
                cancel_requested = $10, lease_expires_at = $11, worker_id = $12
            WHERE uuid = $1
            "#,
        )
        .bind(&job.uuid)
        .bind(job.status)
        .bind(job.scheduled_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.job_args)
        .bind(&job.progress)
        .bind(&job.logs)
        .bind(&job.result)
        .bind(job.cancel_requested)
        .bind(job.lease_expires_at)
        .bind(&job.worker_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn jobs_for_task(&self, task_uuid: &str) -> Result<Vec<Job>, SchedulerError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE task_uuid = $1 ORDER BY job_num DESC"
        ))
        .bind(task_uuid)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn latest_job(&self, task_uuid: &str) -> Result<Option<Job>, SchedulerError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE task_uuid = $1 ORDER BY job_num DESC LIMIT 1"
        ))
        .bind(task_uuid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn last_completed_job(&self, task_uuid: &str) -> Result<Option<Job>, SchedulerError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE task_uuid = $1 AND status = 'completed'
            ORDER BY job_num DESC
            LIMIT 1
            "#
        ))
        .bind(task_uuid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn next_job_num(&self, task_uuid: &str) -> Result<i32, SchedulerError> {
        let max: Option<i32> =
            sqlx::query_scalar("SELECT MAX(job_num) FROM jobs WHERE task_uuid = $1")
                .bind(task_uuid)
                .fetch_one(&self.pool)
                .await?;

        Ok(max.unwrap_or(0) + 1)
    }

    async fn claim_due_jobs(
        &self,
        queues: &[String],
        worker_id: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<Job>, SchedulerError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH due AS (
                SELECT uuid
                FROM jobs
                WHERE queue = ANY($1)
                  AND (
                      (status = 'enqueued' AND (scheduled_at IS NULL OR scheduled_at <= NOW()))
                      OR (status = 'running' AND lease_expires_at < NOW())
                  )
                ORDER BY scheduled_at NULLS FIRST
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                started_at = COALESCE(started_at, NOW()),
                lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                worker_id = $4
            WHERE uuid IN (SELECT uuid FROM due)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(queues)
        .bind(limit as i64)
        .bind(lease.as_millis().to_string())
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn heartbeat_job(&self, uuid: &str, lease: Duration) -> Result<(), SchedulerError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = NOW() + ($2 || ' milliseconds')::INTERVAL
            WHERE uuid = $1 AND status = 'running'
            "#,
        )
        .bind(uuid)
        .bind(lease.as_millis().to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn write_progress(
        &self,
        uuid: &str,
        progress: &Value,
    ) -> Result<ProgressAck, SchedulerError> {
        let cancel_requested: Option<bool> = sqlx::query_scalar(
            "UPDATE jobs SET progress = $2 WHERE uuid = $1 RETURNING cancel_requested",
        )
        .bind(uuid)
        .bind(progress)
        .fetch_optional(&self.pool)
        .await?;

        match cancel_requested {
            Some(cancel_requested) => Ok(ProgressAck { cancel_requested }),
            None => Err(SchedulerError::job_not_found(uuid)),
        }
    }

    async fn request_cancel(&self, uuid: &str) -> Result<bool, SchedulerError> {
        let canceled = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'canceled', finished_at = NOW()
            WHERE uuid = $1 AND status = 'enqueued'
            "#,
        )
        .bind(uuid)
        .execute(&self.pool)
        .await?;

        if canceled.rows_affected() > 0 {
            return Ok(true);
        }

        let flagged = sqlx::query(
            "UPDATE jobs SET cancel_requested = TRUE WHERE uuid = $1 AND status = 'running'",
        )
        .bind(uuid)
        .execute(&self.pool)
        .await?;

        if flagged.rows_affected() > 0 {
            return Ok(true);
        }

        Ok(sqlx::query("SELECT 1 FROM jobs WHERE uuid = $1")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?
            .is_some())
    }
}
