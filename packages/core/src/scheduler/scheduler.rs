//! Task lifecycle coordination.
//!
//! The scheduler owns the task state machine:
//!
//! - `schedule_task` creates a task and submits its first job;
//! - `reschedule_task` re-enqueues a terminal or pending task;
//! - `cancel_task` cancels the task and best-effort cancels its running job;
//! - the success/failure callbacks run inside the worker that executed the
//!   job and decide whether to reschedule, retry in recovery mode, or stop.
//!
//! The arguments of each new job are derived from the task status at enqueue
//! time: NEW tasks start from the initial arguments, COMPLETED tasks resume
//! from the last run's high-water mark, RECOVERY tasks restart from the last
//! checkpoint, CANCELED tasks reuse the canceled job's arguments verbatim.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::{info, warn};
use typed_builder::TypedBuilder;

use crate::config::Config;

use super::error::SchedulerError;
use super::job::Job;
use super::registry::{JobOutcome, PrepareContext, TaskRegistry, TaskTypeDescriptor};
use super::runner::{EnqueueOptions, JobRunner};
use super::store::TaskStore;
use super::task::{SchedulerStatus, Task, TaskDetails};

/// Parameters for creating a task.
#[derive(Debug, Clone, TypedBuilder)]
pub struct NewTask {
    pub task_args: Value,
    /// Seconds between runs; 0 means run once.
    #[builder(default = 86400)]
    pub job_interval: i64,
    #[builder(default = 3)]
    pub job_max_retries: i32,
    #[builder(default)]
    pub burst: bool,
    /// Type-specific fields, validated by the task type's factory.
    #[builder(default = serde_json::json!({}))]
    pub type_fields: Value,
}

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    runner: Arc<dyn JobRunner>,
    config: Config,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskRegistry>,
        runner: Arc<dyn JobRunner>,
        config: Config,
    ) -> Self {
        Self {
            store,
            registry,
            runner,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn runner(&self) -> &Arc<dyn JobRunner> {
        &self.runner
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create a task and submit its first job.
    pub async fn schedule_task(
        &self,
        task_type: &str,
        new: NewTask,
    ) -> Result<Task, SchedulerError> {
        let descriptor = self.registry.lookup(task_type)?;

        if new.job_interval < 0 {
            return Err(SchedulerError::Validation(
                "job_interval must be non-negative".to_string(),
            ));
        }
        if new.job_max_retries < 0 {
            return Err(SchedulerError::Validation(
                "job_max_retries must be non-negative".to_string(),
            ));
        }

        let details = descriptor.create_details(&new.type_fields)?;
        let mut task = Task::new(
            details,
            new.task_args,
            new.job_interval,
            new.job_max_retries,
            new.burst,
        );
        self.store.insert_task(&task).await?;

        self.enqueue_job(&mut task, &descriptor, None).await?;

        info!(task = %task.uuid, task_type, "task scheduled");
        Ok(task)
    }

    /// Re-enqueue a task.
    ///
    /// No-op for RUNNING tasks. Terminal and pending tasks get a new job
    /// whose arguments follow the status-specific strategy; rescheduling a
    /// FAILED task resets its failure count and starts over.
    pub async fn reschedule_task(&self, uuid: &str) -> Result<(), SchedulerError> {
        let mut task = self
            .store
            .fetch_task(uuid)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(uuid))?;
        let descriptor = self.registry.lookup(task.task_type())?;

        match task.status {
            SchedulerStatus::Running => {
                info!(task = %task.uuid, "task already running; reschedule ignored");
                Ok(())
            }
            SchedulerStatus::Enqueued => {
                // Supersede the pending job so the task never has two
                // non-terminal jobs.
                if let Some(latest) = self.store.latest_job(&task.uuid).await? {
                    if !latest.is_terminal() {
                        self.runner.cancel(&latest.queue, &latest.uuid).await?;
                    }
                }
                self.enqueue_job(&mut task, &descriptor, None).await?;
                Ok(())
            }
            SchedulerStatus::Failed => {
                task.failures = 0;
                self.enqueue_job(&mut task, &descriptor, None).await?;
                Ok(())
            }
            _ => {
                self.enqueue_job(&mut task, &descriptor, None).await?;
                Ok(())
            }
        }
    }

    /// Cancel a task and best-effort cancel its in-flight job.
    ///
    /// Progress of the canceled job is preserved; a later reschedule resumes
    /// from the same job arguments.
    pub async fn cancel_task(&self, uuid: &str) -> Result<(), SchedulerError> {
        let task = self
            .store
            .fetch_task(uuid)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(uuid))?;

        self.store
            .transition_task(
                uuid,
                &[
                    SchedulerStatus::New,
                    SchedulerStatus::Enqueued,
                    SchedulerStatus::Running,
                    SchedulerStatus::Completed,
                    SchedulerStatus::Failed,
                    SchedulerStatus::Recovery,
                    SchedulerStatus::Paused,
                ],
                SchedulerStatus::Canceled,
            )
            .await?;

        if let Some(latest) = self.store.latest_job(&task.uuid).await? {
            if !latest.is_terminal() {
                self.runner.cancel(&latest.queue, &latest.uuid).await?;
            }
        }

        info!(task = %task.uuid, "task canceled");
        Ok(())
    }

    /// Success callback, invoked by the worker after the job function
    /// returned.
    pub async fn on_job_success(
        &self,
        job_uuid: &str,
        outcome: JobOutcome,
        logs: String,
    ) -> Result<(), SchedulerError> {
        let mut job = self
            .store
            .fetch_job(job_uuid)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(job_uuid))?;
        let mut task = self
            .store
            .fetch_task(&job.task_uuid)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(&job.task_uuid))?;
        let descriptor = self.registry.lookup(task.task_type())?;

        let now = Utc::now();
        job.status = SchedulerStatus::Completed;
        job.finished_at = Some(now);
        job.result = Some(outcome.result);
        if outcome.progress.is_some() {
            job.progress = outcome.progress;
        }
        job.logs = Some(logs);
        self.store.save_job(&job).await?;

        task.runs += 1;
        task.failures = 0;
        task.last_run = Some(now);
        task.status = SchedulerStatus::Completed;

        if task.burst || task.job_interval == 0 {
            task.scheduled_at = None;
            self.store.save_task(&task).await?;
            info!(task = %task.uuid, job = %job.uuid, "burst task completed");
            return Ok(());
        }

        let next_run = now + Duration::seconds(task.job_interval);
        self.enqueue_job(&mut task, &descriptor, Some(next_run))
            .await?;
        info!(task = %task.uuid, job = %job.uuid, next_run = %next_run, "task rescheduled");
        Ok(())
    }

    /// Failure callback, invoked by the worker when the job function failed.
    ///
    /// While the retry budget lasts, a recovery job is enqueued immediately
    /// with arguments derived from the last checkpoint.
    pub async fn on_job_failure(
        &self,
        job_uuid: &str,
        error: &str,
        logs: String,
    ) -> Result<(), SchedulerError> {
        let mut job = self
            .store
            .fetch_job(job_uuid)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(job_uuid))?;
        let mut task = self
            .store
            .fetch_task(&job.task_uuid)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(&job.task_uuid))?;
        let descriptor = self.registry.lookup(task.task_type())?;

        let now = Utc::now();
        job.status = SchedulerStatus::Failed;
        job.finished_at = Some(now);
        job.logs = Some(logs);
        self.store.save_job(&job).await?;

        task.runs += 1;
        task.failures += 1;
        task.last_run = Some(now);

        if !descriptor.can_be_retried() || task.failures > task.job_max_retries {
            task.status = SchedulerStatus::Failed;
            task.scheduled_at = None;
            self.store.save_task(&task).await?;
            warn!(task = %task.uuid, job = %job.uuid, failures = task.failures, error,
                  "task failed; retry budget exhausted");
            return Ok(());
        }

        task.status = SchedulerStatus::Recovery;
        self.enqueue_job(&mut task, &descriptor, None).await?;
        warn!(task = %task.uuid, job = %job.uuid, failures = task.failures, error,
              "job failed; recovery run enqueued");
        Ok(())
    }

    /// Terminal transition for a job that observed its cancellation.
    pub async fn on_job_canceled(&self, job_uuid: &str, logs: String) -> Result<(), SchedulerError> {
        let mut job = self
            .store
            .fetch_job(job_uuid)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(job_uuid))?;

        job.status = SchedulerStatus::Canceled;
        job.finished_at = Some(Utc::now());
        job.logs = Some(logs);
        self.store.save_job(&job).await?;

        info!(job = %job.uuid, task = %job.task_uuid, "job canceled");
        Ok(())
    }

    /// Create and submit the task's next job.
    ///
    /// The argument-generation strategy is picked from the task status at
    /// call time; the caller sets the status before enqueueing.
    async fn enqueue_job(
        &self,
        task: &mut Task,
        descriptor: &TaskTypeDescriptor,
        scheduled_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<Job, SchedulerError> {
        let latest_job = self.store.latest_job(&task.uuid).await?;
        if let Some(latest) = &latest_job {
            if !latest.is_terminal() {
                return Err(SchedulerError::Validation(format!(
                    "task {} already has an active job",
                    task.uuid
                )));
            }
        }

        let prepare_ctx = PrepareContext {
            latest_job,
            last_completed_job: self.store.last_completed_job(&task.uuid).await?,
        };
        let job_args = descriptor.prepare_job_args(task, &prepare_ctx, &self.config)?;

        let job_num = self.store.next_job_num(&task.uuid).await?;
        let scheduled_at = scheduled_at.unwrap_or_else(Utc::now);
        let job = Job::new(
            &task.uuid,
            job_num,
            descriptor.default_queue(),
            job_args,
            Some(scheduled_at),
        );
        self.store.insert_job(&job).await?;

        self.runner
            .enqueue(
                &job,
                &EnqueueOptions {
                    job_timeout: StdDuration::from_secs(self.config.job_timeout),
                    max_retries: task.job_max_retries,
                },
            )
            .await?;

        task.status = SchedulerStatus::Enqueued;
        task.scheduled_at = Some(scheduled_at);
        self.store.save_task(task).await?;

        Ok(job)
    }

    /// Resolve a task and its details for read paths.
    pub async fn get_task(&self, uuid: &str) -> Result<Task, SchedulerError> {
        self.store
            .fetch_task(uuid)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(uuid))
    }

    /// Delete a task; its jobs go with it.
    pub async fn delete_task(&self, uuid: &str) -> Result<(), SchedulerError> {
        if let Some(latest) = self.store.latest_job(uuid).await? {
            if !latest.is_terminal() {
                self.runner.cancel(&latest.queue, &latest.uuid).await?;
            }
        }
        if !self.store.delete_task(uuid).await? {
            return Err(SchedulerError::task_not_found(uuid));
        }
        Ok(())
    }
}

/// Details helper used by task-type factories: parse the request fields into
/// the expected variant, tagging them first.
pub fn details_from_fields(tag: &str, fields: &Value) -> Result<TaskDetails, SchedulerError> {
    let mut object = fields.as_object().cloned().unwrap_or_default();
    object.insert(
        "task_type".to_string(),
        Value::String(tag.to_string()),
    );
    serde_json::from_value(Value::Object(object))
        .map_err(|e| SchedulerError::Validation(e.to_string()))
}
