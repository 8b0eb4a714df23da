//! Job worker.
//!
//! A long-running service that claims due jobs from its queues, executes the
//! registered job function, heartbeats the job lease while it runs and
//! routes the outcome into the scheduler callbacks. Multiple workers run
//! concurrently; the store's atomic claim keeps each job on exactly one of
//! them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::JobError;
use super::job::Job;
use super::registry::{JobContext, JobLogBuffer, SchedulerServices};
use super::runner::LiveLogRegistry;
use super::scheduler::Scheduler;
use super::store::{ProgressHandle, TaskStore};
use super::task::SchedulerStatus;

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Queues this worker pulls from.
    pub queues: Vec<String>,
    /// Maximum number of jobs to claim at once.
    pub batch_size: usize,
    /// How long to wait when no jobs are available.
    pub poll_interval: Duration,
    /// How often to extend the lease of running jobs.
    pub heartbeat_interval: Duration,
    /// Lease granted on claim; an expired lease makes the job claimable
    /// again.
    pub lease: Duration,
    /// Hard per-job execution timeout.
    pub job_timeout: Duration,
    /// Worker ID for this instance.
    pub worker_id: String,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            lease: Duration::from_secs(60),
            job_timeout: Duration::from_secs(3600),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl JobWorkerConfig {
    pub fn for_queues(queues: Vec<String>) -> Self {
        Self {
            queues,
            ..Default::default()
        }
    }
}

/// Worker that executes jobs claimed from the store.
pub struct JobWorker {
    scheduler: Arc<Scheduler>,
    services: Arc<SchedulerServices>,
    live_logs: LiveLogRegistry,
    config: JobWorkerConfig,
}

impl JobWorker {
    pub fn new(
        scheduler: Arc<Scheduler>,
        services: Arc<SchedulerServices>,
        live_logs: LiveLogRegistry,
        config: JobWorkerConfig,
    ) -> Self {
        Self {
            scheduler,
            services,
            live_logs,
            config,
        }
    }

    /// Run until the token is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            queues = ?self.config.queues,
            batch_size = self.config.batch_size,
            "job worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.claim_and_process().await {
                Ok(0) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Ok(count) => {
                    debug!(count, "processed jobs");
                }
                Err(e) => {
                    error!(error = %e, "failed to claim jobs");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "job worker stopped");
        Ok(())
    }

    /// Claim due jobs once and run them to completion.
    ///
    /// Returns the number of jobs processed. Used by the main loop and
    /// directly by tests that drive the worker turn by turn.
    pub async fn claim_and_process(&self) -> Result<usize> {
        let jobs = self
            .scheduler
            .store()
            .claim_due_jobs(
                &self.config.queues,
                &self.config.worker_id,
                self.config.lease,
                self.config.batch_size,
            )
            .await?;

        let count = jobs.len();
        futures::future::join_all(jobs.into_iter().map(|job| self.process_job(job))).await;
        Ok(count)
    }

    async fn process_job(&self, job: Job) {
        let job_uuid = job.uuid.clone();
        let task_uuid = job.task_uuid.clone();

        debug!(job = %job_uuid, task = %task_uuid, queue = %job.queue, "executing job");

        // The owning task follows its job into RUNNING; a lost
        // compare-and-set here means the task was canceled meanwhile.
        if let Err(e) = self
            .scheduler
            .store()
            .transition_task(
                &task_uuid,
                &[SchedulerStatus::Enqueued, SchedulerStatus::Recovery],
                SchedulerStatus::Running,
            )
            .await
        {
            error!(job = %job_uuid, task = %task_uuid, error = %e, "task lookup failed");
            return;
        }

        let logs = JobLogBuffer::new();
        self.live_logs.register(&job_uuid, logs.clone());

        let descriptor = match self.scheduler.registry().lookup(self.task_type(&job).await) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                error!(job = %job_uuid, error = %e, "no descriptor for claimed job");
                let _ = self
                    .scheduler
                    .on_job_failure(&job_uuid, &e.to_string(), logs.snapshot())
                    .await;
                self.live_logs.unregister(&job_uuid);
                return;
            }
        };

        let ctx = JobContext {
            job: job.clone(),
            progress: ProgressHandle::new(self.scheduler.store().clone(), &job_uuid),
            logs: logs.clone(),
            services: self.services.clone(),
        };

        let result = self.execute_with_heartbeat(&job_uuid, descriptor.run(ctx)).await;

        match result {
            Ok(Ok(outcome)) => {
                if let Err(e) = self
                    .scheduler
                    .on_job_success(&job_uuid, outcome, logs.snapshot())
                    .await
                {
                    error!(job = %job_uuid, error = %e, "success callback failed");
                }
            }
            Ok(Err(JobError::Canceled)) => {
                if let Err(e) = self
                    .scheduler
                    .on_job_canceled(&job_uuid, logs.snapshot())
                    .await
                {
                    error!(job = %job_uuid, error = %e, "cancel callback failed");
                }
            }
            Ok(Err(e)) => {
                warn!(job = %job_uuid, error = %e, "job failed");
                if let Err(e) = self
                    .scheduler
                    .on_job_failure(&job_uuid, &e.to_string(), logs.snapshot())
                    .await
                {
                    error!(job = %job_uuid, error = %e, "failure callback failed");
                }
            }
            Err(_elapsed) => {
                warn!(job = %job_uuid, timeout = ?self.config.job_timeout, "job timed out");
                if let Err(e) = self
                    .scheduler
                    .on_job_failure(&job_uuid, "job execution timed out", logs.snapshot())
                    .await
                {
                    error!(job = %job_uuid, error = %e, "failure callback failed");
                }
            }
        }

        self.live_logs.unregister(&job_uuid);
    }

    async fn task_type(&self, job: &Job) -> &'static str {
        // The task row is authoritative for the type tag; claimed jobs whose
        // task vanished fall through to the registry lookup error path.
        match self.scheduler.store().fetch_task(&job.task_uuid).await {
            Ok(Some(task)) => task.task_type(),
            _ => "",
        }
    }

    /// Drive the job future while periodically extending its lease.
    async fn execute_with_heartbeat<F, T>(
        &self,
        job_uuid: &str,
        job_future: F,
    ) -> Result<T, tokio::time::error::Elapsed>
    where
        F: std::future::Future<Output = T>,
    {
        let heartbeat_cancel = CancellationToken::new();
        let heartbeat_guard = heartbeat_cancel.clone();
        let store = self.scheduler.store().clone();
        let lease = self.config.lease;
        let heartbeat_interval = self.config.heartbeat_interval;
        let uuid = job_uuid.to_string();

        let heartbeat_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = heartbeat_guard.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = store.heartbeat_job(&uuid, lease).await {
                            warn!(job = %uuid, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        });

        let result = tokio::time::timeout(self.config.job_timeout, job_future).await;

        heartbeat_cancel.cancel();
        let _ = heartbeat_handle.await;

        result
    }
}
