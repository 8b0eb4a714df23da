//! Task-type registry.
//!
//! The registry maps task-type tags (e.g., "eventizer") to descriptors
//! bundling everything the scheduler needs to run that type of task:
//! a factory validating the type-specific fields, the job-argument
//! preparation hook, the job function itself and the dispatch defaults.
//!
//! Task types are registered once at process start; registering the same tag
//! twice is a conflict. Lookups after init are read-only.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::config::Config;
use crate::eventizer::backends::BackendRegistry;
use crate::stream::EventStream;

use super::error::{JobError, SchedulerError};
use super::job::Job;
use super::store::ProgressHandle;
use super::task::TaskDetails;
use super::tasks::identities::{IdentityService, ImporterRegistry};
use super::Task;

/// Shared collaborators handed to every job function.
pub struct SchedulerServices {
    pub config: Config,
    pub stream: Arc<dyn EventStream>,
    pub backends: Arc<BackendRegistry>,
    pub identities: Arc<dyn IdentityService>,
    pub importers: Arc<ImporterRegistry>,
}

/// Log sink for a running job.
///
/// The worker hands one buffer per run to the job function; the content is
/// persisted with the job on its terminal transition and exposed live while
/// the job runs.
#[derive(Clone, Default)]
pub struct JobLogBuffer {
    inner: Arc<Mutex<String>>,
}

impl JobLogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, line: &str) {
        let mut logs = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        logs.push_str(line);
        logs.push('\n');
    }

    pub fn snapshot(&self) -> String {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Everything a job function gets to work with.
pub struct JobContext {
    pub job: Job,
    pub progress: ProgressHandle,
    pub logs: JobLogBuffer,
    pub services: Arc<SchedulerServices>,
}

/// What a job function returns on success.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Opaque summary stored on the job row.
    pub result: Value,
    /// Final progress document, if the task type tracks progress.
    pub progress: Option<Value>,
}

/// Inputs available while preparing the arguments for a new job.
#[derive(Debug, Clone, Default)]
pub struct PrepareContext {
    /// The task's most recent job (greatest `job_num`), if any.
    pub latest_job: Option<Job>,
    /// The task's most recent successfully completed job, if any.
    pub last_completed_job: Option<Job>,
}

type BoxedFactory = Box<dyn Fn(&Value) -> Result<TaskDetails, SchedulerError> + Send + Sync>;
type BoxedPrepare =
    Box<dyn Fn(&Task, &PrepareContext, &Config) -> Result<Value, SchedulerError> + Send + Sync>;
type BoxedJobFn = Box<
    dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = Result<JobOutcome, JobError>> + Send>>
        + Send
        + Sync,
>;

/// Descriptor of a registered task type.
pub struct TaskTypeDescriptor {
    tag: &'static str,
    default_queue: String,
    can_be_retried: bool,
    factory: BoxedFactory,
    prepare: BoxedPrepare,
    job_fn: BoxedJobFn,
}

impl std::fmt::Debug for TaskTypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTypeDescriptor")
            .field("tag", &self.tag)
            .field("default_queue", &self.default_queue)
            .field("can_be_retried", &self.can_be_retried)
            .finish_non_exhaustive()
    }
}

impl TaskTypeDescriptor {
    pub fn new<F, P, J, Fut>(
        tag: &'static str,
        default_queue: impl Into<String>,
        can_be_retried: bool,
        factory: F,
        prepare: P,
        job_fn: J,
    ) -> Self
    where
        F: Fn(&Value) -> Result<TaskDetails, SchedulerError> + Send + Sync + 'static,
        P: Fn(&Task, &PrepareContext, &Config) -> Result<Value, SchedulerError>
            + Send
            + Sync
            + 'static,
        J: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JobOutcome, JobError>> + Send + 'static,
    {
        Self {
            tag,
            default_queue: default_queue.into(),
            can_be_retried,
            factory: Box::new(factory),
            prepare: Box::new(prepare),
            job_fn: Box::new(move |ctx| Box::pin(job_fn(ctx))),
        }
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    pub fn can_be_retried(&self) -> bool {
        self.can_be_retried
    }

    /// Validate the type-specific fields of a creation request.
    pub fn create_details(&self, fields: &Value) -> Result<TaskDetails, SchedulerError> {
        (self.factory)(fields)
    }

    /// Build the arguments for the task's next job.
    pub fn prepare_job_args(
        &self,
        task: &Task,
        ctx: &PrepareContext,
        config: &Config,
    ) -> Result<Value, SchedulerError> {
        (self.prepare)(task, ctx, config)
    }

    /// Run the job function.
    pub fn run(
        &self,
        ctx: JobContext,
    ) -> Pin<Box<dyn Future<Output = Result<JobOutcome, JobError>> + Send>> {
        (self.job_fn)(ctx)
    }
}

/// Process-wide map from task-type tag to descriptor.
#[derive(Default)]
pub struct TaskRegistry {
    registrations: HashMap<&'static str, Arc<TaskTypeDescriptor>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            registrations: HashMap::new(),
        }
    }

    /// Register a task type. Fails with a conflict if the tag is taken.
    pub fn register(&mut self, descriptor: TaskTypeDescriptor) -> Result<(), SchedulerError> {
        let tag = descriptor.tag();
        if self.registrations.contains_key(tag) {
            return Err(SchedulerError::Conflict(tag.to_string()));
        }
        self.registrations.insert(tag, Arc::new(descriptor));
        Ok(())
    }

    /// Look up a descriptor by tag.
    pub fn lookup(&self, tag: &str) -> Result<Arc<TaskTypeDescriptor>, SchedulerError> {
        self.registrations
            .get(tag)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownTaskType(tag.to_string()))
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.registrations.contains_key(tag)
    }

    /// All registered tags, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.registrations.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::EventizerDetails;
    use serde_json::json;

    fn test_descriptor(tag: &'static str) -> TaskTypeDescriptor {
        TaskTypeDescriptor::new(
            tag,
            "test_jobs",
            true,
            |_fields| {
                Ok(TaskDetails::Eventizer(EventizerDetails {
                    datasource_type: "git".to_string(),
                    datasource_category: "commit".to_string(),
                }))
            },
            |task, _ctx, _config| Ok(task.task_args.clone()),
            |_ctx| async move {
                Ok(JobOutcome {
                    result: json!({}),
                    progress: None,
                })
            },
        )
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = TaskRegistry::new();
        registry.register(test_descriptor("eventizer")).unwrap();

        assert!(registry.is_registered("eventizer"));
        let descriptor = registry.lookup("eventizer").unwrap();
        assert_eq!(descriptor.tag(), "eventizer");
        assert_eq!(descriptor.default_queue(), "test_jobs");
    }

    #[test]
    fn duplicate_registration_is_a_conflict() {
        let mut registry = TaskRegistry::new();
        registry.register(test_descriptor("eventizer")).unwrap();

        let err = registry.register(test_descriptor("eventizer")).unwrap_err();
        assert!(matches!(err, SchedulerError::Conflict(tag) if tag == "eventizer"));
    }

    #[test]
    fn unknown_tag_fails_lookup() {
        let registry = TaskRegistry::new();
        let err = registry.lookup("nope").unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownTaskType(tag) if tag == "nope"));
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = TaskRegistry::new();
        registry.register(test_descriptor("unify")).unwrap();
        registry.register(test_descriptor("affiliate")).unwrap();
        registry.register(test_descriptor("eventizer")).unwrap();

        assert_eq!(registry.names(), vec!["affiliate", "eventizer", "unify"]);
    }

    #[test]
    fn log_buffer_accumulates_lines() {
        let logs = JobLogBuffer::new();
        logs.append("fetching items");
        logs.append("done");
        assert_eq!(logs.snapshot(), "fetching items\ndone\n");
    }
}
