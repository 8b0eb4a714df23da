//! Identity management task types.
//!
//! These tasks drive the identity operations (affiliation, unification,
//! gender completion, recommendations, imports). The algorithms themselves
//! live behind the [`IdentityService`] trait; the scheduler only prepares
//! their arguments and routes the results.
//!
//! Identity jobs carry no structured progress, only job arguments and a
//! result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::config::Config;

use super::super::error::{JobError, SchedulerError};
use super::super::registry::{JobContext, JobOutcome, PrepareContext, TaskTypeDescriptor};
use super::super::scheduler::details_from_fields;
use super::super::task::Task;

/// Execution context the identity jobs run under.
///
/// Stored payloads sometimes carry the context as a bare `[user, job_id,
/// tenant]` list; [`TaskContext::rehydrate`] accepts both shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub user: String,
    pub job_id: Option<String>,
    pub tenant: Option<String>,
}

impl TaskContext {
    pub fn system(user: &str) -> Self {
        Self {
            user: user.to_string(),
            job_id: None,
            tenant: None,
        }
    }

    /// Rebuild the context from a stored value, object or loose list shape.
    pub fn rehydrate(value: &Value) -> Option<Self> {
        if let Ok(ctx) = serde_json::from_value::<TaskContext>(value.clone()) {
            return Some(ctx);
        }
        let items = value.as_array()?;
        let user = items.first()?.as_str()?.to_string();
        let job_id = items
            .get(1)
            .and_then(Value::as_str)
            .map(str::to_string);
        let tenant = items
            .get(2)
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(Self {
            user,
            job_id,
            tenant,
        })
    }
}

/// The identity operations a task can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityOperation {
    Affiliate,
    Unify,
    Genderize,
    RecommendAffiliations,
    RecommendMatches,
    RecommendGender,
    ImportIdentities,
}

impl IdentityOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityOperation::Affiliate => "affiliate",
            IdentityOperation::Unify => "unify",
            IdentityOperation::Genderize => "genderize",
            IdentityOperation::RecommendAffiliations => "recommend_affiliations",
            IdentityOperation::RecommendMatches => "recommend_matches",
            IdentityOperation::RecommendGender => "recommend_gender",
            IdentityOperation::ImportIdentities => "import_identities",
        }
    }
}

/// Boundary to the identity management engine.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn run(
        &self,
        operation: IdentityOperation,
        ctx: &TaskContext,
        job_args: &Value,
    ) -> anyhow::Result<Value>;
}

/// Service that acknowledges every operation without touching any identity
/// data. Stands in where no identity engine is wired up.
pub struct NullIdentityService;

#[async_trait]
impl IdentityService for NullIdentityService {
    async fn run(
        &self,
        operation: IdentityOperation,
        ctx: &TaskContext,
        _job_args: &Value,
    ) -> anyhow::Result<Value> {
        info!(operation = operation.as_str(), user = %ctx.user, "identity operation skipped");
        Ok(json!({"results": {}}))
    }
}

/// Recording service for tests: remembers every invocation and can be told
/// to fail.
#[derive(Default)]
pub struct RecordingIdentityService {
    invocations: Mutex<Vec<(IdentityOperation, TaskContext, Value)>>,
    fail_with: Mutex<Option<String>>,
}

impl RecordingIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> Vec<(IdentityOperation, TaskContext, Value)> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn fail_with(&self, error: &str) {
        *self.fail_with.lock().unwrap_or_else(|e| e.into_inner()) = Some(error.to_string());
    }

    pub fn succeed(&self) {
        *self.fail_with.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[async_trait]
impl IdentityService for RecordingIdentityService {
    async fn run(
        &self,
        operation: IdentityOperation,
        ctx: &TaskContext,
        job_args: &Value,
    ) -> anyhow::Result<Value> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((operation, ctx.clone(), job_args.clone()));

        if let Some(error) = self
            .fail_with
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            anyhow::bail!(error);
        }
        Ok(json!({"results": {"processed": 1}}))
    }
}

/// An importer backend, advertising which parameters it accepts.
#[derive(Debug, Clone)]
pub struct ImporterBackend {
    pub name: String,
    pub args: Vec<String>,
}

/// Registry of identity importer backends, keyed by backend name.
#[derive(Default)]
pub struct ImporterRegistry {
    backends: HashMap<String, ImporterBackend>,
}

impl ImporterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: ImporterBackend) {
        self.backends.insert(backend.name.clone(), backend);
    }

    pub fn get(&self, name: &str) -> Option<&ImporterBackend> {
        self.backends.get(name)
    }

    /// Whether the backend takes a `from_date` lower bound.
    pub fn accepts_from_date(&self, name: &str) -> bool {
        self.get(name)
            .map(|b| b.args.iter().any(|a| a == "from_date"))
            .unwrap_or(false)
    }
}

/// Descriptors for all identity task types, in registration order.
pub fn identity_task_types(
    config: &Config,
    importers: Arc<ImporterRegistry>,
) -> Vec<TaskTypeDescriptor> {
    let queue = config.identities_queue.clone();

    let mut descriptors = vec![
        identity_task_type("affiliate", IdentityOperation::Affiliate, &queue),
        identity_task_type("unify", IdentityOperation::Unify, &queue),
        identity_task_type("genderize", IdentityOperation::Genderize, &queue),
        identity_task_type(
            "recommend_affiliations",
            IdentityOperation::RecommendAffiliations,
            &queue,
        ),
        identity_task_type(
            "recommend_matches",
            IdentityOperation::RecommendMatches,
            &queue,
        ),
        identity_task_type(
            "recommend_gender",
            IdentityOperation::RecommendGender,
            &queue,
        ),
    ];
    descriptors.push(import_identities_task_type(&queue, importers));
    descriptors
}

fn identity_task_type(
    tag: &'static str,
    operation: IdentityOperation,
    queue: &str,
) -> TaskTypeDescriptor {
    TaskTypeDescriptor::new(
        tag,
        queue.to_string(),
        true,
        move |fields| details_from_fields(tag, fields),
        |task, _ctx, config| Ok(Value::Object(base_job_args(task, config))),
        move |ctx| run_identity_job(operation, ctx),
    )
}

fn import_identities_task_type(
    queue: &str,
    importers: Arc<ImporterRegistry>,
) -> TaskTypeDescriptor {
    TaskTypeDescriptor::new(
        "import_identities",
        queue.to_string(),
        true,
        |fields| details_from_fields("import_identities", fields),
        move |task, ctx, config| Ok(prepare_import_args(task, ctx, config, &importers)),
        |ctx| run_identity_job(IdentityOperation::ImportIdentities, ctx),
    )
}

/// `{ctx, ...type-specific fields}`: the argument set every identity job
/// starts from.
fn base_job_args(task: &Task, config: &Config) -> Map<String, Value> {
    let mut job_args = Map::new();
    job_args.insert(
        "ctx".to_string(),
        json!(TaskContext::system(&config.system_bot_user)),
    );

    if let Ok(Value::Object(fields)) = serde_json::to_value(&task.details) {
        for (key, value) in fields {
            if key != "task_type" {
                job_args.insert(key, value);
            }
        }
    }
    job_args
}

/// Import jobs additionally carry the user task arguments and, when the
/// backend takes one, a `from_date` bound at the previous completed run.
fn prepare_import_args(
    task: &Task,
    ctx: &PrepareContext,
    config: &Config,
    importers: &ImporterRegistry,
) -> Value {
    let mut job_args = base_job_args(task, config);

    if let Some(args) = task.task_args.as_object() {
        for (key, value) in args {
            job_args.insert(key.clone(), value.clone());
        }
    }

    let backend_name = job_args
        .get("backend_name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if importers.accepts_from_date(&backend_name) {
        if let Some(started_at) = ctx
            .last_completed_job
            .as_ref()
            .and_then(|job| job.started_at)
        {
            job_args.insert(
                "from_date".to_string(),
                Value::String(started_at.to_rfc3339()),
            );
        }
    }

    Value::Object(job_args)
}

async fn run_identity_job(
    operation: IdentityOperation,
    ctx: JobContext,
) -> Result<JobOutcome, JobError> {
    let job_args = ctx.job.job_args.clone();

    let mut task_ctx = job_args
        .get("ctx")
        .and_then(TaskContext::rehydrate)
        .unwrap_or_else(|| TaskContext::system("grimoirelab"));
    task_ctx.job_id = Some(ctx.job.uuid.clone());

    ctx.logs
        .append(&format!("running {} for {}", operation.as_str(), task_ctx.user));

    let result = ctx
        .services
        .identities
        .run(operation, &task_ctx, &job_args)
        .await
        .map_err(JobError::Failed)?;

    Ok(JobOutcome {
        result,
        progress: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{ImportDetails, MatchingDetails, TaskDetails};
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn rehydrate_from_object() {
        let value = json!({"user": "bot", "job_id": "j-1", "tenant": null});
        let ctx = TaskContext::rehydrate(&value).unwrap();
        assert_eq!(ctx.user, "bot");
        assert_eq!(ctx.job_id.as_deref(), Some("j-1"));
        assert!(ctx.tenant.is_none());
    }

    #[test]
    fn rehydrate_from_loose_list() {
        let value = json!(["bot", null, "tenant-a"]);
        let ctx = TaskContext::rehydrate(&value).unwrap();
        assert_eq!(ctx.user, "bot");
        assert!(ctx.job_id.is_none());
        assert_eq!(ctx.tenant.as_deref(), Some("tenant-a"));
    }

    #[test]
    fn base_args_carry_ctx_and_detail_fields() {
        let task = Task::new(
            TaskDetails::Unify(MatchingDetails {
                criteria: Some(json!(["email"])),
                source_uuids: None,
                target_uuids: None,
                exclude: true,
                strict: true,
                match_source: false,
                guess_github_user: false,
                last_modified: crate::scheduler::task::min_period_date(),
            }),
            json!({}),
            0,
            0,
            true,
        );
        let config = Config::default();

        let args = Value::Object(base_job_args(&task, &config));
        assert_eq!(args["ctx"]["user"], json!("grimoirelab"));
        assert_eq!(args["criteria"], json!(["email"]));
        assert_eq!(args["exclude"], json!(true));
        assert!(args.get("task_type").is_none());
    }

    #[test]
    fn import_args_inject_from_date_when_backend_accepts_it() {
        let task = Task::new(
            TaskDetails::ImportIdentities(ImportDetails {
                backend_name: "gitdm".to_string(),
                url: "http://example.com/identities.txt".to_string(),
            }),
            json!({"verify": true}),
            3600,
            3,
            false,
        );
        let config = Config::default();

        let mut importers = ImporterRegistry::new();
        importers.register(ImporterBackend {
            name: "gitdm".to_string(),
            args: vec!["url".to_string(), "from_date".to_string()],
        });

        let started_at = Utc::now();
        let mut job = crate::scheduler::job::Job::new(&task.uuid, 1, "identities_jobs", json!({}), None);
        job.status = crate::scheduler::task::SchedulerStatus::Completed;
        job.started_at = Some(started_at);

        let ctx = PrepareContext {
            latest_job: Some(job.clone()),
            last_completed_job: Some(job),
        };

        let args = prepare_import_args(&task, &ctx, &config, &importers);
        assert_eq!(args["backend_name"], json!("gitdm"));
        assert_eq!(args["verify"], json!(true));
        assert_eq!(args["from_date"], json!(started_at.to_rfc3339()));
    }

    #[test]
    fn import_args_skip_from_date_for_other_backends() {
        let task = Task::new(
            TaskDetails::ImportIdentities(ImportDetails {
                backend_name: "plain".to_string(),
                url: "http://example.com/identities.txt".to_string(),
            }),
            json!({}),
            3600,
            3,
            false,
        );
        let config = Config::default();
        let importers = ImporterRegistry::new();

        let args = prepare_import_args(&task, &PrepareContext::default(), &config, &importers);
        assert!(args.get("from_date").is_none());
    }

    #[tokio::test]
    async fn recording_service_tracks_invocations() {
        let service = RecordingIdentityService::new();
        let ctx = TaskContext::system("bot");

        service
            .run(IdentityOperation::Unify, &ctx, &json!({}))
            .await
            .unwrap();

        let invocations = service.invocations();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].0, IdentityOperation::Unify);

        service.fail_with("boom");
        let err = service
            .run(IdentityOperation::Unify, &ctx, &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
