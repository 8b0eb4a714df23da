//! Task model.
//!
//! A task is a recurring or one-shot unit of work. Each run of a task is
//! materialized as a [`Job`](super::job::Job). Tasks are polymorphic over
//! their task type: the common columns live on the row itself while the
//! type-specific fields are kept in a tagged [`TaskDetails`] document, with
//! the tag mirrored in the `task_type` discriminator column.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle states shared by tasks and jobs.
///
/// Jobs only ever take the `Enqueued`, `Running`, `Completed`, `Failed` and
/// `Canceled` states; `Recovery` and `Paused` are task-level states.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "scheduler_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStatus {
    #[default]
    New,
    Enqueued,
    Running,
    Completed,
    Failed,
    Canceled,
    Recovery,
    Paused,
}

impl SchedulerStatus {
    /// Whether no further transitions happen without outside intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SchedulerStatus::Completed | SchedulerStatus::Failed | SchedulerStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerStatus::New => "new",
            SchedulerStatus::Enqueued => "enqueued",
            SchedulerStatus::Running => "running",
            SchedulerStatus::Completed => "completed",
            SchedulerStatus::Failed => "failed",
            SchedulerStatus::Canceled => "canceled",
            SchedulerStatus::Recovery => "recovery",
            SchedulerStatus::Paused => "paused",
        }
    }
}

impl std::fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Earliest date accepted for identity periods.
pub fn min_period_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0).unwrap()
}

fn default_true() -> bool {
    true
}

/// Type-specific fields of an eventizer task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventizerDetails {
    pub datasource_type: String,
    pub datasource_category: String,
}

/// Fields shared by affiliation-style identity tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffiliationDetails {
    #[serde(default)]
    pub uuids: Option<Value>,
    #[serde(default = "min_period_date")]
    pub last_modified: DateTime<Utc>,
}

/// Fields shared by matching-style identity tasks (unify and its
/// recommendation counterpart).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingDetails {
    #[serde(default)]
    pub criteria: Option<Value>,
    #[serde(default)]
    pub source_uuids: Option<Value>,
    #[serde(default)]
    pub target_uuids: Option<Value>,
    #[serde(default = "default_true")]
    pub exclude: bool,
    #[serde(default = "default_true")]
    pub strict: bool,
    #[serde(default)]
    pub match_source: bool,
    #[serde(default)]
    pub guess_github_user: bool,
    #[serde(default = "min_period_date")]
    pub last_modified: DateTime<Utc>,
}

/// Fields shared by gender-style identity tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenderDetails {
    #[serde(default)]
    pub uuids: Option<Value>,
    #[serde(default = "default_true")]
    pub exclude: bool,
    #[serde(default)]
    pub no_strict_matching: bool,
}

/// Fields of an import-identities task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportDetails {
    pub backend_name: String,
    pub url: String,
}

/// Per-type task fields, tagged by the task-type name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type", rename_all = "snake_case")]
pub enum TaskDetails {
    Eventizer(EventizerDetails),
    Affiliate(AffiliationDetails),
    Unify(MatchingDetails),
    Genderize(GenderDetails),
    RecommendAffiliations(AffiliationDetails),
    RecommendMatches(MatchingDetails),
    RecommendGender(GenderDetails),
    ImportIdentities(ImportDetails),
}

impl TaskDetails {
    /// The task-type tag; matches the registry key and the discriminator
    /// column.
    pub fn tag(&self) -> &'static str {
        match self {
            TaskDetails::Eventizer(_) => "eventizer",
            TaskDetails::Affiliate(_) => "affiliate",
            TaskDetails::Unify(_) => "unify",
            TaskDetails::Genderize(_) => "genderize",
            TaskDetails::RecommendAffiliations(_) => "recommend_affiliations",
            TaskDetails::RecommendMatches(_) => "recommend_matches",
            TaskDetails::RecommendGender(_) => "recommend_gender",
            TaskDetails::ImportIdentities(_) => "import_identities",
        }
    }
}

/// A scheduled unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub uuid: String,
    pub status: SchedulerStatus,
    /// Number of jobs that reached a terminal status.
    pub runs: i32,
    /// Consecutive failures since the last success.
    pub failures: i32,
    pub last_run: Option<DateTime<Utc>>,
    /// When the next run is due; `None` until the first enqueue.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Seconds between runs; 0 means run once.
    pub job_interval: i64,
    pub job_max_retries: i32,
    /// Burst tasks terminate after their first successful run.
    pub burst: bool,
    /// User-supplied configuration forwarded to the jobs.
    pub task_args: Value,
    #[sqlx(json)]
    #[serde(flatten)]
    pub details: TaskDetails,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        details: TaskDetails,
        task_args: Value,
        job_interval: i64,
        job_max_retries: i32,
        burst: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4().to_string(),
            status: SchedulerStatus::New,
            runs: 0,
            failures: 0,
            last_run: None,
            scheduled_at: None,
            job_interval,
            job_max_retries,
            burst,
            task_args,
            details,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn task_type(&self) -> &'static str {
        self.details.tag()
    }
}
