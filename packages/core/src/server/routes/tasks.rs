//! Task and job endpoints.
//!
//! One route family per task type: creation validates the type-specific
//! fields through the registry, list endpoints paginate with the common
//! page-number shape, and job detail endpoints serve live progress and logs
//! for running jobs.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::common::pagination::{paginate, PageParams, Paginated};
use crate::scheduler::store::TaskFilter;
use crate::scheduler::{Job, JobRunner, NewTask, SchedulerStatus, Task, TaskStore};
use crate::server::app::{ApiError, AppState};

const LAST_JOBS_SHOWN: usize = 10;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub page: Option<usize>,
    pub size: Option<usize>,
    pub status: Option<String>,
}

impl ListParams {
    fn page_params(&self) -> PageParams {
        PageParams {
            page: self.page,
            size: self.size,
        }
    }

    fn status_filter(&self) -> Result<Option<SchedulerStatus>, ApiError> {
        match &self.status {
            None => Ok(None),
            Some(s) => serde_json::from_value::<SchedulerStatus>(json!(s))
                .map(Some)
                .map_err(|_| ApiError::bad_request(format!("unknown status '{s}'"))),
        }
    }
}

/// GET /task-types
pub async fn list_task_types(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"task_types": state.registry.names()}))
}

/// GET /tasks/{task_type}
pub async fn list_tasks(
    State(state): State<AppState>,
    Path(task_type): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Paginated<Value>>, ApiError> {
    state.registry.lookup(&task_type)?;

    let filter = TaskFilter {
        task_type: Some(task_type.clone()),
        status: params.status_filter()?,
    };
    let tasks = state.store.list_tasks(&filter).await?;

    let mut results = Vec::with_capacity(tasks.len());
    for task in &tasks {
        let jobs = state.store.jobs_for_task(&task.uuid).await?;
        results.push(task_response(task, &jobs));
    }

    Ok(Json(paginate(
        results,
        &params.page_params(),
        &format!("/tasks/{task_type}"),
    )))
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    pub task_args: Option<Value>,
    pub job_interval: Option<i64>,
    pub job_max_retries: Option<i32>,
    pub burst: Option<bool>,
    #[serde(flatten)]
    pub type_fields: Value,
}

/// POST /tasks/{task_type}
pub async fn create_task(
    State(state): State<AppState>,
    Path(task_type): Path<String>,
    Json(body): Json<CreateTaskBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let task_args = body
        .task_args
        .ok_or_else(|| ApiError::bad_request("'task_args' is required"))?;

    let mut request = NewTask::builder()
        .task_args(task_args)
        .type_fields(body.type_fields)
        .build();
    if let Some(job_interval) = body.job_interval {
        request.job_interval = job_interval;
    }
    if let Some(job_max_retries) = body.job_max_retries {
        request.job_max_retries = job_max_retries;
    }
    if let Some(burst) = body.burst {
        request.burst = burst;
    }

    let task = state.scheduler.schedule_task(&task_type, request).await?;

    let jobs = state.store.jobs_for_task(&task.uuid).await?;
    // The task row moved to ENQUEUED while scheduling.
    let task = state.scheduler.get_task(&task.uuid).await?;
    Ok((StatusCode::CREATED, Json(task_response(&task, &jobs))))
}

/// GET /tasks/{task_type}/{uuid}
pub async fn get_task(
    State(state): State<AppState>,
    Path((task_type, task_uuid)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let task = fetch_scoped_task(&state, &task_type, &task_uuid).await?;
    let jobs = state.store.jobs_for_task(&task.uuid).await?;
    Ok(Json(task_response(&task, &jobs)))
}

/// DELETE /tasks/{task_type}/{uuid}
pub async fn delete_task(
    State(state): State<AppState>,
    Path((task_type, task_uuid)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    fetch_scoped_task(&state, &task_type, &task_uuid).await?;
    state.scheduler.delete_task(&task_uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /tasks/{task_type}/{uuid}/reschedule
pub async fn reschedule_task(
    State(state): State<AppState>,
    Path((task_type, task_uuid)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    fetch_scoped_task(&state, &task_type, &task_uuid).await?;
    state.scheduler.reschedule_task(&task_uuid).await?;
    Ok(Json(json!({
        "message": format!("Task {task_uuid} rescheduled")
    })))
}

/// POST /tasks/{task_type}/{uuid}/cancel
pub async fn cancel_task(
    State(state): State<AppState>,
    Path((task_type, task_uuid)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    fetch_scoped_task(&state, &task_type, &task_uuid).await?;
    state.scheduler.cancel_task(&task_uuid).await?;
    Ok(Json(json!({
        "message": format!("Task {task_uuid} canceled")
    })))
}

/// GET /tasks/{task_type}/{uuid}/jobs
pub async fn list_jobs(
    State(state): State<AppState>,
    Path((task_type, task_uuid)): Path<(String, String)>,
    Query(params): Query<ListParams>,
) -> Result<Json<Paginated<Value>>, ApiError> {
    let task = fetch_scoped_task(&state, &task_type, &task_uuid).await?;
    let jobs = state.store.jobs_for_task(&task.uuid).await?;

    let results: Vec<Value> = jobs.iter().map(job_summary).collect();
    Ok(Json(paginate(
        results,
        &params.page_params(),
        &format!("/tasks/{task_type}/{task_uuid}/jobs"),
    )))
}

/// GET /tasks/{task_type}/{uuid}/jobs/{job_uuid}
pub async fn get_job(
    State(state): State<AppState>,
    Path((task_type, task_uuid, job_uuid)): Path<(String, String, String)>,
) -> Result<Json<Value>, ApiError> {
    let (_task, job) = fetch_scoped_job(&state, &task_type, &task_uuid, &job_uuid).await?;

    let mut response = job_summary(&job);
    let progress = if job.status == SchedulerStatus::Running {
        state.runner.fetch(&job.queue, &job.uuid).await?.progress
    } else {
        job.progress.clone()
    };
    response["progress"] = progress.unwrap_or(Value::Null);

    Ok(Json(response))
}

/// GET /tasks/{task_type}/{uuid}/jobs/{job_uuid}/logs
pub async fn get_job_logs(
    State(state): State<AppState>,
    Path((task_type, task_uuid, job_uuid)): Path<(String, String, String)>,
) -> Result<Json<Value>, ApiError> {
    let (_task, job) = fetch_scoped_job(&state, &task_type, &task_uuid, &job_uuid).await?;

    let logs = if job.status == SchedulerStatus::Running {
        state.runner.fetch(&job.queue, &job.uuid).await?.logs
    } else {
        job.logs.clone()
    };

    Ok(Json(json!({
        "uuid": job.uuid,
        "status": job.status.to_string(),
        "logs": logs,
    })))
}

async fn fetch_scoped_task(
    state: &AppState,
    task_type: &str,
    task_uuid: &str,
) -> Result<Task, ApiError> {
    state.registry.lookup(task_type)?;
    let task = state.scheduler.get_task(task_uuid).await?;
    if task.task_type() != task_type {
        return Err(ApiError::not_found(format!("task {task_uuid} not found")));
    }
    Ok(task)
}

async fn fetch_scoped_job(
    state: &AppState,
    task_type: &str,
    task_uuid: &str,
    job_uuid: &str,
) -> Result<(Task, Job), ApiError> {
    let task = fetch_scoped_task(state, task_type, task_uuid).await?;
    let job = state
        .store
        .fetch_job(job_uuid)
        .await?
        .filter(|job| job.task_uuid == task.uuid)
        .ok_or_else(|| ApiError::not_found(format!("job {job_uuid} not found")))?;
    Ok((task, job))
}

fn task_response(task: &Task, jobs: &[Job]) -> Value {
    let mut response = json!({
        "uuid": task.uuid,
        "status": task.status.to_string(),
        "runs": task.runs,
        "failures": task.failures,
        "last_run": task.last_run,
        "job_interval": task.job_interval,
        "scheduled_at": task.scheduled_at,
        "job_max_retries": task.job_max_retries,
        "task_args": task.task_args,
        "burst": task.burst,
        "last_jobs": jobs
            .iter()
            .take(LAST_JOBS_SHOWN)
            .map(job_summary)
            .collect::<Vec<_>>(),
    });

    // Type-specific fields land next to the common ones.
    if let (Some(response), Ok(Value::Object(details))) = (
        response.as_object_mut(),
        serde_json::to_value(&task.details),
    ) {
        for (key, value) in details {
            response.insert(key, value);
        }
    }
    response
}

fn job_summary(job: &Job) -> Value {
    json!({
        "uuid": job.uuid,
        "job_num": job.job_num,
        "status": job.status.to_string(),
        "queue": job.queue,
        "scheduled_at": job.scheduled_at,
        "started_at": job.started_at,
        "finished_at": job.finished_at,
    })
}
