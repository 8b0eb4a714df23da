//! Eventizer task type.
//!
//! Fetches data from a software development repository and converts it into
//! events published to the events stream. Job arguments are regenerated for
//! every run from the previous run's progress; the strategy depends on the
//! task status at enqueue time:
//!
//! | task status | strategy                                    |
//! |-------------|---------------------------------------------|
//! | NEW         | initial arguments                           |
//! | COMPLETED   | resume from the last run's high-water mark  |
//! | RECOVERY    | restart from the last checkpoint            |
//! | CANCELED    | reuse the canceled job's arguments verbatim |
//! | other       | initial arguments                           |

use serde_json::{json, Value};

use crate::config::Config;
use crate::eventizer::chronicler_job;

use super::super::args::chronicler_args_generator;
use super::super::error::SchedulerError;
use super::super::progress::ChroniclerProgress;
use super::super::registry::{PrepareContext, TaskTypeDescriptor};
use super::super::scheduler::details_from_fields;
use super::super::task::{SchedulerStatus, Task, TaskDetails};

pub const TASK_TYPE: &str = "eventizer";

pub fn eventizer_task_type(config: &Config) -> TaskTypeDescriptor {
    TaskTypeDescriptor::new(
        TASK_TYPE,
        config.eventizer_queue.clone(),
        true,
        |fields| details_from_fields(TASK_TYPE, fields),
        prepare_job_args,
        chronicler_job,
    )
}

/// Build the arguments for the task's next chronicler job.
fn prepare_job_args(
    task: &Task,
    ctx: &PrepareContext,
    config: &Config,
) -> Result<Value, SchedulerError> {
    let TaskDetails::Eventizer(details) = &task.details else {
        return Err(SchedulerError::Validation(format!(
            "task {} is not an eventizer task",
            task.uuid
        )));
    };

    let generator = chronicler_args_generator(&details.datasource_type);

    let latest_progress = ctx.latest_job.as_ref().and_then(|job| {
        job.progress
            .as_ref()
            .and_then(|p| ChroniclerProgress::from_value(p).ok())
    });

    let job_args = match task.status {
        SchedulerStatus::Completed => match (&ctx.latest_job, latest_progress) {
            (Some(job), Some(progress)) => {
                generator.resuming_args(inner_job_args(&job.job_args), &progress)
            }
            _ => generator.initial_args(&task.task_args),
        },
        SchedulerStatus::Recovery => match (&ctx.latest_job, latest_progress) {
            (Some(job), Some(progress)) => {
                generator.recovery_args(inner_job_args(&job.job_args), &progress)
            }
            _ => generator.initial_args(&task.task_args),
        },
        SchedulerStatus::Canceled => match &ctx.latest_job {
            Some(job) if job.status == SchedulerStatus::Canceled => {
                inner_job_args(&job.job_args).clone()
            }
            _ => generator.initial_args(&task.task_args),
        },
        _ => generator.initial_args(&task.task_args),
    };

    Ok(json!({
        "datasource_type": details.datasource_type,
        "datasource_category": details.datasource_category,
        "events_stream": config.events_stream,
        "stream_max_length": config.events_stream_max_length,
        "job_args": job_args,
    }))
}

/// The backend-facing arguments nested inside the job's full argument set.
fn inner_job_args(job_args: &Value) -> &Value {
    job_args.get("job_args").unwrap_or(job_args)
}
