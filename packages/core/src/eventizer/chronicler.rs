//! Chronicler job function.
//!
//! Resolves the datasource backend, iterates its items, converts each one to
//! events appended to the events stream, and checkpoints progress after each
//! item. Cancellation is observed at checkpoints: when a checkpoint reports a
//! requested cancellation the job stops with its progress preserved.

use serde_json::{json, Value};

use crate::scheduler::error::JobError;
use crate::scheduler::progress::{ChroniclerProgress, Summary};
use crate::scheduler::registry::{JobContext, JobOutcome};
use crate::stream::EventStream;

pub async fn chronicler_job(ctx: JobContext) -> Result<JobOutcome, JobError> {
    let args = &ctx.job.job_args;

    let datasource_type = required_str(args, "datasource_type")?;
    let category = required_str(args, "datasource_category")?;
    let stream_name = required_str(args, "events_stream")?;
    let stream_max_length = args
        .get("stream_max_length")
        .and_then(Value::as_u64)
        .ok_or_else(|| JobError::Failed(anyhow::anyhow!("missing 'stream_max_length' argument")))?
        as usize;
    let job_args = args.get("job_args").cloned().unwrap_or_else(|| json!({}));

    let backend = ctx.services.backends.lookup(&datasource_type)?;
    let source = backend.source(&job_args);

    let mut progress = ChroniclerProgress::new(&ctx.job.uuid, &datasource_type, &category);
    let mut summary = Summary::default();

    ctx.logs
        .append(&format!("fetching '{category}' items from '{source}'"));

    let items = backend.fetch(&category, &job_args).await?;

    for item in items {
        let events: Vec<Value> = backend
            .eventize(&source, &item)
            .iter()
            .map(|e| e.to_value())
            .collect();

        ctx.services
            .stream
            .publish(&stream_name, &events, stream_max_length)
            .await
            .map_err(JobError::Failed)?;

        summary.update(&item.uuid, item.updated_on, item.offset.clone());
        progress.summary = Some(summary.clone());

        let ack = ctx
            .progress
            .checkpoint(&progress.to_value())
            .await
            .map_err(|e| JobError::Failed(e.into()))?;
        if ack.cancel_requested {
            ctx.logs.append("cancellation requested; stopping");
            return Err(JobError::Canceled);
        }
    }

    ctx.logs.append(&format!(
        "{} items eventized from '{source}'",
        summary.fetched
    ));

    progress.summary = Some(summary);
    let result = final_result(&progress);
    Ok(JobOutcome {
        result,
        progress: Some(progress.to_value()),
    })
}

fn required_str(args: &Value, key: &str) -> Result<String, JobError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| JobError::Failed(anyhow::anyhow!("missing '{key}' argument")))
}

/// The job result: the final progress document with the computed item total.
fn final_result(progress: &ChroniclerProgress) -> Value {
    let mut result = progress.to_value();
    if let Some(total) = progress.summary.as_ref().map(Summary::total) {
        if let Some(summary) = result.get_mut("summary").and_then(Value::as_object_mut) {
            summary.insert("total".to_string(), json!(total));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_result_includes_total() {
        let mut progress = ChroniclerProgress::new("job-1", "git", "commit");
        let mut summary = Summary::default();
        summary.fetched = 9;
        summary.skipped = 1;
        progress.summary = Some(summary);

        let result = final_result(&progress);
        assert_eq!(result["summary"]["total"], json!(10));
        assert_eq!(result["backend"], json!("git"));
    }
}
