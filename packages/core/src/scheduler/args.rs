//! Argument generation for chronicler jobs.
//!
//! Each scheduled run of an eventizer task gets freshly generated job
//! arguments derived from the previous run's progress:
//!
//! - `initial_args` for the first-ever run;
//! - `resuming_args` for the next periodic run, bounded by the high-water
//!   mark of the last completed run (`max_updated_on` / `max_offset`);
//! - `recovery_args` after a crash or abort, bounded by the last
//!   successfully-checkpointed point (`last_updated_on` / `last_offset`) so
//!   any partially-emitted batch is reprocessed.
//!
//! The strategy is resolved per datasource type: most datasources filter by
//! timestamp, a few paginate by a numeric offset.

use chrono::SecondsFormat;
use serde_json::{Map, Value};

use super::progress::ChroniclerProgress;

pub trait ChroniclerArgsGenerator: Send + Sync {
    /// Arguments for the first run of a task.
    fn initial_args(&self, task_args: &Value) -> Value;

    /// Arguments for the next periodic run, derived from the progress of the
    /// last completed one.
    fn resuming_args(&self, prev_job_args: &Value, progress: &ChroniclerProgress) -> Value;

    /// Arguments for a recovery run after a failure or crash.
    fn recovery_args(&self, prev_job_args: &Value, progress: &ChroniclerProgress) -> Value;
}

/// Resolve the generator for a datasource type.
pub fn chronicler_args_generator(datasource_type: &str) -> &'static dyn ChroniclerArgsGenerator {
    match datasource_type {
        // Datasources that paginate by numeric offset instead of timestamps.
        "kitsune" | "remo" => &OffsetBasedArgs,
        _ => &TimeBasedArgs,
    }
}

fn as_object(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Drop per-run fields so a stale bound never leaks into the next run.
fn clear_transient(args: &mut Map<String, Value>) {
    args.remove("from_date");
    args.remove("offset");
}

/// Timestamp-bounded argument generation.
pub struct TimeBasedArgs;

impl ChroniclerArgsGenerator for TimeBasedArgs {
    fn initial_args(&self, task_args: &Value) -> Value {
        Value::Object(as_object(task_args))
    }

    fn resuming_args(&self, prev_job_args: &Value, progress: &ChroniclerProgress) -> Value {
        let mut args = as_object(prev_job_args);
        clear_transient(&mut args);
        if let Some(max) = progress.summary.as_ref().and_then(|s| s.max_updated_on) {
            args.insert(
                "from_date".to_string(),
                Value::String(max.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }
        Value::Object(args)
    }

    fn recovery_args(&self, prev_job_args: &Value, progress: &ChroniclerProgress) -> Value {
        let mut args = as_object(prev_job_args);
        clear_transient(&mut args);
        if let Some(last) = progress.summary.as_ref().and_then(|s| s.last_updated_on) {
            args.insert(
                "from_date".to_string(),
                Value::String(last.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        }
        Value::Object(args)
    }
}

/// Offset-bounded argument generation.
pub struct OffsetBasedArgs;

impl ChroniclerArgsGenerator for OffsetBasedArgs {
    fn initial_args(&self, task_args: &Value) -> Value {
        Value::Object(as_object(task_args))
    }

    fn resuming_args(&self, prev_job_args: &Value, progress: &ChroniclerProgress) -> Value {
        let mut args = as_object(prev_job_args);
        clear_transient(&mut args);
        if let Some(max) = progress.summary.as_ref().and_then(|s| s.max_offset.clone()) {
            args.insert("offset".to_string(), max);
        }
        Value::Object(args)
    }

    fn recovery_args(&self, prev_job_args: &Value, progress: &ChroniclerProgress) -> Value {
        let mut args = as_object(prev_job_args);
        clear_transient(&mut args);
        if let Some(last) = progress.summary.as_ref().and_then(|s| s.last_offset.clone()) {
            args.insert("offset".to_string(), last);
        }
        Value::Object(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::progress::Summary;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn progress_with_summary() -> ChroniclerProgress {
        let mut progress = ChroniclerProgress::new("job-1", "git", "commit");
        progress.summary = Some(Summary {
            fetched: 5,
            skipped: 0,
            last_uuid: Some("abc".to_string()),
            min_updated_on: Some(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()),
            max_updated_on: Some(Utc.with_ymd_and_hms(2021, 1, 10, 0, 0, 0).unwrap()),
            last_updated_on: Some(Utc.with_ymd_and_hms(2021, 1, 5, 0, 0, 0).unwrap()),
            min_offset: Some(json!(1)),
            max_offset: Some(json!(100)),
            last_offset: Some(json!(80)),
            extras: None,
        });
        progress
    }

    #[test]
    fn initial_args_copy_the_task_args() {
        let task_args = json!({"uri": "http://example.com/", "gitpath": "/tmp/repo"});
        let args = TimeBasedArgs.initial_args(&task_args);
        assert_eq!(args, task_args);
    }

    #[test]
    fn resuming_uses_the_high_water_mark() {
        let prev = json!({"uri": "http://example.com/", "from_date": "2020-01-01T00:00:00Z"});
        let args = TimeBasedArgs.resuming_args(&prev, &progress_with_summary());

        assert_eq!(args["uri"], json!("http://example.com/"));
        assert_eq!(args["from_date"], json!("2021-01-10T00:00:00Z"));
    }

    #[test]
    fn recovery_uses_the_last_checkpointed_point() {
        let prev = json!({"uri": "http://example.com/", "from_date": "2020-01-01T00:00:00Z"});
        let args = TimeBasedArgs.recovery_args(&prev, &progress_with_summary());

        // Lower bound is last_updated_on, not max_updated_on, so any
        // partially-emitted batch is reprocessed.
        assert_eq!(args["from_date"], json!("2021-01-05T00:00:00Z"));
    }

    #[test]
    fn resuming_without_summary_clears_the_bound() {
        let prev = json!({"uri": "http://example.com/", "from_date": "2020-01-01T00:00:00Z"});
        let progress = ChroniclerProgress::new("job-1", "git", "commit");
        let args = TimeBasedArgs.resuming_args(&prev, &progress);

        assert!(args.get("from_date").is_none());
        assert_eq!(args["uri"], json!("http://example.com/"));
    }

    #[test]
    fn offset_generator_tracks_offsets() {
        let prev = json!({"tag": "kitsune", "offset": 10});
        let progress = progress_with_summary();

        let resuming = OffsetBasedArgs.resuming_args(&prev, &progress);
        assert_eq!(resuming["offset"], json!(100));

        let recovery = OffsetBasedArgs.recovery_args(&prev, &progress);
        assert_eq!(recovery["offset"], json!(80));
    }

    #[test]
    fn generator_resolution_by_datasource() {
        let progress = progress_with_summary();
        let prev = json!({});

        let git = chronicler_args_generator("git");
        assert!(git.resuming_args(&prev, &progress).get("from_date").is_some());

        let kitsune = chronicler_args_generator("kitsune");
        assert!(kitsune.resuming_args(&prev, &progress).get("offset").is_some());
    }
}
