//! Progress reported by eventizer jobs.
//!
//! While a chronicler job runs it periodically checkpoints a
//! [`ChroniclerProgress`] snapshot. The snapshot is stored as a JSON document
//! on the job row; timestamps are written as epoch seconds but accepted as
//! either epoch numbers or ISO-8601 strings when read back, so documents
//! produced by older deployments keep loading.

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Summary of the items processed by a chronicler run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    #[serde(default)]
    pub fetched: u64,
    #[serde(default)]
    pub skipped: u64,
    pub last_uuid: Option<String>,
    #[serde(default, with = "epoch_seconds")]
    pub min_updated_on: Option<DateTime<Utc>>,
    #[serde(default, with = "epoch_seconds")]
    pub max_updated_on: Option<DateTime<Utc>>,
    #[serde(default, with = "epoch_seconds")]
    pub last_updated_on: Option<DateTime<Utc>>,
    pub min_offset: Option<Value>,
    pub max_offset: Option<Value>,
    pub last_offset: Option<Value>,
    pub extras: Option<Value>,
}

impl Summary {
    /// Total number of items seen by the run, whether eventized or skipped.
    pub fn total(&self) -> u64 {
        self.fetched + self.skipped
    }

    /// Fold one item into the summary.
    pub fn update(&mut self, uuid: &str, updated_on: DateTime<Utc>, offset: Option<Value>) {
        self.fetched += 1;
        self.last_uuid = Some(uuid.to_string());
        self.last_updated_on = Some(updated_on);

        if self.min_updated_on.is_none_or(|min| updated_on < min) {
            self.min_updated_on = Some(updated_on);
        }
        if self.max_updated_on.is_none_or(|max| updated_on > max) {
            self.max_updated_on = Some(updated_on);
        }
        if let Some(offset) = offset {
            if self.min_offset.is_none() {
                self.min_offset = Some(offset.clone());
            }
            self.max_offset = Some(offset.clone());
            self.last_offset = Some(offset);
        }
    }
}

/// Progress of a chronicler job: which backend ran and a summary of what it
/// processed so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChroniclerProgress {
    pub job_id: String,
    pub backend: String,
    pub category: String,
    pub summary: Option<Summary>,
}

impl ChroniclerProgress {
    pub fn new(job_id: &str, backend: &str, category: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            backend: backend.to_string(),
            category: category.to_string(),
            summary: None,
        }
    }

    /// Parse a progress document stored on a job row.
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| anyhow!("invalid chronicler progress document: {e}"))
    }

    /// Serialize to the JSON document persisted on the job row.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Timestamps persisted as epoch seconds, read back from either epoch
/// numbers or ISO-8601 strings.
mod epoch_seconds {
    use super::*;
    use serde::de::Error as DeError;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_i64(ts.timestamp()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(v) => parse_timestamp(&v).map(Some).map_err(DeError::custom),
        }
    }

    fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, String> {
        match value {
            Value::Number(n) => {
                if let Some(secs) = n.as_i64() {
                    Utc.timestamp_opt(secs, 0)
                        .single()
                        .ok_or_else(|| format!("epoch out of range: {secs}"))
                } else if let Some(secs) = n.as_f64() {
                    Utc.timestamp_opt(secs.trunc() as i64, 0)
                        .single()
                        .ok_or_else(|| format!("epoch out of range: {secs}"))
                } else {
                    Err(format!("invalid epoch value: {n}"))
                }
            }
            Value::String(s) => parse_datetime(s).ok_or_else(|| format!("invalid timestamp: {s}")),
            other => Err(format!("invalid timestamp value: {other}")),
        }
    }

    fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Some(ts.with_timezone(&Utc));
        }
        // Space-separated variant, e.g. "2021-01-01 00:00:00+00:00"
        if let Ok(ts) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%:z") {
            return Some(ts.with_timezone(&Utc));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_summary() -> Summary {
        Summary {
            fetched: 100,
            skipped: 10,
            last_uuid: Some("abc123".to_string()),
            min_updated_on: Some(Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap()),
            max_updated_on: Some(Utc.with_ymd_and_hms(2022, 1, 31, 0, 0, 0).unwrap()),
            last_updated_on: Some(Utc.with_ymd_and_hms(2022, 1, 15, 0, 0, 0).unwrap()),
            min_offset: Some(json!(10)),
            max_offset: Some(json!(80)),
            last_offset: Some(json!(75)),
            extras: Some(json!({"key": "value"})),
        }
    }

    #[test]
    fn timestamps_serialize_as_epoch_seconds() {
        let progress = ChroniclerProgress {
            job_id: "12345678".to_string(),
            backend: "git".to_string(),
            category: "commit".to_string(),
            summary: Some(sample_summary()),
        };

        let value = progress.to_value();
        let summary = &value["summary"];
        assert_eq!(summary["min_updated_on"], json!(1640995200));
        assert_eq!(summary["max_updated_on"], json!(1643587200));
        assert_eq!(summary["last_updated_on"], json!(1642204800));
        assert_eq!(summary["fetched"], json!(100));
        assert_eq!(summary["last_offset"], json!(75));
    }

    #[test]
    fn from_value_accepts_iso_timestamps() {
        let data = json!({
            "job_id": "1234567890",
            "backend": "git",
            "category": "commit",
            "summary": {
                "fetched": 10,
                "skipped": 2,
                "min_updated_on": "2021-01-01 00:00:00+00:00",
                "max_updated_on": "2021-01-02T00:00:00+00:00",
                "last_updated_on": "2021-01-03T00:00:00Z",
                "last_uuid": "abc123",
                "min_offset": 1,
                "max_offset": 10,
                "last_offset": 5,
                "extras": {"extra_key": "extra_value"}
            }
        });

        let progress = ChroniclerProgress::from_value(&data).unwrap();
        let summary = progress.summary.unwrap();
        assert_eq!(
            summary.min_updated_on,
            Some(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            summary.max_updated_on,
            Some(Utc.with_ymd_and_hms(2021, 1, 2, 0, 0, 0).unwrap())
        );
        assert_eq!(
            summary.last_updated_on,
            Some(Utc.with_ymd_and_hms(2021, 1, 3, 0, 0, 0).unwrap())
        );
        assert_eq!(summary.last_uuid.as_deref(), Some("abc123"));
        assert_eq!(summary.total(), 12);
    }

    #[test]
    fn progress_round_trips_through_json() {
        let progress = ChroniclerProgress {
            job_id: "job-1".to_string(),
            backend: "git".to_string(),
            category: "commit".to_string(),
            summary: Some(sample_summary()),
        };

        let restored = ChroniclerProgress::from_value(&progress.to_value()).unwrap();
        assert_eq!(restored, progress);
    }

    #[test]
    fn empty_summary_round_trips() {
        let progress = ChroniclerProgress::new("job-2", "git", "commit");
        let restored = ChroniclerProgress::from_value(&progress.to_value()).unwrap();
        assert_eq!(restored, progress);
        assert!(restored.summary.is_none());
    }

    #[test]
    fn summary_update_tracks_bounds() {
        let mut summary = Summary::default();
        let t1 = Utc.with_ymd_and_hms(2021, 5, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2021, 5, 3, 0, 0, 0).unwrap();
        let t3 = Utc.with_ymd_and_hms(2021, 5, 2, 0, 0, 0).unwrap();

        summary.update("a", t1, Some(json!(1)));
        summary.update("b", t2, Some(json!(2)));
        summary.update("c", t3, Some(json!(3)));

        assert_eq!(summary.fetched, 3);
        assert_eq!(summary.min_updated_on, Some(t1));
        assert_eq!(summary.max_updated_on, Some(t2));
        assert_eq!(summary.last_updated_on, Some(t3));
        assert_eq!(summary.min_offset, Some(json!(1)));
        assert_eq!(summary.max_offset, Some(json!(3)));
        assert_eq!(summary.last_uuid.as_deref(), Some("c"));
    }
}
