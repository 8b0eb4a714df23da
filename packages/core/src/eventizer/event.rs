//! Event envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A single event produced by a chronicler run.
///
/// `id` is globally unique; the archivist uses it as the index document id,
/// which makes bulk writes idempotent upserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Origin URL of the repository the event came from.
    pub source: String,
    /// Event time as epoch seconds.
    pub time: i64,
    pub data: Value,
}

impl Event {
    pub fn new(event_type: &str, source: &str, time: i64, id_parts: &[&str], data: Value) -> Self {
        Self {
            id: event_id(event_type, id_parts),
            event_type: event_type.to_string(),
            source: source.to_string(),
            time,
            data,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Deterministic event identifier: a hex digest over the event type and the
/// identity fields of the underlying item.
pub fn event_id(event_type: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_bytes());
    for part in parts {
        hasher.update(b"\x00");
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_serializes_with_type_field() {
        let event = Event::new(
            "org.grimoirelab.events.git.commit",
            "http://example.com/",
            1392185439,
            &["abcdef"],
            json!({"message": "initial"}),
        );

        let value = event.to_value();
        assert_eq!(value["type"], json!("org.grimoirelab.events.git.commit"));
        assert_eq!(value["source"], json!("http://example.com/"));
        assert_eq!(value["time"], json!(1392185439));
        assert_eq!(value["data"]["message"], json!("initial"));
    }

    #[test]
    fn ids_are_stable_and_distinct() {
        let a = event_id("org.grimoirelab.events.git.commit", &["abc"]);
        let b = event_id("org.grimoirelab.events.git.commit", &["abc"]);
        let c = event_id("org.grimoirelab.events.git.merge", &["abc"]);
        let d = event_id("org.grimoirelab.events.git.commit", &["abd"]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn id_digest_is_the_documented_composition() {
        // SHA-256 over the event type and the NUL-separated identity parts.
        assert_eq!(
            event_id("org.grimoirelab.events.git.commit", &["abcdef"]),
            "7d154176419a8e0ed8e80514797f70dec97a7c5380eb569e073c89ef0ac580b8"
        );
    }
}
