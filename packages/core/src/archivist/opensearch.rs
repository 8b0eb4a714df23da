//! OpenSearch archivist.
//!
//! Bulk-writes stream entries into a search index, keyed by event id so
//! rewrites are idempotent upserts. Only entries whose item write succeeded
//! are acknowledged; failed entries stay pending and are retried later. A
//! whole-request failure counts zero inserts and acks nothing.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::ArchivistConfig;
use crate::stream::Entry;

use super::consumer::{Consumer, StreamAcker};

/// Index mapping: dates accept ISO or epoch forms, strings default to
/// keyword, commit messages are searchable text, and the git-log date
/// variants of `AuthorDate`/`CommitDate` parse as dates.
pub fn index_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "time": {
                    "type": "date",
                    "format": "strict_date_optional_time||epoch_second",
                },
                "data": {
                    "properties": {
                        "message": {
                            "type": "text",
                            "index": true,
                        },
                        "AuthorDate": {
                            "type": "date",
                            "format": "EEE MMM d HH:mm:ss yyyy Z||EEE MMM d HH:mm:ss yyyy||strict_date_optional_time||epoch_millis",
                        },
                        "CommitDate": {
                            "type": "date",
                            "format": "EEE MMM d HH:mm:ss yyyy Z||EEE MMM d HH:mm:ss yyyy||strict_date_optional_time||epoch_millis",
                        },
                    }
                },
            },
            "dynamic_templates": [
                {
                    "notanalyzed": {
                        "match": "*",
                        "match_mapping_type": "string",
                        "mapping": {
                            "type": "keyword",
                        },
                    }
                },
                {
                    "formatdate": {
                        "match": "*",
                        "match_mapping_type": "date",
                        "mapping": {
                            "type": "date",
                            "format": "strict_date_optional_time||epoch_millis",
                        },
                    }
                },
            ],
        }
    })
}

/// Store entries in an OpenSearch instance.
pub struct OpenSearchArchivist {
    client: reqwest::Client,
    base_url: String,
    index: String,
    bulk_size: usize,
    auth: Option<(String, String)>,
}

impl OpenSearchArchivist {
    pub fn new(config: &ArchivistConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_certs)
            .build()
            .context("failed to build the OpenSearch client")?;

        let auth = match (&config.user, &config.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            index: config.index.clone(),
            bulk_size: config.bulk_size,
            auth,
        })
    }

    /// Create the index with the fixed mapping; an already-existing index is
    /// fine.
    pub async fn ensure_index(&self) -> Result<()> {
        let url = format!("{}/{}", self.base_url, self.index);
        let mut request = self.client.put(&url).json(&index_mapping());
        if let Some((user, password)) = &self.auth {
            request = request.basic_auth(user, Some(password));
        }

        let response = request.send().await.context("index creation request failed")?;
        if response.status() == StatusCode::BAD_REQUEST {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let error_type = body["error"]["type"].as_str().unwrap_or_default();
            if error_type == "resource_already_exists_exception" {
                return Ok(());
            }
            anyhow::bail!("index creation failed: {body}");
        }
        response
            .error_for_status()
            .context("index creation failed")?;
        Ok(())
    }

    /// Issue one bulk request. Returns the number of items inserted and the
    /// ids of the items that failed.
    async fn bulk(&self, body: String) -> (usize, Vec<String>) {
        let url = format!("{}/{}/_bulk", self.base_url, self.index);
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/x-ndjson")
            .body(body);
        if let Some((user, password)) = &self.auth {
            request = request.basic_auth(user, Some(password));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "failed to insert data into the index");
                return (0, Vec::new());
            }
        };

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "invalid bulk response");
                return (0, Vec::new());
            }
        };

        let (inserted, failed_ids) = parse_bulk_response(&body);
        info!(inserted, failed = failed_ids.len(), "items uploaded to the index");
        (inserted, failed_ids)
    }
}

#[async_trait]
impl Consumer for OpenSearchArchivist {
    async fn process_entries(
        &self,
        entries: Vec<Entry>,
        recovery: bool,
        acker: &StreamAcker,
    ) -> Result<()> {
        // Recovery reprocesses one entry per request so a single oversized
        // entry cannot poison a whole batch again.
        let bulk_size = if recovery { 1 } else { self.bulk_size };

        for chunk in entries.chunks(bulk_size.max(1)) {
            let entry_map: HashMap<String, String> = chunk
                .iter()
                .filter_map(|entry| {
                    entry.event["id"]
                        .as_str()
                        .map(|id| (id.to_string(), entry.message_id.clone()))
                })
                .collect();

            let body = build_bulk_body(chunk);
            let (inserted, failed_ids) = self.bulk(body).await;

            if inserted > 0 {
                let acks = plan_acks(entry_map, &failed_ids);
                acker.ack(&acks).await?;
            }
        }
        Ok(())
    }
}

/// NDJSON body of a bulk index request, one action line per entry keyed by
/// the event id.
pub fn build_bulk_body(entries: &[Entry]) -> String {
    let mut body = String::new();
    for entry in entries {
        let Some(id) = entry.event["id"].as_str() else {
            continue;
        };
        body.push_str(&json!({"index": {"_id": id}}).to_string());
        body.push('\n');
        body.push_str(&entry.event.to_string());
        body.push('\n');
    }
    body
}

/// Extract the insert count and failed item ids from a bulk response.
pub fn parse_bulk_response(response: &Value) -> (usize, Vec<String>) {
    let items = response["items"].as_array().cloned().unwrap_or_default();
    let mut failed_ids = Vec::new();

    if response["errors"].as_bool().unwrap_or(false) {
        let mut last_error = None;
        for item in &items {
            if item["index"].get("error").is_some() {
                if let Some(id) = item["index"]["_id"].as_str() {
                    failed_ids.push(id.to_string());
                }
                last_error = Some(item["index"]["error"].to_string());
            }
        }
        if let Some(error) = last_error {
            warn!(error = %error, "failed to insert data into the index");
        }
    }

    (items.len() - failed_ids.len(), failed_ids)
}

/// Message ids to acknowledge: everything in the batch except failed items.
pub fn plan_acks(mut entry_map: HashMap<String, String>, failed_ids: &[String]) -> Vec<String> {
    for failed in failed_ids {
        entry_map.remove(failed);
    }
    let mut acks: Vec<String> = entry_map.into_values().collect();
    acks.sort_unstable();
    acks
}
