//! Git datasource backend.
//!
//! Items are commits read from a `git log` dump (`--raw --pretty=fuller`
//! format) pointed to by the `gitpath` job argument. Each commit yields a
//! commit or merge event, one event per touched file, and events for the
//! author and committer identities.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::eventizer::event::Event;
use crate::scheduler::error::JobError;

use super::{Datasource, SourceItem};

const EVENT_COMMIT: &str = "org.grimoirelab.events.git.commit";
const EVENT_MERGE: &str = "org.grimoirelab.events.git.merge";
const EVENT_AUTHORED_BY: &str = "org.grimoirelab.events.git.commit.authored_by";
const EVENT_COMMITTED_BY: &str = "org.grimoirelab.events.git.commit.committed_by";

#[derive(Debug)]
pub struct GitBackend;

#[async_trait]
impl Datasource for GitBackend {
    fn name(&self) -> &'static str {
        "git"
    }

    fn source(&self, job_args: &Value) -> String {
        job_args
            .get("uri")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    async fn fetch(&self, _category: &str, job_args: &Value) -> Result<Vec<SourceItem>, JobError> {
        let gitpath = job_args
            .get("gitpath")
            .and_then(Value::as_str)
            .ok_or_else(|| JobError::Failed(anyhow::anyhow!("missing 'gitpath' job argument")))?;

        let log = tokio::fs::read_to_string(gitpath)
            .await
            .map_err(|e| JobError::Failed(anyhow::anyhow!("cannot read git log {gitpath}: {e}")))?;

        let from_date = job_args
            .get("from_date")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|ts| ts.with_timezone(&Utc));

        let commits = parse_git_log(&log)
            .map_err(|e| JobError::Failed(anyhow::anyhow!("malformed git log {gitpath}: {e}")))?;

        let items = commits
            .into_iter()
            .filter(|c| from_date.map(|from| c.commit_date >= from).unwrap_or(true))
            .map(|c| {
                let updated_on = c.commit_date;
                let uuid = c.hash.clone();
                SourceItem {
                    offset: Some(Value::String(c.hash.clone())),
                    uuid,
                    updated_on,
                    data: c.into_value(),
                }
            })
            .collect();

        Ok(items)
    }

    fn eventize(&self, source: &str, item: &SourceItem) -> Vec<Event> {
        let data = &item.data;
        let hash = item.uuid.as_str();
        let time = item.updated_on.timestamp();
        let is_merge = data.get("Merge").is_some();

        let commit_type = if is_merge { EVENT_MERGE } else { EVENT_COMMIT };
        let mut events = vec![Event::new(
            commit_type,
            source,
            time,
            &[hash],
            data.clone(),
        )];

        if let Some(files) = data.get("files").and_then(Value::as_array) {
            for file in files {
                let (Some(path), Some(action)) = (
                    file.get("file").and_then(Value::as_str),
                    file.get("action").and_then(Value::as_str),
                ) else {
                    continue;
                };
                let event_type = file_event_type(action);
                events.push(Event::new(
                    event_type,
                    source,
                    time,
                    &[hash, path],
                    json!({"commit": hash, "file": path, "action": action}),
                ));
            }
        }

        if let Some(author) = data.get("Author").and_then(Value::as_str) {
            events.push(Event::new(
                EVENT_AUTHORED_BY,
                source,
                time,
                &[hash, author],
                json!({
                    "commit": hash,
                    "Author": author,
                    "AuthorDate": data.get("AuthorDate").cloned().unwrap_or(Value::Null),
                }),
            ));
        }

        if let Some(committer) = data.get("Commit").and_then(Value::as_str) {
            events.push(Event::new(
                EVENT_COMMITTED_BY,
                source,
                time,
                &[hash, committer],
                json!({
                    "commit": hash,
                    "Commit": committer,
                    "CommitDate": data.get("CommitDate").cloned().unwrap_or(Value::Null),
                }),
            ));
        }

        events
    }
}

fn file_event_type(action: &str) -> &'static str {
    match action.chars().next() {
        Some('A') => "org.grimoirelab.events.git.file.added",
        Some('D') => "org.grimoirelab.events.git.file.deleted",
        Some('R') | Some('C') => "org.grimoirelab.events.git.file.replaced",
        _ => "org.grimoirelab.events.git.file.modified",
    }
}

#[derive(Debug, Clone)]
struct GitCommit {
    hash: String,
    merge: Option<String>,
    author: Option<String>,
    author_date: Option<String>,
    committer: Option<String>,
    commit_date_raw: Option<String>,
    commit_date: DateTime<Utc>,
    message: Vec<String>,
    files: Vec<(String, String)>,
}

impl GitCommit {
    fn new(hash: &str) -> Self {
        Self {
            hash: hash.to_string(),
            merge: None,
            author: None,
            author_date: None,
            committer: None,
            commit_date_raw: None,
            commit_date: Utc::now(),
            message: Vec::new(),
            files: Vec::new(),
        }
    }

    fn into_value(self) -> Value {
        let files: Vec<Value> = self
            .files
            .iter()
            .map(|(action, file)| json!({"action": action, "file": file}))
            .collect();

        let mut object = serde_json::Map::new();
        object.insert("commit".to_string(), Value::String(self.hash));
        object.insert(
            "message".to_string(),
            Value::String(self.message.join("\n")),
        );
        object.insert("files".to_string(), Value::Array(files));
        if let Some(merge) = self.merge {
            object.insert("Merge".to_string(), Value::String(merge));
        }
        if let Some(author) = self.author {
            object.insert("Author".to_string(), Value::String(author));
        }
        if let Some(date) = self.author_date {
            object.insert("AuthorDate".to_string(), Value::String(date));
        }
        if let Some(committer) = self.committer {
            object.insert("Commit".to_string(), Value::String(committer));
        }
        if let Some(date) = self.commit_date_raw {
            object.insert("CommitDate".to_string(), Value::String(date));
        }
        Value::Object(object)
    }
}

/// Parse `git log --raw --pretty=fuller` output into commits.
fn parse_git_log(log: &str) -> Result<Vec<GitCommit>, String> {
    let mut commits: Vec<GitCommit> = Vec::new();
    let mut current: Option<GitCommit> = None;

    for line in log.lines() {
        if let Some(rest) = line.strip_prefix("commit ") {
            if let Some(commit) = current.take() {
                commits.push(commit);
            }
            let hash = rest.split_whitespace().next().ok_or("empty commit line")?;
            current = Some(GitCommit::new(hash));
            continue;
        }

        let Some(commit) = current.as_mut() else {
            continue;
        };

        if let Some(rest) = line.strip_prefix("Merge:") {
            commit.merge = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("AuthorDate:") {
            let raw = rest.trim().to_string();
            commit.author_date = Some(raw);
        } else if let Some(rest) = line.strip_prefix("Author:") {
            commit.author = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("CommitDate:") {
            let raw = rest.trim().to_string();
            commit.commit_date = parse_git_date(&raw)
                .ok_or_else(|| format!("invalid CommitDate '{raw}' in {}", commit.hash))?;
            commit.commit_date_raw = Some(raw);
        } else if let Some(rest) = line.strip_prefix("Commit:") {
            commit.committer = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix(':') {
            // :100644 100644 e69de29 d00491f M	path/to/file
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() >= 5 {
                if let (Some(action), Some(file)) = (fields.get(4), fields.last()) {
                    commit.files.push((action.to_string(), file.to_string()));
                }
            }
        } else if let Some(text) = line.strip_prefix("    ") {
            commit.message.push(text.to_string());
        }
    }

    if let Some(commit) = current.take() {
        commits.push(commit);
    }

    Ok(commits)
}

/// Parse the default git log date format, e.g. `Tue Feb 11 22:10:39 2014 -0800`.
fn parse_git_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%a %b %e %H:%M:%S %Y %z")
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE_LOG: &str = "\
commit 456a68ee1407a77f3e804a30dff245bb6c6b872f
Merge: ce8e0b8 51a3b65
Author:     Eduardo Morais <companheiro.vermelho@example.com>
AuthorDate: Tue Feb 11 22:10:39 2014 -0800
Commit:     Eduardo Morais <companheiro.vermelho@example.com>
CommitDate: Tue Feb 11 22:10:39 2014 -0800

    Merge branch 'lzp'

    Conflicts:
        aaa/otherthing

:100644 100644 e69de29 d00491f M\taaa/otherthing
:100644 100644 e69de29 d00491f R100\tbbb/something

commit ce8e0b86a1e9877f42fe9453ede418519115f367
Author:     Eduardo Morais <companheiro.vermelho@example.com>
AuthorDate: Tue Aug 14 14:30:13 2012 -0300
Commit:     Eduardo Morais <companheiro.vermelho@example.com>
CommitDate: Tue Aug 14 14:30:13 2012 -0300

    Add a new file

:000000 100644 0000000 e69de29 A\tbbb/bthing
";

    #[test]
    fn parse_log_extracts_commits() {
        let commits = parse_git_log(SAMPLE_LOG).unwrap();
        assert_eq!(commits.len(), 2);

        let merge = &commits[0];
        assert_eq!(merge.hash, "456a68ee1407a77f3e804a30dff245bb6c6b872f");
        assert!(merge.merge.is_some());
        assert_eq!(merge.files.len(), 2);
        assert_eq!(merge.files[0], ("M".to_string(), "aaa/otherthing".to_string()));
        assert_eq!(
            merge.commit_date,
            Utc.with_ymd_and_hms(2014, 2, 12, 6, 10, 39).unwrap()
        );

        let plain = &commits[1];
        assert!(plain.merge.is_none());
        assert_eq!(plain.files[0], ("A".to_string(), "bbb/bthing".to_string()));
    }

    #[test]
    fn merge_commits_yield_merge_events() {
        let commits = parse_git_log(SAMPLE_LOG).unwrap();
        let commit = commits[0].clone();
        let item = SourceItem {
            uuid: commit.hash.clone(),
            updated_on: commit.commit_date,
            offset: Some(Value::String(commit.hash.clone())),
            data: commit.into_value(),
        };

        let events = GitBackend.eventize("http://example.com/", &item);
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();

        assert_eq!(
            types,
            vec![
                "org.grimoirelab.events.git.merge",
                "org.grimoirelab.events.git.file.modified",
                "org.grimoirelab.events.git.file.replaced",
                "org.grimoirelab.events.git.commit.authored_by",
                "org.grimoirelab.events.git.commit.committed_by",
            ]
        );
        assert!(events.iter().all(|e| e.source == "http://example.com/"));
    }

    #[test]
    fn plain_commits_yield_commit_events() {
        let commits = parse_git_log(SAMPLE_LOG).unwrap();
        let commit = commits[1].clone();
        let item = SourceItem {
            uuid: commit.hash.clone(),
            updated_on: commit.commit_date,
            offset: Some(Value::String(commit.hash.clone())),
            data: commit.into_value(),
        };

        let events = GitBackend.eventize("http://example.com/", &item);
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();

        assert_eq!(
            types,
            vec![
                "org.grimoirelab.events.git.commit",
                "org.grimoirelab.events.git.file.added",
                "org.grimoirelab.events.git.commit.authored_by",
                "org.grimoirelab.events.git.commit.committed_by",
            ]
        );
    }

    #[test]
    fn commit_data_keeps_git_log_date_format() {
        let commits = parse_git_log(SAMPLE_LOG).unwrap();
        let data = commits[0].clone().into_value();
        assert_eq!(
            data["CommitDate"],
            Value::String("Tue Feb 11 22:10:39 2014 -0800".to_string())
        );
    }

    #[tokio::test]
    async fn fetch_honors_from_date() {
        let dir = std::env::temp_dir().join(format!("gitlog-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("git_log.txt");
        std::fs::write(&path, SAMPLE_LOG).unwrap();

        let job_args = json!({
            "uri": "http://example.com/",
            "gitpath": path.to_str().unwrap(),
            "from_date": "2013-01-01T00:00:00Z",
        });

        let items = GitBackend.fetch("commit", &job_args).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].uuid, "456a68ee1407a77f3e804a30dff245bb6c6b872f");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn fetch_without_gitpath_fails() {
        let err = GitBackend
            .fetch("commit", &json!({"uri": "http://example.com/"}))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Failed(_)));
    }
}
