//! Datasource backends.
//!
//! A backend knows how to fetch items from one kind of repository and how to
//! convert each item into events. Backends register by datasource type;
//! a chronicler job resolving an unregistered type fails with
//! `BackendNotFound`.

pub mod git;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::eventizer::event::Event;
use crate::scheduler::error::JobError;

/// One item fetched from a datasource.
#[derive(Debug, Clone)]
pub struct SourceItem {
    /// Stable identifier of the item within its repository.
    pub uuid: String,
    /// When the item last changed upstream.
    pub updated_on: DateTime<Utc>,
    /// Backend-specific resume point, when the datasource has one.
    pub offset: Option<Value>,
    pub data: Value,
}

#[async_trait]
pub trait Datasource: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Origin URL recorded as the `source` of every produced event.
    fn source(&self, job_args: &Value) -> String;

    /// Fetch the items selected by the job arguments, honoring `from_date` /
    /// `offset` bounds.
    async fn fetch(&self, category: &str, job_args: &Value) -> Result<Vec<SourceItem>, JobError>;

    /// Convert one item into its events.
    fn eventize(&self, source: &str, item: &SourceItem) -> Vec<Event>;
}

/// Registry of datasource backends, keyed by datasource type.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<&'static str, Arc<dyn Datasource>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Registry with all built-in backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(git::GitBackend));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn Datasource>) {
        self.backends.insert(backend.name(), backend);
    }

    pub fn lookup(&self, datasource_type: &str) -> Result<Arc<dyn Datasource>, JobError> {
        self.backends
            .get(datasource_type)
            .cloned()
            .ok_or_else(|| JobError::BackendNotFound(datasource_type.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.backends.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
