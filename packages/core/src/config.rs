use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables.
///
/// The configuration is built once at process start and injected into the
/// scheduler, workers and archivist; there is no module-level mutable state.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Name of the append-only stream where eventizer jobs publish events.
    pub events_stream: String,
    /// Maximum number of entries kept in the events stream. Oldest entries
    /// are evicted once the limit is reached.
    pub events_stream_max_length: usize,
    /// Queue where eventizer jobs are dispatched.
    pub eventizer_queue: String,
    /// Queue where identity jobs are dispatched.
    pub identities_queue: String,
    /// Hard per-job execution timeout, in seconds.
    pub job_timeout: u64,
    /// Username the identity jobs run under.
    pub system_bot_user: String,
    pub archivist: ArchivistConfig,
}

/// Connection settings for the search index the archivist writes to.
#[derive(Debug, Clone)]
pub struct ArchivistConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub index: String,
    pub bulk_size: usize,
    pub verify_certs: bool,
    /// Number of competing consumers draining the events stream.
    pub workers: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            events_stream: env::var("EVENTS_STREAM_NAME").unwrap_or_else(|_| "events".to_string()),
            events_stream_max_length: env::var("EVENTS_STREAM_MAX_LENGTH")
                .unwrap_or_else(|_| "1000000".to_string())
                .parse()
                .context("EVENTS_STREAM_MAX_LENGTH must be a valid number")?,
            eventizer_queue: env::var("Q_EVENTIZER_JOBS")
                .unwrap_or_else(|_| "eventizer_jobs".to_string()),
            identities_queue: env::var("Q_IDENTITIES_JOBS")
                .unwrap_or_else(|_| "identities_jobs".to_string()),
            job_timeout: env::var("JOB_TIMEOUT")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .context("JOB_TIMEOUT must be a valid number")?,
            system_bot_user: env::var("SYSTEM_BOT_USER")
                .unwrap_or_else(|_| "grimoirelab".to_string()),
            archivist: ArchivistConfig::from_env()?,
        })
    }
}

impl ArchivistConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            url: env::var("STORAGE_URL").unwrap_or_else(|_| "https://localhost:9200".to_string()),
            user: env::var("STORAGE_USERNAME").ok(),
            password: env::var("STORAGE_PASSWORD").ok(),
            index: env::var("STORAGE_INDEX").unwrap_or_else(|_| "events".to_string()),
            bulk_size: env::var("STORAGE_BULK_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .context("STORAGE_BULK_SIZE must be a valid number")?,
            verify_certs: env::var("STORAGE_VERIFY_CERT")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            workers: env::var("ARCHIVIST_WORKERS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("ARCHIVIST_WORKERS must be a valid number")?,
        })
    }
}

impl Default for Config {
    /// Configuration suitable for tests and local development: in-memory
    /// friendly defaults, no database URL.
    fn default() -> Self {
        Self {
            database_url: String::new(),
            port: 8000,
            events_stream: "events".to_string(),
            events_stream_max_length: 1_000_000,
            eventizer_queue: "eventizer_jobs".to_string(),
            identities_queue: "identities_jobs".to_string(),
            job_timeout: 3600,
            system_bot_user: "grimoirelab".to_string(),
            archivist: ArchivistConfig {
                url: "https://localhost:9200".to_string(),
                user: None,
                password: None,
                index: "events".to_string(),
                bulk_size: 100,
                verify_certs: false,
                workers: 10,
            },
        }
    }
}
