//! Scheduler worker process.
//!
//! Claims jobs from the eventizer and identities queues, runs them, and
//! drains the events the eventizer jobs produce into the search index
//! through the archivist consumer pool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use grimoirelab_core::archivist::{ConsumerPool, ConsumerPoolConfig, OpenSearchArchivist};
use grimoirelab_core::eventizer::backends::BackendRegistry;
use grimoirelab_core::scheduler::registry::SchedulerServices;
use grimoirelab_core::scheduler::runner::{LiveLogRegistry, QueueJobRunner};
use grimoirelab_core::scheduler::tasks::identities::{ImporterRegistry, NullIdentityService};
use grimoirelab_core::scheduler::tasks::register_default_task_types;
use grimoirelab_core::scheduler::{
    JobWorker, JobWorkerConfig, PgTaskStore, Scheduler, TaskRegistry,
};
use grimoirelab_core::stream::MemoryEventStream;
use grimoirelab_core::Config;

#[derive(Parser)]
#[command(name = "worker", about = "GrimoireLab Core scheduler worker")]
struct Args {
    /// Number of concurrent job workers.
    #[arg(long, default_value_t = 2)]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the database")?;

    let importers = Arc::new(ImporterRegistry::new());
    let mut registry = TaskRegistry::new();
    register_default_task_types(&mut registry, &config, importers.clone())
        .map_err(|e| anyhow::anyhow!(e))?;

    let store = Arc::new(PgTaskStore::new(pool));
    let live_logs = LiveLogRegistry::new();
    let runner = Arc::new(QueueJobRunner::new(store.clone(), live_logs.clone()));
    let scheduler = Arc::new(Scheduler::new(
        store,
        Arc::new(registry),
        runner,
        config.clone(),
    ));

    let stream = MemoryEventStream::shared();
    let services = Arc::new(SchedulerServices {
        config: config.clone(),
        stream: stream.clone(),
        backends: Arc::new(BackendRegistry::with_defaults()),
        identities: Arc::new(NullIdentityService),
        importers,
    });

    let shutdown = CancellationToken::new();
    let queues = vec![
        config.eventizer_queue.clone(),
        config.identities_queue.clone(),
    ];

    let mut handles = Vec::new();
    for _ in 0..args.workers {
        let worker = JobWorker::new(
            scheduler.clone(),
            services.clone(),
            live_logs.clone(),
            JobWorkerConfig {
                job_timeout: Duration::from_secs(config.job_timeout),
                ..JobWorkerConfig::for_queues(queues.clone())
            },
        );
        handles.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    let archivist = OpenSearchArchivist::new(&config.archivist)?;
    archivist
        .ensure_index()
        .await
        .context("failed to set up the events index")?;
    let archivists = ConsumerPool::new(
        stream,
        Arc::new(archivist),
        ConsumerPoolConfig {
            stream: config.events_stream.clone(),
            group: "archivists".to_string(),
            consumers: config.archivist.workers,
            batch_size: config.archivist.bulk_size,
            poll_interval: Duration::from_secs(1),
        },
    );
    handles.push(tokio::spawn(archivists.run(shutdown.clone())));

    info!(workers = args.workers, "worker process started");
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    shutdown.cancel();

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}
