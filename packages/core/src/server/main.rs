//! HTTP API server.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use grimoirelab_core::scheduler::runner::{LiveLogRegistry, QueueJobRunner};
use grimoirelab_core::scheduler::tasks::identities::ImporterRegistry;
use grimoirelab_core::scheduler::tasks::register_default_task_types;
use grimoirelab_core::scheduler::{PgTaskStore, Scheduler, TaskRegistry};
use grimoirelab_core::server::{build_router, AppState};
use grimoirelab_core::Config;

#[derive(Parser)]
#[command(name = "server", about = "GrimoireLab Core API server")]
struct Args {
    /// Port to listen on; overrides the PORT environment variable.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(port) = args.port {
        config.port = port;
    }

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let mut registry = TaskRegistry::new();
    register_default_task_types(&mut registry, &config, Arc::new(ImporterRegistry::new()))
        .map_err(|e| anyhow::anyhow!(e))?;

    let store = Arc::new(PgTaskStore::new(pool));
    let runner = Arc::new(QueueJobRunner::new(store.clone(), LiveLogRegistry::new()));
    let scheduler = Arc::new(Scheduler::new(
        store,
        Arc::new(registry),
        runner,
        config.clone(),
    ));

    let app = build_router(AppState::new(scheduler));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .context("failed to bind the listen port")?;

    info!(port = config.port, "API server listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
