// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! EDA Lifecycle - Activation Lifecycle Manager
//!
//! Runs the scheduler and the worker pools, together or one role per
//! process:
//! - `all`: scheduler plus both worker pools
//! - `scheduler`: reconciliation loop only
//! - `worker --class DefaultWorker|ActivationWorker`: one worker pool

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use eda_lifecycle::config::Config;
use eda_lifecycle::container::{ContainerRuntime, PodmanRuntime};
use eda_lifecycle::log_relay::{LogSink, TracingLogSink, WebsocketLogSink};
use eda_lifecycle::migrations;
use eda_lifecycle::persistence::{self, Persistence, PostgresPersistence, SqlitePersistence};
use eda_lifecycle::queue::{JobQueue, PoolName, PostgresJobQueue, SqliteJobQueue};
use eda_lifecycle::runtime::{LifecycleRuntime, Roles};

#[derive(Parser)]
#[command(
    name = "eda-lifecycle",
    version,
    about = "Activation lifecycle manager for event-driven automation"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and both worker pools
    All,
    /// Run only the scheduler
    Scheduler,
    /// Run one worker pool
    Worker {
        /// Worker class: DefaultWorker or ActivationWorker
        #[arg(long, env = "EDA_WORKER_CLASS", value_parser = parse_pool)]
        class: PoolName,
    },
}

fn parse_pool(value: &str) -> Result<PoolName, String> {
    value.parse().map_err(|e: eda_lifecycle::Error| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eda_lifecycle=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let cli = Cli::parse();
    let roles = match cli.command.unwrap_or(Command::All) {
        Command::All => Roles::all(),
        Command::Scheduler => Roles::scheduler(),
        Command::Worker { class } => Roles::worker(class),
    };

    let config = Config::from_env()?;

    info!(
        max_running_activations = config.max_running_activations,
        scheduler = roles.scheduler,
        default_worker = roles.default_worker,
        activation_worker = roles.activation_worker,
        "Starting EDA lifecycle manager"
    );

    let (persistence, queue): (Arc<dyn Persistence>, Arc<dyn JobQueue>) =
        if config.database_url.starts_with("sqlite:") {
            let pool = persistence::sqlite::connect_pool(&config.database_url).await?;
            (
                Arc::new(SqlitePersistence::new(pool.clone())),
                Arc::new(SqliteJobQueue::new(pool)),
            )
        } else {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(&config.database_url)
                .await?;
            migrations::run_postgres(&pool).await?;
            (
                Arc::new(PostgresPersistence::new(pool.clone())),
                Arc::new(PostgresJobQueue::new(pool)),
            )
        };

    persistence.health_check().await?;
    info!("Connected to database");

    let container_runtime = Arc::new(PodmanRuntime::connect(config.podman_socket_url.as_deref())?);
    match container_runtime.ping().await {
        Ok(()) => info!(
            runtime_type = container_runtime.runtime_type(),
            endpoint = container_runtime.endpoint(),
            "Container engine reachable"
        ),
        Err(e) => warn!(error = %e, "Container engine not reachable yet"),
    }

    let log_sink: Arc<dyn LogSink> = match &config.websocket_base_url {
        Some(url) => Arc::new(WebsocketLogSink::new(url.clone())),
        None => Arc::new(TracingLogSink),
    };

    let runtime = LifecycleRuntime::builder()
        .persistence(persistence)
        .queue(queue)
        .container_runtime(container_runtime)
        .log_sink(log_sink)
        .config(config)
        .roles(roles)
        .build()?
        .start()
        .await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("EDA lifecycle manager shut down");

    Ok(())
}
