//! # statsync-worker
//!
//! Runs the statsync engine: the leaderboard sweep and the refresh consumer
//! pool, side by side, until interrupted.
//!
//! ## Usage
//!
//! ```bash
//! # Sweep and consume until Ctrl-C (default)
//! STATSYNC_API_BASE_URL=https://api.example.com STATSYNC_API_KEY=... statsync-worker run
//!
//! # One sweep tick, then exit
//! statsync-worker tick-once
//!
//! # Expose Prometheus metrics
//! statsync-worker --metrics-port 9090 run
//! ```
//!
//! Engine settings come from `STATSYNC_*` environment variables; see
//! `statsync_engine::config`.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;

use statsync_core::kv::memory::MemoryStore;
use statsync_core::kv::reconnect::{ReconnectingStore, SharedConnector};
use statsync_core::kv::CoordinationStore;
use statsync_core::{init_logging, DistributedLock, LogFormat};
use statsync_engine::backfill::Backfill;
use statsync_engine::budget::TokenBudgetLimiter;
use statsync_engine::config::{SyncConfig, BUDGET_NAME, SWEEP_LOCK_KEY};
use statsync_engine::consumer::RefreshConsumer;
use statsync_engine::cursor::CursorStore;
use statsync_engine::gateway::http::HttpRemoteApi;
use statsync_engine::gateway::RemoteApiGateway;
use statsync_engine::metrics::describe_metrics;
use statsync_engine::queue::memory::InMemoryQueueStore;
use statsync_engine::queue::{QueueStore, RefreshQueue};
use statsync_engine::repository::memory::InMemoryRepository;
use statsync_engine::repository::Repository;
use statsync_engine::sweep::{SweepScheduler, TickOutcome};

/// Statsync worker.
#[derive(Debug, Parser)]
#[command(name = "statsync-worker")]
#[command(about = "Keeps local game statistics in step with a quota-limited remote API")]
#[command(version)]
struct Args {
    /// Port for the Prometheus metrics endpoint; disabled when unset.
    #[arg(long, env = "STATSYNC_METRICS_PORT", global = true)]
    metrics_port: Option<u16>,

    /// Log output format (`pretty` or `json`).
    #[arg(long, env = "STATSYNC_LOG_FORMAT", default_value = "pretty", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the sweep and the refresh consumer until interrupted.
    Run,

    /// Run a single sweep tick and exit.
    TickOnce,
}

/// Every long-lived component, wired together.
struct Engine {
    scheduler: Arc<SweepScheduler>,
    consumer: Arc<RefreshConsumer>,
}

fn build(config: &SyncConfig) -> Result<Engine> {
    // Only the in-memory backend ships; it still goes through the
    // reconnecting wrapper so a networked backend can slot in behind it.
    let backend: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let store: Arc<dyn CoordinationStore> = Arc::new(ReconnectingStore::new(Arc::new(
        SharedConnector::new(backend, config.store_url.clone()),
    )));

    let limiter = Arc::new(TokenBudgetLimiter::new(
        Arc::clone(&store),
        BUDGET_NAME,
        config.budget.clone(),
    ));
    let api = HttpRemoteApi::new(
        &config.api_base_url,
        config.api_key.clone(),
        config.gateway.request_timeout,
    )
    .context("building HTTP client")?;
    let gateway = Arc::new(RemoteApiGateway::new(
        Arc::new(api),
        limiter,
        config.gateway.clone(),
    ));

    let repository: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
    let queue_store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::new());
    let queue = Arc::new(RefreshQueue::new(Arc::clone(&queue_store)));

    let cursors = Arc::new(
        CursorStore::new(
            Arc::clone(&store),
            config.tiers.clone(),
            config.regions.clone(),
        )
        .context("building cursor store")?,
    );
    let lock = DistributedLock::new(Arc::clone(&store), SWEEP_LOCK_KEY)
        .with_ttl(config.lock_ttl)
        .with_heartbeat_interval(config.heartbeat_interval);
    let backfill = Arc::new(Backfill::new(
        Arc::clone(&repository),
        queue,
        config.backfill.clone(),
    ));

    let scheduler = SweepScheduler::new(
        Arc::clone(&gateway),
        cursors,
        lock,
        Arc::clone(&repository),
        config.sweep.clone(),
    )
    .with_backfill(backfill);
    let consumer = RefreshConsumer::new(
        queue_store,
        gateway,
        repository,
        config.consumer.clone(),
    );

    Ok(Engine {
        scheduler: Arc::new(scheduler),
        consumer: Arc::new(consumer),
    })
}

fn install_metrics_exporter(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing Prometheus exporter")?;
    describe_metrics();
    tracing::info!(%addr, "Prometheus metrics endpoint listening");
    Ok(())
}

async fn run(engine: Engine) -> Result<()> {
    let shutdown = CancellationToken::new();

    let sweep = {
        let scheduler = Arc::clone(&engine.scheduler);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };
    let consume = tokio::spawn(Arc::clone(&engine.consumer).run(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    tracing::info!("shutdown requested; draining");
    shutdown.cancel();

    sweep.await.context("sweep task panicked")?;
    consume.await.context("consumer task panicked")?;
    tracing::info!("statsync worker stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(LogFormat::from_name(&args.log_format));

    let config = SyncConfig::from_env().context("loading configuration")?;
    tracing::info!(config = ?config, "starting statsync worker");

    if let Some(port) = args.metrics_port {
        install_metrics_exporter(port)?;
    }

    let engine = build(&config)?;

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => run(engine).await,
        Commands::TickOnce => {
            match engine.scheduler.tick().await? {
                TickOutcome::Completed(summary) => tracing::info!(
                    tick = summary.tick,
                    ok = summary.partitions_ok,
                    failed = summary.partitions_failed,
                    players = summary.players_persisted,
                    "tick completed"
                ),
                TickOutcome::Skipped(reason) => tracing::info!(reason = ?reason, "tick skipped"),
            }
            Ok(())
        }
    }
}
