//! Zen Worker - Main entry point

use anyhow::{Context, Result};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use zen_common::logging::{init_logging, LogConfig};

use zen_worker::config::Config;
use zen_worker::db::{self, create_pool};
use zen_worker::extractor::CommandExtractor;
use zen_worker::lease::{LeaseCounters, LeaseRegistry, LeaseStatus};
use zen_worker::merge::MergeEngine;
use zen_worker::pipeline::{LocalScheduler, MergeSink, QueueSource};
use zen_worker::queue::WorkQueue;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging with configuration from environment
    let log_config = LogConfig::builder()
        .log_file_prefix("zen-worker")
        .filter_directives("zen_worker=debug,zen_common=debug,sqlx=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        },
    };

    match run().await {
        Ok(()) => {
            info!("Worker stopped");
            ExitCode::SUCCESS
        },
        Err(e) => {
            error!(error = format!("{e:#}"), "Worker stopped on unrecoverable error");
            ExitCode::FAILURE
        },
    }
}

async fn run() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    let worker_id = config.worker.worker_id.clone();
    info!(worker_id = %worker_id, "Starting zen worker");

    let db_config = config
        .db_config()
        .sized_for(&config.pool_sizing())
        .context("Invalid connection pool sizing")?;
    info!(
        min_connections = db_config.min_connections,
        max_connections = db_config.max_connections,
        fleet_size = config.database.fleet_size,
        global_limit = config.database.global_connection_limit,
        "Connection pool sized for fleet"
    );

    let pool = create_pool(&db_config).await.context("Failed to connect to database")?;
    db::health_check(&pool).await.context("Database health check failed")?;

    if config.worker.run_migrations {
        db::run_migrations(&pool).await.context("Failed to run migrations")?;
    }

    db::verify_partition_parity(&pool)
        .await
        .context("Partition key parity check failed, refusing to claim work")?;
    info!("Partition key parity verified");

    let queue = WorkQueue::new(pool.clone());
    let lease = LeaseRegistry::new(pool.clone(), &worker_id);
    lease.register().await.context("Failed to register lease")?;

    let extractor = CommandExtractor::from_command_line(&config.pipeline.extractor_command)
        .context("No extractor command configured")?;

    let scheduler = LocalScheduler::new(
        config.scheduler_config(),
        Arc::new(QueueSource::new(
            queue.clone(),
            &worker_id,
            config.worker.batch_size,
            config.claim_filter(),
            config.retry_policy(),
        )),
        Arc::new(MergeSink::new(
            MergeEngine::new(pool.clone()),
            queue.clone(),
            &worker_id,
            config.worker.max_retries,
        )),
        Arc::new(extractor),
    )?;

    let background = CancellationToken::new();
    let heartbeat = lease.start_heartbeat_task(
        Duration::from_secs(config.worker.heartbeat_interval_secs),
        scheduler.stats(),
        background.clone(),
    );
    let sweeper = queue.spawn_stale_sweeper(
        Duration::from_secs(config.worker.stale_claim_timeout_secs),
        Duration::from_secs(config.worker.sweep_interval_secs),
        background.clone(),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone(), lease.clone()));

    let outcome = scheduler.run(shutdown).await;

    background.cancel();
    for task in [heartbeat, sweeper] {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    let counters = LeaseCounters::from(&scheduler.stats().snapshot());
    if let Err(e) = lease.deregister(&counters).await {
        warn!(error = %e, "Failed to release lease");
    }
    pool.close().await;

    let snapshot = outcome.context("Pipeline stopped on unrecoverable error")?;
    info!(
        claimed = snapshot.claimed,
        processed = snapshot.processed,
        succeeded = snapshot.succeeded,
        failed = snapshot.failed,
        abandoned = snapshot.abandoned,
        partition_mismatches = snapshot.partition_mismatches,
        "Run summary"
    );

    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn shutdown_signal(shutdown: CancellationToken, lease: LeaseRegistry) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, draining"),
        _ = terminate => info!("Received SIGTERM, draining"),
    }

    shutdown.cancel();
    if let Err(e) = lease.set_status(LeaseStatus::Stopping).await {
        warn!(error = %e, "Failed to mark lease stopping");
    }
}
