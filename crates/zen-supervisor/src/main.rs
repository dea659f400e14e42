//! Zen Supervisor - Main entry point

use clap::Parser;
use std::process;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use zen_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use zen_supervisor::{Cli, Commands, FleetSummary, RunArgs, Supervisor};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("zen-supervisor")
        .filter_directives("zen_supervisor=debug")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        },
    };

    let result = match cli.command {
        Commands::Run(ref args) => run(args).await,
    };

    match result {
        Ok(summary) => print_summary(&summary),
        Err(e) => {
            error!(error = %e, "Supervisor failed");
            eprintln!("Error: {}", e);
            process::exit(1);
        },
    }
}

async fn run(args: &RunArgs) -> zen_supervisor::Result<FleetSummary> {
    let supervisor = Supervisor::new(args.supervisor_config(), args.worker_command()?)?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    Ok(supervisor.run(shutdown).await)
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

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

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, stopping workers"),
        _ = terminate => info!("Received SIGTERM, stopping workers"),
    }

    shutdown.cancel();
}

fn print_summary(summary: &FleetSummary) {
    println!("Fleet summary");
    println!("  spawned:        {}", summary.spawned);
    println!("  clean exits:    {}", summary.clean_exits);
    println!("  crashes:        {}", summary.crashes);
    println!("  spawn failures: {}", summary.spawn_failures);
    println!("  force killed:   {}", summary.force_killed);
    println!("  still running:  {}", summary.running);
}
