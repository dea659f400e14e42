//! Zen Supervisor Library
//!
//! Keeps a fleet of zen workers running on one machine.
//!
//! # Overview
//!
//! - **Capacity**: at most `--max-workers` children, one per slot.
//! - **Liveness**: counted from the supervisor's own slot table; children are
//!   reaped through their handles, so exited children never hold a slot.
//! - **Restarts**: per-slot exponential backoff after crashes, crash logs
//!   rate-limited.
//! - **Shutdown**: SIGTERM, wait, SIGKILL; a drop guard and a parent-death
//!   signal cover abnormal exits.

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod error;
pub mod supervisor;

pub use error::{Result, SupervisorError};
pub use supervisor::{FleetSummary, Supervisor, SupervisorConfig, WorkerCommand};

use clap::{Args, Parser, Subcommand};
use std::time::Duration;

/// Zen Supervisor - run and watch a local fleet of workers
#[derive(Parser, Debug)]
#[command(name = "zen-supervisor")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start workers and keep them running until interrupted
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Maximum number of concurrently running workers
    #[arg(long, env = "ZEN_MAX_WORKERS", default_value_t = 4)]
    pub max_workers: usize,

    /// How often exited workers are reaped and slots refilled
    #[arg(long, env = "ZEN_REAP_INTERVAL_MS", default_value_t = 500)]
    pub reap_interval_ms: u64,

    /// Time workers get to exit after SIGTERM before they are killed
    #[arg(long, env = "ZEN_STOP_TIMEOUT_SECS", default_value_t = 30)]
    pub stop_timeout_secs: u64,

    /// Restart delay after a clean exit or a first crash
    #[arg(long, env = "ZEN_RESTART_BACKOFF_MS", default_value_t = 1000)]
    pub restart_backoff_ms: u64,

    /// Upper bound of the crash restart delay
    #[arg(long, env = "ZEN_MAX_RESTART_BACKOFF_MS", default_value_t = 60_000)]
    pub max_restart_backoff_ms: u64,

    /// Uptime after which a worker's crash streak is forgotten
    #[arg(long, env = "ZEN_STABILITY_WINDOW_SECS", default_value_t = 60)]
    pub stability_window_secs: u64,

    /// Worker program and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl RunArgs {
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            max_workers: self.max_workers,
            reap_interval: Duration::from_millis(self.reap_interval_ms),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            restart_backoff: Duration::from_millis(self.restart_backoff_ms),
            max_restart_backoff: Duration::from_millis(self.max_restart_backoff_ms),
            stability_window: Duration::from_secs(self.stability_window_secs),
            ..SupervisorConfig::default()
        }
    }

    pub fn worker_command(&self) -> Result<WorkerCommand> {
        WorkerCommand::from_argv(&self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_parse_trailing_command() {
        let cli = Cli::try_parse_from([
            "zen-supervisor",
            "run",
            "--max-workers",
            "3",
            "--restart-backoff-ms",
            "250",
            "--",
            "zen-worker",
            "--flag",
            "value",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command;
        assert_eq!(args.max_workers, 3);
        let config = args.supervisor_config();
        assert_eq!(config.restart_backoff, Duration::from_millis(250));
        assert_eq!(config.max_restart_backoff, Duration::from_secs(60));

        let command = args.worker_command().unwrap();
        assert_eq!(command.program, "zen-worker");
        assert_eq!(command.args, vec!["--flag".to_string(), "value".to_string()]);
    }

    #[test]
    fn test_run_requires_command() {
        assert!(Cli::try_parse_from(["zen-supervisor", "run", "--max-workers", "2"]).is_err());
    }
}
