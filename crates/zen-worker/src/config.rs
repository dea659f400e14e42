//! Worker configuration
//!
//! Read once from the environment (after `.env`) into an immutable [`Config`].

use serde::{Deserialize, Serialize};
use std::time::Duration;
use zen_common::PARTITION_COUNT;

use crate::db::{DbConfig, PoolSizing};
use crate::pipeline::SchedulerConfig;
use crate::queue::{ClaimFilter, RetryPolicy};

// ============================================================================
// Claim Protocol Constants
// ============================================================================

/// Default number of items claimed per call.
pub const DEFAULT_BATCH_SIZE: u32 = 25;

/// Default retry budget per work item.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Default minimum wait between two attempts on the same item (1 hour).
pub const DEFAULT_RETRY_COOLDOWN_SECS: u64 = 3600;

/// Default age after which a claim is considered abandoned (30 minutes).
pub const DEFAULT_STALE_CLAIM_TIMEOUT_SECS: u64 = 1800;

/// Default interval of the stale-claim sweep.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Default interval of lease heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

// ============================================================================
// Connection Pool Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/zen";

pub const DEFAULT_DB_MIN_CONNECTIONS: u32 = 1;

pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

pub const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// Default per-statement timeout enforced by the store.
pub const DEFAULT_DB_STATEMENT_TIMEOUT_MS: u64 = 30_000;

/// Default store-wide connection ceiling (PostgreSQL's `max_connections`).
pub const DEFAULT_DB_GLOBAL_CONNECTION_LIMIT: u32 = 100;

/// Default number of workers expected to share the store.
pub const DEFAULT_FLEET_SIZE: u32 = 4;

// ============================================================================
// Pipeline Constants
// ============================================================================

pub const DEFAULT_INPUT_QUEUE: usize = 50;

pub const DEFAULT_OUTPUT_QUEUE: usize = 50;

pub const DEFAULT_CONSUMERS: usize = 4;

/// Default number of concurrent browser sessions.
pub const DEFAULT_BROWSER_PERMITS: usize = 2;

pub const DEFAULT_EXTRACT_TIMEOUT_SECS: u64 = 60;

/// Default time in-flight items get to finish after a shutdown request.
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 30;

/// Default extractor helper program.
pub const DEFAULT_EXTRACTOR_COMMAND: &str = "zen-extract";

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub worker: WorkerConfig,
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
    pub filter: FilterConfig,
}

/// Identity and claim-protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub batch_size: u32,
    pub max_retries: i32,
    pub retry_cooldown_secs: u64,
    pub stale_claim_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub run_migrations: bool,
    /// Stop once the backlog is empty instead of polling for new work.
    pub exit_when_drained: bool,
}

/// Database pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub statement_timeout_ms: u64,
    pub global_connection_limit: u32,
    pub fleet_size: u32,
}

/// Local pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub input_queue: usize,
    pub output_queue: usize,
    pub consumers: usize,
    pub browser_permits: usize,
    pub extract_timeout_secs: u64,
    pub grace_period_secs: u64,
    /// Helper program and its leading arguments.
    pub extractor_command: Vec<String>,
}

/// Workload restriction applied to every claim
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    pub country: Option<String>,
    pub categories: Vec<String>,
    pub partitions: Vec<i32>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|s| {
            s.split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// `<hostname>-<pid>`, unique per running process on the fleet.
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .unwrap_or_else(|_| "unknown".into())
        .to_string_lossy()
        .to_string();
    format!("{}-{}", host, std::process::id())
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let partitions = env_list("ZEN_FILTER_PARTITIONS")
            .into_iter()
            .map(|p| {
                p.parse::<i32>()
                    .map_err(|_| anyhow::anyhow!("Invalid partition in ZEN_FILTER_PARTITIONS: {p:?}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let extractor_command = std::env::var("ZEN_EXTRACTOR_COMMAND")
            .unwrap_or_else(|_| DEFAULT_EXTRACTOR_COMMAND.to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let config = Config {
            worker: WorkerConfig {
                worker_id: std::env::var("ZEN_WORKER_ID")
                    .ok()
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(default_worker_id),
                batch_size: env_or("ZEN_BATCH_SIZE", DEFAULT_BATCH_SIZE),
                max_retries: env_or("ZEN_MAX_RETRIES", DEFAULT_MAX_RETRIES),
                retry_cooldown_secs: env_or("ZEN_RETRY_COOLDOWN_SECS", DEFAULT_RETRY_COOLDOWN_SECS),
                stale_claim_timeout_secs: env_or(
                    "ZEN_STALE_CLAIM_TIMEOUT_SECS",
                    DEFAULT_STALE_CLAIM_TIMEOUT_SECS,
                ),
                sweep_interval_secs: env_or("ZEN_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS),
                heartbeat_interval_secs: env_or(
                    "ZEN_HEARTBEAT_INTERVAL_SECS",
                    DEFAULT_HEARTBEAT_INTERVAL_SECS,
                ),
                run_migrations: env_or("ZEN_RUN_MIGRATIONS", false),
                exit_when_drained: env_or("ZEN_EXIT_WHEN_DRAINED", false),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                min_connections: env_or("DB_MIN_CONNECTIONS", DEFAULT_DB_MIN_CONNECTIONS),
                max_connections: env_or("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
                acquire_timeout_secs: env_or("DB_ACQUIRE_TIMEOUT_SECS", DEFAULT_DB_ACQUIRE_TIMEOUT_SECS),
                statement_timeout_ms: env_or("DB_STATEMENT_TIMEOUT_MS", DEFAULT_DB_STATEMENT_TIMEOUT_MS),
                global_connection_limit: env_or(
                    "DB_GLOBAL_CONNECTION_LIMIT",
                    DEFAULT_DB_GLOBAL_CONNECTION_LIMIT,
                ),
                fleet_size: env_or("ZEN_FLEET_SIZE", DEFAULT_FLEET_SIZE),
            },
            pipeline: PipelineConfig {
                input_queue: env_or("ZEN_INPUT_QUEUE", DEFAULT_INPUT_QUEUE),
                output_queue: env_or("ZEN_OUTPUT_QUEUE", DEFAULT_OUTPUT_QUEUE),
                consumers: env_or("ZEN_CONSUMERS", DEFAULT_CONSUMERS),
                browser_permits: env_or("ZEN_BROWSER_PERMITS", DEFAULT_BROWSER_PERMITS),
                extract_timeout_secs: env_or("ZEN_EXTRACT_TIMEOUT_SECS", DEFAULT_EXTRACT_TIMEOUT_SECS),
                grace_period_secs: env_or("ZEN_GRACE_PERIOD_SECS", DEFAULT_GRACE_PERIOD_SECS),
                extractor_command,
            },
            filter: FilterConfig {
                country: std::env::var("ZEN_FILTER_COUNTRY")
                    .ok()
                    .map(|c| c.trim().to_uppercase())
                    .filter(|c| !c.is_empty()),
                categories: env_list("ZEN_FILTER_CATEGORIES"),
                partitions,
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker.worker_id.trim().is_empty() {
            anyhow::bail!("Worker id cannot be empty");
        }

        if self.worker.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than 0");
        }

        if self.worker.max_retries < 0 {
            anyhow::bail!("Max retries cannot be negative");
        }

        if self.worker.stale_claim_timeout_secs == 0 {
            anyhow::bail!("Stale claim timeout must be greater than 0");
        }

        if self.worker.sweep_interval_secs == 0 {
            anyhow::bail!("Stale claim sweep interval must be greater than 0");
        }

        if self.worker.heartbeat_interval_secs == 0 {
            anyhow::bail!("Heartbeat interval must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.database.fleet_size == 0 {
            anyhow::bail!("Fleet size must be greater than 0");
        }

        if self.pipeline.input_queue == 0 || self.pipeline.output_queue == 0 {
            anyhow::bail!("Pipeline queue capacities must be greater than 0");
        }

        if self.pipeline.consumers == 0 {
            anyhow::bail!("Pipeline needs at least one consumer");
        }

        if self.pipeline.browser_permits == 0 || self.pipeline.browser_permits > self.pipeline.consumers {
            anyhow::bail!(
                "Browser permits ({}) must be between 1 and the consumer count ({})",
                self.pipeline.browser_permits,
                self.pipeline.consumers
            );
        }

        if self.pipeline.extractor_command.is_empty() {
            anyhow::bail!("Extractor command cannot be empty");
        }

        if let Some(bad) = self
            .filter
            .partitions
            .iter()
            .find(|p| **p < 0 || **p as u32 >= PARTITION_COUNT)
        {
            anyhow::bail!("Partition filter value {} outside [0, {})", bad, PARTITION_COUNT);
        }

        if let Some(ref country) = self.filter.country {
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
                anyhow::bail!("Country filter must be an ISO alpha-2 code, got {:?}", country);
            }
        }

        Ok(())
    }

    pub fn db_config(&self) -> DbConfig {
        DbConfig {
            url: self.database.url.clone(),
            min_connections: self.database.min_connections,
            max_connections: self.database.max_connections,
            acquire_timeout: Duration::from_secs(self.database.acquire_timeout_secs),
            statement_timeout: Duration::from_millis(self.database.statement_timeout_ms),
            application_name: format!("zen-worker:{}", self.worker.worker_id),
        }
    }

    pub fn pool_sizing(&self) -> PoolSizing {
        PoolSizing::new(self.database.fleet_size, self.database.global_connection_limit)
    }

    pub fn claim_filter(&self) -> ClaimFilter {
        ClaimFilter {
            partitions: (!self.filter.partitions.is_empty()).then(|| self.filter.partitions.clone()),
            country_code: self.filter.country.clone(),
            category_keywords: self.filter.categories.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.worker.max_retries,
            cooldown: Duration::from_secs(self.worker.retry_cooldown_secs),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            input_capacity: self.pipeline.input_queue,
            output_capacity: self.pipeline.output_queue,
            consumers: self.pipeline.consumers,
            resource_permits: self.pipeline.browser_permits,
            extract_timeout: Duration::from_secs(self.pipeline.extract_timeout_secs),
            grace_period: Duration::from_secs(self.pipeline.grace_period_secs),
            exit_when_drained: self.worker.exit_when_drained,
            ..SchedulerConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker: WorkerConfig {
                worker_id: default_worker_id(),
                batch_size: DEFAULT_BATCH_SIZE,
                max_retries: DEFAULT_MAX_RETRIES,
                retry_cooldown_secs: DEFAULT_RETRY_COOLDOWN_SECS,
                stale_claim_timeout_secs: DEFAULT_STALE_CLAIM_TIMEOUT_SECS,
                sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
                heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
                run_migrations: false,
                exit_when_drained: false,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                min_connections: DEFAULT_DB_MIN_CONNECTIONS,
                max_connections: DEFAULT_DB_MAX_CONNECTIONS,
                acquire_timeout_secs: DEFAULT_DB_ACQUIRE_TIMEOUT_SECS,
                statement_timeout_ms: DEFAULT_DB_STATEMENT_TIMEOUT_MS,
                global_connection_limit: DEFAULT_DB_GLOBAL_CONNECTION_LIMIT,
                fleet_size: DEFAULT_FLEET_SIZE,
            },
            pipeline: PipelineConfig {
                input_queue: DEFAULT_INPUT_QUEUE,
                output_queue: DEFAULT_OUTPUT_QUEUE,
                consumers: DEFAULT_CONSUMERS,
                browser_permits: DEFAULT_BROWSER_PERMITS,
                extract_timeout_secs: DEFAULT_EXTRACT_TIMEOUT_SECS,
                grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
                extractor_command: vec![DEFAULT_EXTRACTOR_COMMAND.to_string()],
            },
            filter: FilterConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.worker.worker_id.contains('-'));
        assert_eq!(config.claim_filter().partitions, None);
    }

    #[test]
    fn test_rejects_more_permits_than_consumers() {
        let mut config = Config::default();
        config.pipeline.consumers = 2;
        config.pipeline.browser_permits = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_partition() {
        let mut config = Config::default();
        config.filter.partitions = vec![0, PARTITION_COUNT as i32];
        assert!(config.validate().is_err());

        config.filter.partitions = vec![0, 31];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_background_intervals() {
        let mut config = Config::default();
        config.worker.sweep_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.worker.heartbeat_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_min_above_max_connections() {
        let mut config = Config::default();
        config.database.min_connections = 6;
        config.database.max_connections = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_country_filter() {
        let mut config = Config::default();
        config.filter.country = Some("USA".to_string());
        assert!(config.validate().is_err());
        config.filter.country = Some("DE".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_settings() {
        let mut config = Config::default();
        config.filter.partitions = vec![3, 4];
        config.filter.categories = vec!["cafe".into(), "bakery".into()];
        config.worker.retry_cooldown_secs = 90;

        let filter = config.claim_filter();
        assert_eq!(filter.partitions, Some(vec![3, 4]));
        assert_eq!(filter.category_keywords.len(), 2);

        let policy = config.retry_policy();
        assert_eq!(policy.cooldown, Duration::from_secs(90));

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.consumers, DEFAULT_CONSUMERS);
        assert_eq!(scheduler.resource_permits, DEFAULT_BROWSER_PERMITS);
    }
}
