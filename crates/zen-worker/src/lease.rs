//! Server leases
//!
//! Each running worker keeps a row in `server_leases` with a heartbeat and its
//! pipeline counters. Dashboards read it; the claim protocol never does.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::DbResult;
use crate::pipeline::{PipelineSnapshot, PipelineStats};

/// Lease lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Running,
    Stopping,
    Stopped,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseStatus::Running => "running",
            LeaseStatus::Stopping => "stopping",
            LeaseStatus::Stopped => "stopped",
        }
    }
}

/// Counters published with every heartbeat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseCounters {
    pub processed: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub in_flight: i64,
}

impl From<&PipelineSnapshot> for LeaseCounters {
    fn from(snapshot: &PipelineSnapshot) -> Self {
        let clamp = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        Self {
            processed: clamp(snapshot.processed),
            succeeded: clamp(snapshot.succeeded),
            failed: clamp(snapshot.failed),
            in_flight: clamp(snapshot.in_flight),
        }
    }
}

/// This worker's row in `server_leases`
#[derive(Clone)]
pub struct LeaseRegistry {
    pool: PgPool,
    worker_id: String,
    hostname: String,
    pid: i32,
}

impl LeaseRegistry {
    pub fn new(pool: PgPool, worker_id: impl Into<String>) -> Self {
        Self {
            pool,
            worker_id: worker_id.into(),
            hostname: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
            pid: i32::try_from(std::process::id()).unwrap_or(i32::MAX),
        }
    }

    /// Create or take over the lease row, resetting its counters.
    pub async fn register(&self) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO server_leases (worker_id, hostname, pid, status, started_at, last_heartbeat)
            VALUES ($1, $2, $3, 'running', NOW(), NOW())
            ON CONFLICT (worker_id) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                pid = EXCLUDED.pid,
                status = 'running',
                current_task = NULL,
                processed = 0,
                succeeded = 0,
                failed = 0,
                in_flight = 0,
                started_at = NOW(),
                last_heartbeat = NOW()
            "#,
        )
        .bind(&self.worker_id)
        .bind(&self.hostname)
        .bind(self.pid)
        .execute(&self.pool)
        .await?;

        info!(worker_id = %self.worker_id, hostname = %self.hostname, pid = self.pid, "Lease registered");
        Ok(())
    }

    /// Refresh the heartbeat and publish counters.
    pub async fn heartbeat(&self, current_task: Option<&str>, counters: &LeaseCounters) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE server_leases
            SET last_heartbeat = NOW(),
                current_task = $2,
                processed = $3,
                succeeded = $4,
                failed = $5,
                in_flight = $6
            WHERE worker_id = $1
            "#,
        )
        .bind(&self.worker_id)
        .bind(current_task)
        .bind(counters.processed)
        .bind(counters.succeeded)
        .bind(counters.failed)
        .bind(counters.in_flight)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_status(&self, status: LeaseStatus) -> DbResult<()> {
        sqlx::query("UPDATE server_leases SET status = $2, last_heartbeat = NOW() WHERE worker_id = $1")
            .bind(&self.worker_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark the lease stopped with final counters.
    pub async fn deregister(&self, counters: &LeaseCounters) -> DbResult<()> {
        self.heartbeat(None, counters).await?;
        self.set_status(LeaseStatus::Stopped).await?;
        info!(worker_id = %self.worker_id, "Lease released");
        Ok(())
    }

    /// Start heartbeat task publishing `stats` every `interval`
    pub fn start_heartbeat_task(
        &self,
        interval: Duration,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let lease = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {},
                }

                let snapshot = stats.snapshot();
                let task = (snapshot.in_flight > 0).then(|| format!("{} in flight", snapshot.in_flight));
                if let Err(e) = lease
                    .heartbeat(task.as_deref(), &LeaseCounters::from(&snapshot))
                    .await
                {
                    warn!(worker_id = %lease.worker_id, error = %e, "Lease heartbeat failed");
                }
            }

            debug!(worker_id = %lease.worker_id, "Heartbeat task stopped");
        })
    }
}
