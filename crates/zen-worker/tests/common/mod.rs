//! Common test utilities for zen worker integration tests using testcontainers
//!
//! Each test gets its own PostgreSQL container with the claim store schema
//! applied.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::TestPostgres;
//!
//! #[tokio::test]
//! async fn test_with_postgres() {
//!     let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL");
//!     sqlx::query("SELECT 1").execute(pg.pool()).await.expect("Query failed");
//! }
//! ```

#![allow(dead_code)]

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};
use zen_worker::queue::{NewWorkItem, WorkQueue};

/// PostgreSQL test container with migrations applied
pub struct TestPostgres {
    container: ContainerAsync<Postgres>,
    pool: PgPool,
    connection_string: String,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        Self::start_with_options(PostgresOptions::default()).await
    }

    pub async fn start_with_options(options: PostgresOptions) -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag(&options.version)
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(Duration::from_secs(options.acquire_timeout_secs))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        if options.run_migrations {
            zen_worker::db::run_migrations(&pool)
                .await
                .context("Failed to run migrations")?;
        }

        Ok(Self {
            container,
            pool,
            connection_string,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn queue(&self) -> WorkQueue {
        WorkQueue::new(self.pool.clone())
    }

    /// Enqueue pending items for `links` and return their ids in input order.
    pub async fn seed(&self, links: &[&str]) -> Result<Vec<i64>> {
        let items: Vec<NewWorkItem> = links.iter().map(|l| NewWorkItem::new(*l)).collect();
        self.queue().enqueue(&items).await?;

        let mut ids = Vec::with_capacity(links.len());
        for link in links {
            let id: i64 = sqlx::query_scalar("SELECT id FROM work_items WHERE link = $1")
                .bind(link)
                .fetch_one(&self.pool)
                .await?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Shift an item's claim timestamp into the past.
    pub async fn backdate_claim(&self, item_id: i64, by: Duration) -> Result<()> {
        sqlx::query("UPDATE work_items SET claimed_at = claimed_at - make_interval(secs => $2) WHERE id = $1")
            .bind(item_id)
            .bind(by.as_secs_f64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Shift an item's last retry timestamp into the past.
    pub async fn backdate_retry(&self, item_id: i64, by: Duration) -> Result<()> {
        sqlx::query(
            "UPDATE work_items SET last_retry_at = last_retry_at - make_interval(secs => $2) WHERE id = $1",
        )
        .bind(item_id)
        .bind(by.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Configuration options for the PostgreSQL test container
pub struct PostgresOptions {
    /// PostgreSQL version/tag (default: "16-alpine")
    pub version: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub run_migrations: bool,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            version: "16-alpine".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 30,
            run_migrations: true,
        }
    }
}

impl PostgresOptions {
    pub fn without_migrations() -> Self {
        Self {
            run_migrations: false,
            ..Default::default()
        }
    }
}

/// Initialize test tracing subscriber
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,zen_worker=debug,sqlx=warn,testcontainers=info")),
        )
        .with_test_writer()
        .try_init();
}
