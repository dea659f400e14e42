//! Zen Worker Library
//!
//! One member of a fleet of enrichment workers sharing a PostgreSQL backlog.
//!
//! # Overview
//!
//! - **Claim protocol** ([`queue`]): batch claims under row locks that end
//!   with their transaction, retry eligibility, and the stale-claim sweep that
//!   returns work left behind by crashed workers.
//! - **Merge** ([`merge`]): the single-statement multi-writer UPSERT for
//!   enrichment records.
//! - **Connection pool** ([`db`]): per-worker pool sizing against the store's
//!   global connection ceiling, error mapping, migrations, and the partition
//!   key parity check.
//! - **Pipeline** ([`pipeline`]): bounded producer → consumers → writer
//!   pipeline with a resource semaphore in front of the [`extractor`].
//! - **Leases** ([`lease`]): monitoring-only heartbeat rows.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use zen_worker::config::Config;
//! use zen_worker::db::create_pool;
//! use zen_worker::extractor::CommandExtractor;
//! use zen_worker::merge::MergeEngine;
//! use zen_worker::pipeline::{LocalScheduler, MergeSink, QueueSource};
//! use zen_worker::queue::WorkQueue;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = create_pool(&config.db_config()).await?;
//!     let queue = WorkQueue::new(pool.clone());
//!     let id = config.worker.worker_id.clone();
//!
//!     let scheduler = LocalScheduler::new(
//!         config.scheduler_config(),
//!         Arc::new(QueueSource::new(queue.clone(), &id, 25, config.claim_filter(), config.retry_policy())),
//!         Arc::new(MergeSink::new(MergeEngine::new(pool), queue, &id, config.worker.max_retries)),
//!         Arc::new(CommandExtractor::new("zen-extract", Vec::new())),
//!     )?;
//!     let stats = scheduler.run(CancellationToken::new()).await?;
//!     println!("processed {}", stats.processed);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod db;
pub mod extractor;
pub mod lease;
pub mod merge;
pub mod pipeline;
pub mod queue;

pub use db::{DbError, DbResult};
pub use merge::{EnrichedRecord, MergeEngine, MergeOutcome};
pub use pipeline::{LocalScheduler, PipelineSnapshot, SchedulerConfig};
pub use queue::{ClaimFilter, WorkItem, WorkQueue};
