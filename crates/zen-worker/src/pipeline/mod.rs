//! Local bounded pipeline
//!
//! ```text
//! WorkSource ─► producer ─► [input queue] ─► W consumers ─► [output queue] ─► writer ─► ResultSink
//!                                               │
//!                                         B resource permits
//!                                               │
//!                                           Extractor
//! ```
//!
//! Both queues are bounded. A consumer reserves its output slot before it
//! takes a resource permit, so a slow store stalls consumers first, then the
//! input queue fills and the producer blocks.
//!
//! Shutdown runs in two steps. Cancelling the `shutdown` token stops the
//! producer; queued and in-flight items keep going for `grace_period`. After
//! that the force token aborts extractions (dropping the extractor future,
//! which kills its helper processes) and the remaining items are abandoned.
//! Abandoned items stay claimed in the store until the stale sweep returns
//! them.

mod stats;
mod store;

pub use stats::{PipelineSnapshot, PipelineStats};
pub use store::{MergeSink, QueueSource};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zen_common::{partition, Result, ZenError};

use crate::extractor::{ExtractionResult, Extractor};
use crate::queue::WorkItem;

/// Supplies claimed work items
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Claim the next batch. An empty batch means nothing is available now.
    async fn next_batch(&self) -> Result<Vec<WorkItem>>;
}

/// Persists extraction outcomes
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Merge the result and settle the item's claim.
    async fn write(&self, item: &WorkItem, result: &ExtractionResult) -> Result<()>;

    /// Take an item with an inconsistent partition key out of circulation.
    async fn quarantine(&self, item: &WorkItem, reason: &ZenError) -> Result<()>;
}

/// Pipeline sizing and timing
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub input_capacity: usize,
    pub output_capacity: usize,
    pub consumers: usize,
    /// Concurrent extractor calls, at most `consumers`
    pub resource_permits: usize,
    pub extract_timeout: Duration,
    pub grace_period: Duration,
    /// Stop once the source returns an empty batch
    pub exit_when_drained: bool,
    /// Wait between polls of an empty source
    pub idle_poll: Duration,
    pub write_attempts: u32,
    pub write_backoff: Duration,
    /// Consecutive failed claim calls tolerated before giving up
    pub claim_attempts: u32,
    pub claim_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            input_capacity: 50,
            output_capacity: 50,
            consumers: 4,
            resource_permits: 2,
            extract_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(30),
            exit_when_drained: false,
            idle_poll: Duration::from_secs(5),
            write_attempts: 3,
            write_backoff: Duration::from_secs(1),
            claim_attempts: 5,
            claim_backoff: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_capacity == 0 || self.output_capacity == 0 {
            return Err(ZenError::Config("queue capacities must be greater than 0".into()));
        }
        if self.consumers == 0 {
            return Err(ZenError::Config("at least one consumer is required".into()));
        }
        if self.resource_permits == 0 || self.resource_permits > self.consumers {
            return Err(ZenError::Config(format!(
                "resource permits ({}) must be between 1 and the consumer count ({})",
                self.resource_permits, self.consumers
            )));
        }
        if self.write_attempts == 0 || self.claim_attempts == 0 {
            return Err(ZenError::Config("retry budgets must be at least 1".into()));
        }
        Ok(())
    }
}

struct Processed {
    item: WorkItem,
    result: ExtractionResult,
}

/// Producer → consumers → writer pipeline for one worker process
pub struct LocalScheduler {
    config: SchedulerConfig,
    source: Arc<dyn WorkSource>,
    sink: Arc<dyn ResultSink>,
    extractor: Arc<dyn Extractor>,
    stats: Arc<PipelineStats>,
}

impl LocalScheduler {
    pub fn new(
        config: SchedulerConfig,
        source: Arc<dyn WorkSource>,
        sink: Arc<dyn ResultSink>,
        extractor: Arc<dyn Extractor>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            source,
            sink,
            extractor,
            stats: Arc::new(PipelineStats::new()),
        })
    }

    /// Counters, readable while the pipeline runs.
    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Run until the source is drained (with `exit_when_drained`) or
    /// `shutdown` fires, then wait for the stages to finish.
    ///
    /// Returns an error only when claiming work failed beyond the retry
    /// budget or hit a non-recoverable condition.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<PipelineSnapshot> {
        let config = &self.config;
        let force = CancellationToken::new();

        let (in_tx, in_rx) = mpsc::channel::<WorkItem>(config.input_capacity);
        let (out_tx, out_rx) = mpsc::channel::<Processed>(config.output_capacity);
        let in_rx = Arc::new(Mutex::new(in_rx));
        let permits = Arc::new(Semaphore::new(config.resource_permits));

        info!(
            input_capacity = config.input_capacity,
            output_capacity = config.output_capacity,
            consumers = config.consumers,
            resource_permits = config.resource_permits,
            "Starting pipeline"
        );

        let producer = tokio::spawn(produce(
            self.source.clone(),
            self.sink.clone(),
            in_tx,
            shutdown.clone(),
            self.stats.clone(),
            config.clone(),
        ));

        let mut consumers = JoinSet::new();
        for id in 0..config.consumers {
            consumers.spawn(consume(
                id,
                in_rx.clone(),
                out_tx.clone(),
                permits.clone(),
                self.extractor.clone(),
                force.clone(),
                self.stats.clone(),
                config.extract_timeout,
            ));
        }
        drop(out_tx);

        let writer = tokio::spawn(write_results(
            out_rx,
            self.sink.clone(),
            force.clone(),
            self.stats.clone(),
            config.clone(),
        ));

        let produced = match producer.await {
            Ok(result) => result,
            Err(e) => Err(ZenError::Internal(format!("producer task failed: {e}"))),
        };

        let drain = async move {
            while let Some(joined) = consumers.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Consumer task failed");
                }
            }
            if let Err(e) = writer.await {
                error!(error = %e, "Writer task failed");
            }
        };
        tokio::pin!(drain);

        let stop_requested = produced.is_err();
        let grace = config.grace_period;
        let deadline = async {
            if !stop_requested {
                shutdown.cancelled().await;
            }
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            _ = &mut drain => {},
            _ = deadline => {
                warn!(
                    grace_secs = grace.as_secs(),
                    in_flight = self.stats.snapshot().in_flight,
                    "Grace period elapsed, abandoning in-flight items"
                );
                force.cancel();
                (&mut drain).await;
            }
        }
        permits.close();

        let queued = {
            let mut rx = in_rx.lock().await;
            rx.close();
            let mut queued = 0u64;
            while rx.try_recv().is_ok() {
                queued += 1;
            }
            queued
        };
        if queued > 0 {
            self.stats.record_abandoned(queued);
            warn!(queued, "Pipeline stopped with claimed items still queued");
        }

        let snapshot = self.stats.snapshot();
        info!(
            processed = snapshot.processed,
            succeeded = snapshot.succeeded,
            failed = snapshot.failed,
            abandoned = snapshot.abandoned,
            partition_mismatches = snapshot.partition_mismatches,
            write_failures = snapshot.write_failures,
            "Pipeline stopped"
        );

        produced.map(|()| snapshot)
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    base.saturating_mul(factor).min(Duration::from_secs(60))
}

/// Sleep unless `cancel` fires first. Returns `true` when cancelled.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

async fn produce(
    source: Arc<dyn WorkSource>,
    sink: Arc<dyn ResultSink>,
    tx: mpsc::Sender<WorkItem>,
    shutdown: CancellationToken,
    stats: Arc<PipelineStats>,
    config: SchedulerConfig,
) -> Result<()> {
    let mut failures = 0u32;

    loop {
        let batch = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            batch = source.next_batch() => batch,
        };

        let items = match batch {
            Ok(items) => {
                failures = 0;
                items
            },
            Err(e) if e.is_recoverable() && failures + 1 < config.claim_attempts => {
                failures += 1;
                let delay = backoff(config.claim_backoff, failures);
                warn!(error = %e, attempt = failures, delay_ms = delay.as_millis() as u64, "Claim failed, backing off");
                if sleep_or_cancel(delay, &shutdown).await {
                    break;
                }
                continue;
            },
            Err(e) => {
                error!(error = %e, "Giving up on claiming work");
                return Err(e);
            },
        };

        if items.is_empty() {
            if config.exit_when_drained {
                info!("Backlog drained");
                break;
            }
            if sleep_or_cancel(config.idle_poll, &shutdown).await {
                break;
            }
            continue;
        }

        stats.record_claimed(items.len());
        let mut items = items.into_iter();

        while let Some(item) = items.next() {
            if let Err(err) = partition::verify(&item.link, item.partition_key) {
                stats.record_mismatch();
                error!(item_id = item.id, link = %item.link, error = %err, "Partition key mismatch, quarantining item");
                if let Err(e) = sink.quarantine(&item, &err).await {
                    error!(item_id = item.id, error = %e, "Failed to quarantine item");
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    let dropped = 1 + items.len() as u64;
                    stats.record_abandoned(dropped);
                    debug!(dropped, "Producer stopped with claimed items not enqueued");
                    return Ok(());
                }
                sent = tx.send(item) => {
                    if sent.is_err() {
                        stats.record_abandoned(1 + items.len() as u64);
                        return Ok(());
                    }
                    stats.observe_input_depth(tx.max_capacity() - tx.capacity());
                }
            }
        }
    }

    debug!("Producer stopped");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn consume(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    tx: mpsc::Sender<Processed>,
    permits: Arc<Semaphore>,
    extractor: Arc<dyn Extractor>,
    force: CancellationToken,
    stats: Arc<PipelineStats>,
    timeout: Duration,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = force.cancelled() => None,
            item = async { rx.lock().await.recv().await } => item,
        };
        let Some(item) = next else { break };

        let slot = tokio::select! {
            biased;
            _ = force.cancelled() => {
                stats.record_abandoned(1);
                break;
            }
            slot = tx.reserve() => match slot {
                Ok(slot) => slot,
                Err(_) => {
                    stats.record_abandoned(1);
                    break;
                }
            },
        };

        let permit = tokio::select! {
            biased;
            _ = force.cancelled() => {
                stats.record_abandoned(1);
                break;
            }
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    stats.record_abandoned(1);
                    break;
                }
            },
        };

        stats.start_item();
        let result = tokio::select! {
            biased;
            _ = force.cancelled() => None,
            res = tokio::time::timeout(timeout, extractor.extract(&item.link, timeout)) => {
                Some(res.unwrap_or_else(|_| ExtractionResult::timed_out(timeout)))
            }
        };
        drop(permit);
        stats.finish_item();

        match result {
            Some(result) => slot.send(Processed { item, result }),
            None => {
                stats.record_abandoned(1);
                debug!(consumer = id, item_id = item.id, "Extraction aborted");
                break;
            },
        }
    }

    debug!(consumer = id, "Consumer stopped");
}

async fn write_results(
    mut rx: mpsc::Receiver<Processed>,
    sink: Arc<dyn ResultSink>,
    force: CancellationToken,
    stats: Arc<PipelineStats>,
    config: SchedulerConfig,
) {
    loop {
        let processed = tokio::select! {
            biased;
            _ = force.cancelled() => break,
            next = rx.recv() => match next {
                Some(processed) => processed,
                None => break,
            },
        };
        write_one(&processed, sink.as_ref(), &force, &stats, &config).await;
    }

    rx.close();
    let mut leftover = 0u64;
    while rx.try_recv().is_ok() {
        leftover += 1;
    }
    if leftover > 0 {
        stats.record_abandoned(leftover);
        warn!(leftover, "Writer stopped with unwritten results");
    }

    debug!("Writer stopped");
}

async fn write_one(
    processed: &Processed,
    sink: &dyn ResultSink,
    force: &CancellationToken,
    stats: &PipelineStats,
    config: &SchedulerConfig,
) {
    let item = &processed.item;

    for attempt in 1..=config.write_attempts {
        match sink.write(item, &processed.result).await {
            Ok(()) => {
                stats.record_written(processed.result.status.is_success());
                return;
            },
            Err(err @ ZenError::PartitionKeyMismatch { .. }) => {
                stats.record_mismatch();
                error!(item_id = item.id, link = %item.link, error = %err, "Store rejected partition key, quarantining item");
                if let Err(e) = sink.quarantine(item, &err).await {
                    error!(item_id = item.id, error = %e, "Failed to quarantine item");
                }
                return;
            },
            Err(err) if err.is_recoverable() && attempt < config.write_attempts => {
                let delay = backoff(config.write_backoff, attempt);
                warn!(item_id = item.id, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Write failed, retrying");
                if sleep_or_cancel(delay, force).await {
                    stats.record_abandoned(1);
                    return;
                }
            },
            Err(err) => {
                stats.record_write_failure();
                error!(item_id = item.id, link = %item.link, error = %err, "Giving up on writing result");
                return;
            },
        }
    }
}
