//! Store-backed pipeline endpoints

use async_trait::async_trait;
use tracing::{debug, warn};
use zen_common::{Result, ZenError};

use super::{ResultSink, WorkSource};
use crate::extractor::ExtractionResult;
use crate::merge::{EnrichedRecord, MergeEngine};
use crate::queue::{ClaimFilter, RetryPolicy, WorkItem, WorkQueue};

/// Claims fresh work first and falls back to retry-eligible items when the
/// pending backlog is empty.
pub struct QueueSource {
    queue: WorkQueue,
    worker_id: String,
    batch_size: u32,
    filter: ClaimFilter,
    retry: RetryPolicy,
}

impl QueueSource {
    pub fn new(
        queue: WorkQueue,
        worker_id: impl Into<String>,
        batch_size: u32,
        filter: ClaimFilter,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            queue,
            worker_id: worker_id.into(),
            batch_size,
            filter,
            retry,
        }
    }
}

#[async_trait]
impl WorkSource for QueueSource {
    async fn next_batch(&self) -> Result<Vec<WorkItem>> {
        let items = self
            .queue
            .claim_batch(&self.worker_id, self.batch_size, &self.filter)
            .await?;
        if !items.is_empty() {
            return Ok(items);
        }

        let retries = self
            .queue
            .claim_for_retry(&self.worker_id, self.batch_size, &self.retry, &self.filter)
            .await?;
        if !retries.is_empty() {
            debug!(worker_id = %self.worker_id, count = retries.len(), "Claimed items for retry");
        }
        Ok(retries)
    }
}

/// Writes each result through [`MergeEngine::upsert`], settling the claim in
/// the same statement.
pub struct MergeSink {
    engine: MergeEngine,
    queue: WorkQueue,
    worker_id: String,
    max_retries: i32,
}

impl MergeSink {
    pub fn new(engine: MergeEngine, queue: WorkQueue, worker_id: impl Into<String>, max_retries: i32) -> Self {
        Self {
            engine,
            queue,
            worker_id: worker_id.into(),
            max_retries,
        }
    }
}

#[async_trait]
impl ResultSink for MergeSink {
    async fn write(&self, item: &WorkItem, result: &ExtractionResult) -> Result<()> {
        let record = EnrichedRecord::from_extraction(item, result, &self.worker_id);
        let claim = item.claim_ref(&self.worker_id);
        self.engine.upsert(&record, Some(&claim)).await?;
        Ok(())
    }

    async fn quarantine(&self, item: &WorkItem, reason: &ZenError) -> Result<()> {
        let claim = item.claim_ref(&self.worker_id);
        let released = self
            .queue
            .quarantine(&claim, self.max_retries, &format!("partition key mismatch: {reason}"))
            .await?;
        if !released {
            warn!(item_id = item.id, "Quarantine skipped, claim no longer owned");
        }
        Ok(())
    }
}
