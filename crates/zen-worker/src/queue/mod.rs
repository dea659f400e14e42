//! Work queue and claim protocol
//!
//! Workers never coordinate with each other directly. Every ownership change
//! happens inside one store statement:
//!
//! - [`WorkQueue::claim_batch`] / [`WorkQueue::claim_for_retry`] lock candidate
//!   rows with `FOR UPDATE SKIP LOCKED` and flip them to `claimed` in the same
//!   transaction. Rows locked by a concurrent claimer are skipped, so two
//!   workers never receive the same item and the row lock ends with the
//!   transaction, crash included.
//! - [`WorkQueue::release_stale_claims`] moves claims older than a timeout back
//!   to `failed` with `retry_count + 1`.
//! - [`WorkQueue::complete`] settles a claim that produced no enrichment row.
//!   Completions carrying a record go through
//!   [`MergeEngine::upsert`](crate::merge::MergeEngine::upsert).
//!
//! Claimed items are handed out in priority order: never-retried first, then
//! lowest `retry_count`, then oldest `last_retry_at` (nulls first).

mod types;

pub use types::{
    escape_like, normalize_country, ClaimFilter, ClaimRef, CompletionOutcome, NewWorkItem,
    QueueStats, RetryPolicy, WorkItem, UNKNOWN_COUNTRY,
};

use sqlx::PgPool;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zen_common::partition;

use crate::db::{DbError, DbResult};

/// Columns returned by every statement that hands out work items.
const RETURNING_ITEM: &str = "w.id, w.link, w.partition_key, w.country_code, w.category, \
     w.status, w.claimed_at, w.claimed_by, w.retry_count, w.last_retry_at, w.last_error";

/// Shared ordering and filter clauses for both claim paths. `$2` partitions,
/// `$3` country, `$4` category patterns.
const FILTER_CLAUSE: &str = "($2::int[] IS NULL OR partition_key = ANY($2)) \
     AND ($3::text IS NULL OR country_code = $3) \
     AND (cardinality($4::text[]) = 0 OR category ILIKE ANY($4))";

const PRIORITY_ORDER: &str =
    "(retry_count = 0) DESC, retry_count ASC, last_retry_at ASC NULLS FIRST, id ASC";

/// Claim protocol over the `work_items` table
#[derive(Clone)]
pub struct WorkQueue {
    pool: PgPool,
}

impl WorkQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Claim up to `batch_size` pending items matching `filter`.
    ///
    /// Returns fewer items, possibly none, when fewer are available. Rows held
    /// by another claimer are skipped rather than waited on.
    pub async fn claim_batch(
        &self,
        worker_id: &str,
        batch_size: u32,
        filter: &ClaimFilter,
    ) -> DbResult<Vec<WorkItem>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            "WITH candidates AS ( \
                 SELECT id FROM work_items \
                 WHERE status = 'pending' AND {FILTER_CLAUSE} \
                 ORDER BY {PRIORITY_ORDER} \
                 LIMIT $5 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE work_items w \
             SET status = 'claimed', claimed_at = NOW(), claimed_by = $1 \
             FROM candidates c \
             WHERE w.id = c.id \
             RETURNING {RETURNING_ITEM}"
        );

        let mut tx = self.pool.begin().await?;
        let mut items: Vec<WorkItem> = sqlx::query_as(&sql)
            .bind(worker_id)
            .bind(filter.partitions.as_deref())
            .bind(filter.country_code.as_deref())
            .bind(filter.category_patterns())
            .bind(i64::from(batch_size))
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        sort_by_priority(&mut items);

        debug!(worker_id, requested = batch_size, claimed = items.len(), "Claimed batch");
        Ok(items)
    }

    /// Claim up to `batch_size` failed items that are eligible for another
    /// attempt: `retry_count < max_retries` and the cooldown has elapsed since
    /// `last_retry_at`.
    pub async fn claim_for_retry(
        &self,
        worker_id: &str,
        batch_size: u32,
        policy: &RetryPolicy,
        filter: &ClaimFilter,
    ) -> DbResult<Vec<WorkItem>> {
        if batch_size == 0 || policy.max_retries <= 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            "WITH candidates AS ( \
                 SELECT id FROM work_items \
                 WHERE status = 'failed' \
                   AND retry_count < $6 \
                   AND (last_retry_at IS NULL OR last_retry_at <= NOW() - make_interval(secs => $7)) \
                   AND {FILTER_CLAUSE} \
                 ORDER BY {PRIORITY_ORDER} \
                 LIMIT $5 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE work_items w \
             SET status = 'claimed', claimed_at = NOW(), claimed_by = $1 \
             FROM candidates c \
             WHERE w.id = c.id \
             RETURNING {RETURNING_ITEM}"
        );

        let mut tx = self.pool.begin().await?;
        let mut items: Vec<WorkItem> = sqlx::query_as(&sql)
            .bind(worker_id)
            .bind(filter.partitions.as_deref())
            .bind(filter.country_code.as_deref())
            .bind(filter.category_patterns())
            .bind(i64::from(batch_size))
            .bind(policy.max_retries)
            .bind(policy.cooldown.as_secs_f64())
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        sort_by_priority(&mut items);

        debug!(worker_id, claimed = items.len(), "Claimed retry batch");
        Ok(items)
    }

    /// Move every claim older than `timeout` to `failed`, bump its
    /// `retry_count`, note the timeout in `last_error`, and clear ownership.
    ///
    /// Safe to run from many workers at once: each stale row is updated by
    /// exactly one sweeper and no longer matches afterwards.
    pub async fn release_stale_claims(&self, timeout: Duration) -> DbResult<u64> {
        let reclaimed: Vec<(i64, String, Option<String>)> = sqlx::query_as(
            r#"
            WITH stale AS (
                SELECT id, claimed_by
                FROM work_items
                WHERE status = 'claimed'
                  AND claimed_at < NOW() - make_interval(secs => $1::float8)
                FOR UPDATE SKIP LOCKED
            )
            UPDATE work_items w
            SET status = 'failed',
                retry_count = w.retry_count + 1,
                last_retry_at = NOW(),
                last_error = COALESCE(w.last_error || '; ', '')
                    || 'claim by ' || COALESCE(s.claimed_by, '?')
                    || ' timed out after ' || $1::float8 || 's',
                claimed_at = NULL,
                claimed_by = NULL
            FROM stale s
            WHERE w.id = s.id
            RETURNING w.id, w.link, s.claimed_by
            "#,
        )
        .bind(timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        for (id, link, owner) in &reclaimed {
            warn!(
                item_id = id,
                link = %link,
                stale_owner = owner.as_deref().unwrap_or("?"),
                timeout_ms = timeout.as_millis() as u64,
                "Reclaimed stale claim"
            );
        }

        Ok(reclaimed.len() as u64)
    }

    /// Add links to the backlog as pending items. Existing links are left
    /// untouched. Returns how many rows were inserted.
    pub async fn enqueue(&self, items: &[NewWorkItem]) -> DbResult<u64> {
        let mut links = Vec::with_capacity(items.len());
        let mut keys = Vec::with_capacity(items.len());
        let mut countries = Vec::with_capacity(items.len());
        let mut categories = Vec::with_capacity(items.len());

        for item in items {
            let link = item.link.trim();
            if link.is_empty() {
                return Err(DbError::InvalidLink(item.link.clone()));
            }
            links.push(link.to_string());
            keys.push(partition::partition_key(link));
            countries.push(normalize_country(item.country_code.as_deref()));
            categories.push(
                item.category
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string),
            );
        }

        if links.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO work_items (link, partition_key, country_code, category)
            SELECT * FROM UNNEST($1::text[], $2::int[], $3::text[], $4::text[])
            ON CONFLICT (link) DO NOTHING
            "#,
        )
        .bind(&links)
        .bind(&keys)
        .bind(&countries)
        .bind(&categories)
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::from(e).for_row(&links[0], keys[0]))?;

        info!(submitted = links.len(), inserted = result.rows_affected(), "Enqueued work items");
        Ok(result.rows_affected())
    }

    /// Settle a claim without writing an enrichment row.
    ///
    /// Returns `false` when the claim is no longer owned by `claim.worker_id`
    /// (reclaimed by the sweep, or already settled).
    pub async fn complete(&self, claim: &ClaimRef, outcome: &CompletionOutcome) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = CASE WHEN $3 THEN 'success' ELSE 'failed' END,
                retry_count = retry_count + CASE WHEN $3 THEN 0 ELSE 1 END,
                last_retry_at = CASE WHEN $3 THEN last_retry_at ELSE NOW() END,
                last_error = CASE WHEN $3 THEN last_error ELSE $4 END,
                completed_at = NOW(),
                claimed_at = NULL,
                claimed_by = NULL
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(claim.item_id)
        .bind(&claim.worker_id)
        .bind(outcome.is_success())
        .bind(outcome.error())
        .execute(&self.pool)
        .await?;

        let owned = result.rows_affected() == 1;
        if !owned {
            warn!(item_id = claim.item_id, worker_id = %claim.worker_id, "Claim lost before completion");
        }
        Ok(owned)
    }

    /// Take an item out of circulation after a partition key mismatch. The
    /// item ends `failed` with its retry budget used up so no retry claims it.
    pub async fn quarantine(&self, claim: &ClaimRef, max_retries: i32, reason: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = 'failed',
                retry_count = GREATEST(retry_count, $3),
                last_retry_at = NOW(),
                last_error = $4,
                claimed_at = NULL,
                claimed_by = NULL
            WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(claim.item_id)
        .bind(&claim.worker_id)
        .bind(max_retries)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Item counts per status. `exhausted` counts failed items with
    /// `retry_count >= max_retries`.
    pub async fn stats(&self, max_retries: i32) -> DbResult<QueueStats> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT status,
                   COUNT(*) AS count,
                   COUNT(*) FILTER (WHERE retry_count >= $1) AS exhausted
            FROM work_items
            GROUP BY status
            "#,
        )
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, count, exhausted) in rows {
            match status.as_str() {
                "pending" => stats.pending = count,
                "claimed" => stats.claimed = count,
                "success" => stats.success = count,
                "failed" => {
                    stats.failed = count;
                    stats.exhausted = exhausted;
                },
                other => warn!(status = other, "Unknown work item status"),
            }
        }

        Ok(stats)
    }

    /// Pending item counts per country code.
    pub async fn pending_by_country(&self) -> DbResult<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT country_code, COUNT(*)
            FROM work_items
            WHERE status = 'pending'
            GROUP BY country_code
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    /// Run [`release_stale_claims`](Self::release_stale_claims) every
    /// `interval` until `cancel` fires. Sweep errors are logged and retried on
    /// the next tick.
    pub fn spawn_stale_sweeper(
        &self,
        timeout: Duration,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {},
                }

                match queue.release_stale_claims(timeout).await {
                    Ok(0) => {},
                    Ok(count) => info!(count, "Stale claims returned to the retry pool"),
                    Err(e) => warn!(error = %e, "Stale claim sweep failed"),
                }
            }

            debug!("Stale claim sweeper stopped");
        })
    }
}

/// `RETURNING` order is unspecified; restore the claim priority.
fn sort_by_priority(items: &mut [WorkItem]) {
    items.sort_by(|a, b| {
        (a.retry_count != 0)
            .cmp(&(b.retry_count != 0))
            .then(a.retry_count.cmp(&b.retry_count))
            .then_with(|| match (a.last_retry_at, b.last_retry_at) {
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(x), Some(y)) => x.cmp(&y),
            })
            .then(a.id.cmp(&b.id))
    });
}
