//! Multi-writer merge of enrichment results
//!
//! Any worker may write the record for any link, at any time, in any order.
//! [`MergeEngine::upsert`] folds an attempt into the stored row with a single
//! `INSERT ... ON CONFLICT (link, partition_key) DO UPDATE` so there is no
//! read-then-write window between writers:
//!
//! | field | rule |
//! |---|---|
//! | `emails`, `phones`, `whatsapp` | sorted, deduplicated union; NULL and empty entries dropped; counts recomputed |
//! | social profiles | incoming non-null wins, null keeps the stored value |
//! | status, error, timing | latest attempt wins |
//! | `scrape_count` | `+ 1` per call |
//!
//! When the attempt settles a claim, the owning work item is updated by the
//! same statement. [`MergedRecord`] is the in-memory model of the same rules.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::BTreeSet;
use tracing::{debug, warn};
use zen_common::ScrapeStatus;

use crate::db::{DbError, DbResult};
use crate::extractor::{ExtractionResult, SocialProfiles};
use crate::queue::{ClaimRef, WorkItem};

/// One attempt's enrichment data for a link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub link: String,
    pub partition_key: i32,
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub whatsapp: Vec<String>,
    pub social: SocialProfiles,
    pub scrape_status: ScrapeStatus,
    pub scrape_error: Option<String>,
    pub final_url: Option<String>,
    pub was_redirected: bool,
    pub pages_count: i32,
    pub scrape_time_ms: i64,
    /// Worker that produced the attempt
    pub server: String,
}

impl EnrichedRecord {
    pub fn from_extraction(item: &WorkItem, result: &ExtractionResult, server: &str) -> Self {
        Self {
            link: item.link.clone(),
            partition_key: item.partition_key,
            emails: result.emails.clone(),
            phones: result.phones.clone(),
            whatsapp: result.whatsapp.clone(),
            social: result.social.clone(),
            scrape_status: result.status,
            scrape_error: result.error.clone(),
            final_url: result.final_url.clone(),
            was_redirected: result.was_redirected,
            pages_count: result.pages_count,
            scrape_time_ms: i64::try_from(result.elapsed.as_millis()).unwrap_or(i64::MAX),
            server: server.to_string(),
        }
    }
}

/// Result of one [`MergeEngine::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MergeOutcome {
    /// The row did not exist before this call
    pub inserted: bool,
    pub scrape_count: i32,
    /// The supplied claim was still owned and has been settled
    pub claim_released: bool,
}

/// Stored enrichment row (maps to enriched_records table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredRecord {
    pub link: String,
    pub partition_key: i32,
    pub emails: Vec<String>,
    pub emails_count: i32,
    pub phones: Vec<String>,
    pub phones_count: i32,
    pub whatsapp: Vec<String>,
    pub whatsapp_count: i32,
    pub social_facebook: Option<String>,
    pub social_instagram: Option<String>,
    pub social_tiktok: Option<String>,
    pub social_youtube: Option<String>,
    #[sqlx(try_from = "String")]
    pub scrape_status: ScrapeStatus,
    pub scrape_error: Option<String>,
    pub scrape_count: i32,
    pub last_scrape_server: Option<String>,
}

const UPSERT_SQL: &str = r#"
WITH merged AS (
    INSERT INTO enriched_records AS r (
        link, partition_key,
        emails, emails_count, phones, phones_count, whatsapp, whatsapp_count,
        social_facebook, social_instagram, social_tiktok, social_youtube,
        scrape_status, scrape_error, scrape_final_url, scrape_was_redirected,
        scrape_pages_count, scrape_time_ms,
        scrape_count, last_scrape_server, last_scrape_at, updated_at
    )
    VALUES (
        $1, $2,
        zen_merge_array($3, '{}'), cardinality(zen_merge_array($3, '{}')),
        zen_merge_array($4, '{}'), cardinality(zen_merge_array($4, '{}')),
        zen_merge_array($5, '{}'), cardinality(zen_merge_array($5, '{}')),
        NULLIF($6, ''), NULLIF($7, ''), NULLIF($8, ''), NULLIF($9, ''),
        $10, $11, $12, $13,
        $14, $15,
        1, $16, NOW(), NOW()
    )
    ON CONFLICT (link, partition_key) DO UPDATE SET
        emails = zen_merge_array(r.emails, EXCLUDED.emails),
        emails_count = cardinality(zen_merge_array(r.emails, EXCLUDED.emails)),
        phones = zen_merge_array(r.phones, EXCLUDED.phones),
        phones_count = cardinality(zen_merge_array(r.phones, EXCLUDED.phones)),
        whatsapp = zen_merge_array(r.whatsapp, EXCLUDED.whatsapp),
        whatsapp_count = cardinality(zen_merge_array(r.whatsapp, EXCLUDED.whatsapp)),
        social_facebook = COALESCE(EXCLUDED.social_facebook, r.social_facebook),
        social_instagram = COALESCE(EXCLUDED.social_instagram, r.social_instagram),
        social_tiktok = COALESCE(EXCLUDED.social_tiktok, r.social_tiktok),
        social_youtube = COALESCE(EXCLUDED.social_youtube, r.social_youtube),
        scrape_status = EXCLUDED.scrape_status,
        scrape_error = EXCLUDED.scrape_error,
        scrape_final_url = EXCLUDED.scrape_final_url,
        scrape_was_redirected = EXCLUDED.scrape_was_redirected,
        scrape_pages_count = EXCLUDED.scrape_pages_count,
        scrape_time_ms = EXCLUDED.scrape_time_ms,
        scrape_count = r.scrape_count + 1,
        last_scrape_server = EXCLUDED.last_scrape_server,
        last_scrape_at = NOW(),
        updated_at = NOW()
    RETURNING (xmax = 0) AS inserted, scrape_count
),
released AS (
    UPDATE work_items w
    SET status = CASE WHEN $17 THEN 'success' ELSE 'failed' END,
        retry_count = w.retry_count + CASE WHEN $17 THEN 0 ELSE 1 END,
        last_retry_at = CASE WHEN $17 THEN w.last_retry_at ELSE NOW() END,
        last_error = CASE WHEN $17 THEN w.last_error ELSE $11 END,
        completed_at = NOW(),
        claimed_at = NULL,
        claimed_by = NULL
    WHERE w.id = $18 AND w.status = 'claimed' AND w.claimed_by = $19
    RETURNING w.id
)
SELECT m.inserted, m.scrape_count, EXISTS (SELECT 1 FROM released) AS claim_released
FROM merged m
"#;

/// Writes enrichment attempts into `enriched_records`
#[derive(Clone)]
pub struct MergeEngine {
    pool: PgPool,
}

impl MergeEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or merge `record`. With `claim`, also settle the claim the
    /// attempt was made under: success ends it as `success`; failure ends it
    /// as `failed` with `retry_count + 1`. Ownership is cleared either way.
    ///
    /// A claim that was already reclaimed or settled is left untouched and
    /// reported through [`MergeOutcome::claim_released`].
    pub async fn upsert(&self, record: &EnrichedRecord, claim: Option<&ClaimRef>) -> DbResult<MergeOutcome> {
        let outcome: MergeOutcome = sqlx::query_as(UPSERT_SQL)
            .bind(&record.link)
            .bind(record.partition_key)
            .bind(&record.emails)
            .bind(&record.phones)
            .bind(&record.whatsapp)
            .bind(record.social.facebook.as_deref())
            .bind(record.social.instagram.as_deref())
            .bind(record.social.tiktok.as_deref())
            .bind(record.social.youtube.as_deref())
            .bind(record.scrape_status.as_str())
            .bind(record.scrape_error.as_deref())
            .bind(record.final_url.as_deref())
            .bind(record.was_redirected)
            .bind(record.pages_count)
            .bind(record.scrape_time_ms)
            .bind(&record.server)
            .bind(record.scrape_status.is_success())
            .bind(claim.map(|c| c.item_id))
            .bind(claim.map(|c| c.worker_id.as_str()))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DbError::from(e).for_row(&record.link, record.partition_key))?;

        if claim.is_some() && !outcome.claim_released {
            warn!(link = %record.link, "Merged result for a claim this worker no longer owns");
        }

        debug!(
            link = %record.link,
            partition_key = record.partition_key,
            inserted = outcome.inserted,
            scrape_count = outcome.scrape_count,
            "Merged enrichment record"
        );

        Ok(outcome)
    }

    /// Fetch the stored row for `link`, if any.
    pub async fn get(&self, link: &str) -> DbResult<Option<StoredRecord>> {
        let record = sqlx::query_as(
            r#"
            SELECT link, partition_key, emails, emails_count, phones, phones_count,
                   whatsapp, whatsapp_count, social_facebook, social_instagram,
                   social_tiktok, social_youtube, scrape_status, scrape_error,
                   scrape_count, last_scrape_server
            FROM enriched_records
            WHERE link = $1 AND partition_key = $2
            "#,
        )
        .bind(link)
        .bind(zen_common::partition_key(link))
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}

/// Union of two value lists under the array merge rule.
pub fn merge_values(existing: &[String], incoming: &[String]) -> Vec<String> {
    existing
        .iter()
        .chain(incoming)
        .filter(|v| !v.is_empty())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// In-memory model of a merged row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedRecord {
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub whatsapp: Vec<String>,
    pub social: SocialProfiles,
    pub scrape_status: Option<ScrapeStatus>,
    pub scrape_error: Option<String>,
    pub scrape_count: i32,
}

impl MergedRecord {
    pub fn apply(&mut self, record: &EnrichedRecord) {
        self.emails = merge_values(&self.emails, &record.emails);
        self.phones = merge_values(&self.phones, &record.phones);
        self.whatsapp = merge_values(&self.whatsapp, &record.whatsapp);
        self.social.merge_from(&record.social);
        self.scrape_status = Some(record.scrape_status);
        self.scrape_error = record.scrape_error.clone();
        self.scrape_count += 1;
    }

    pub fn emails_count(&self) -> usize {
        self.emails.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(emails: &[&str]) -> EnrichedRecord {
        EnrichedRecord {
            link: "https://a.com".into(),
            partition_key: 15,
            emails: emails.iter().map(|e| e.to_string()).collect(),
            phones: Vec::new(),
            whatsapp: Vec::new(),
            social: SocialProfiles::default(),
            scrape_status: ScrapeStatus::Success,
            scrape_error: None,
            final_url: None,
            was_redirected: false,
            pages_count: 1,
            scrape_time_ms: 10,
            server: "w1".into(),
        }
    }

    #[test]
    fn test_two_upserts_union_emails() {
        let mut merged = MergedRecord::default();
        merged.apply(&record(&["x@a.com"]));
        merged.apply(&record(&["y@a.com", "x@a.com"]));

        assert_eq!(merged.emails, vec!["x@a.com".to_string(), "y@a.com".to_string()]);
        assert_eq!(merged.emails_count(), 2);
        assert_eq!(merged.scrape_count, 2);
    }

    #[test]
    fn test_empty_entries_are_dropped() {
        let values = merge_values(&["".into(), "a".into()], &["a".into(), "".into(), "b".into()]);
        assert_eq!(values, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_failure_keeps_data_and_overwrites_status() {
        let mut merged = MergedRecord::default();
        let mut first = record(&["x@a.com"]);
        first.social.facebook = Some("https://facebook.com/a".into());
        merged.apply(&first);

        let mut second = record(&[]);
        second.scrape_status = ScrapeStatus::Failed;
        second.scrape_error = Some("timeout".into());
        merged.apply(&second);

        assert_eq!(merged.emails, vec!["x@a.com".to_string()]);
        assert_eq!(merged.social.facebook.as_deref(), Some("https://facebook.com/a"));
        assert_eq!(merged.scrape_status, Some(ScrapeStatus::Failed));
        assert_eq!(merged.scrape_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_from_extraction_copies_item_identity() {
        let item = WorkItem {
            id: 3,
            link: "https://a.com".into(),
            partition_key: 15,
            country_code: "DE".into(),
            category: None,
            status: zen_common::WorkStatus::Claimed,
            claimed_at: None,
            claimed_by: Some("w1".into()),
            retry_count: 0,
            last_retry_at: None,
            last_error: None,
        };
        let result = ExtractionResult::success()
            .with_emails(["x@a.com"])
            .with_elapsed(std::time::Duration::from_millis(1500));
        let rec = EnrichedRecord::from_extraction(&item, &result, "w1");
        assert_eq!(rec.partition_key, 15);
        assert_eq!(rec.scrape_time_ms, 1500);
        assert_eq!(rec.server, "w1");
    }

    fn arb_updates() -> impl Strategy<Value = Vec<Vec<String>>> {
        prop::collection::vec(
            prop::collection::vec(prop_oneof![Just(String::new()), "[a-d]@[a-c]\\.com"], 0..4),
            1..6,
        )
    }

    proptest! {
        #[test]
        fn prop_merge_order_does_not_matter(updates in arb_updates(), seed in any::<u64>()) {
            let mut forward = MergedRecord::default();
            for u in &updates {
                forward.apply(&EnrichedRecord { emails: u.clone(), ..record(&[]) });
            }

            let mut shuffled = updates.clone();
            let len = shuffled.len();
            for i in 0..len {
                let j = (seed.wrapping_mul(i as u64 + 1) % len as u64) as usize;
                shuffled.swap(i, j);
            }
            let mut backward = MergedRecord::default();
            for u in &shuffled {
                backward.apply(&EnrichedRecord { emails: u.clone(), ..record(&[]) });
            }

            prop_assert_eq!(&forward.emails, &backward.emails);

            let expected: BTreeSet<String> =
                updates.iter().flatten().filter(|e| !e.is_empty()).cloned().collect();
            prop_assert_eq!(forward.emails, expected.into_iter().collect::<Vec<_>>());
        }

        #[test]
        fn prop_reapplying_is_a_noop_on_arrays(updates in arb_updates()) {
            let mut once = MergedRecord::default();
            for u in &updates {
                once.apply(&EnrichedRecord { emails: u.clone(), ..record(&[]) });
            }
            let mut twice = once.clone();
            for u in &updates {
                twice.apply(&EnrichedRecord { emails: u.clone(), ..record(&[]) });
            }
            prop_assert_eq!(once.emails, twice.emails);
        }
    }
}
