//! Merge engine and store-backed pipeline tests against a real PostgreSQL
//!
//! These tests require Docker. Run with:
//!
//! ```bash
//! cargo test -p zen-worker --test merge_tests -- --ignored --nocapture
//! ```

mod common;

use async_trait::async_trait;
use common::{init_test_tracing, TestPostgres};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use zen_common::{ScrapeStatus, WorkStatus};
use zen_worker::db::DbError;
use zen_worker::extractor::{ExtractionResult, Extractor, SocialProfiles};
use zen_worker::merge::{EnrichedRecord, MergeEngine};
use zen_worker::pipeline::{LocalScheduler, MergeSink, QueueSource, SchedulerConfig};
use zen_worker::queue::{ClaimFilter, RetryPolicy};

fn record(link: &str, emails: &[&str]) -> EnrichedRecord {
    EnrichedRecord {
        link: link.to_string(),
        partition_key: zen_common::partition_key(link),
        emails: emails.iter().map(|e| e.to_string()).collect(),
        phones: Vec::new(),
        whatsapp: Vec::new(),
        social: SocialProfiles::default(),
        scrape_status: ScrapeStatus::Success,
        scrape_error: None,
        final_url: None,
        was_redirected: false,
        pages_count: 1,
        scrape_time_ms: 120,
        server: "w1".to_string(),
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_second_upsert_unions_emails() {
    init_test_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL container");
    let engine = MergeEngine::new(pg.pool_clone());

    let first = engine.upsert(&record("https://a.com", &["x@a.com"]), None).await.unwrap();
    assert!(first.inserted);
    assert_eq!(first.scrape_count, 1);

    let second = engine
        .upsert(&record("https://a.com", &["y@a.com", "x@a.com"]), None)
        .await
        .unwrap();
    assert!(!second.inserted);
    assert_eq!(second.scrape_count, 2);

    let stored = engine.get("https://a.com").await.unwrap().unwrap();
    assert_eq!(stored.emails, vec!["x@a.com".to_string(), "y@a.com".to_string()]);
    assert_eq!(stored.emails_count, 2);

    // Re-applying an update changes nothing but the attempt counter
    engine.upsert(&record("https://a.com", &["x@a.com"]), None).await.unwrap();
    let again = engine.get("https://a.com").await.unwrap().unwrap();
    assert_eq!(again.emails, stored.emails);
    assert_eq!(again.scrape_count, 3);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_concurrent_upserts_lose_nothing() {
    init_test_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL container");
    let engine = MergeEngine::new(pg.pool_clone());

    let mut handles = Vec::new();
    for i in 0..20 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let email = format!("user{}@a.com", i % 10);
            engine
                .upsert(&record("https://a.com", &[email.as_str(), ""]), None)
                .await
                .unwrap()
        }));
    }
    let inserted = count_inserted(handles).await;
    assert_eq!(inserted, 1);

    let stored = engine.get("https://a.com").await.unwrap().unwrap();
    assert_eq!(stored.emails.len(), 10);
    assert_eq!(stored.emails_count, 10);
    assert_eq!(stored.scrape_count, 20);
}

async fn count_inserted(handles: Vec<tokio::task::JoinHandle<zen_worker::MergeOutcome>>) -> usize {
    let mut inserted = 0;
    for handle in handles {
        if handle.await.unwrap().inserted {
            inserted += 1;
        }
    }
    inserted
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_scalar_fields_keep_existing_on_absence() {
    init_test_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL container");
    let engine = MergeEngine::new(pg.pool_clone());

    let mut first = record("https://a.com", &[]);
    first.social.facebook = Some("https://facebook.com/a".into());
    first.social.instagram = Some("https://instagram.com/a".into());
    engine.upsert(&first, None).await.unwrap();

    let mut second = record("https://a.com", &[]);
    second.social.instagram = Some("https://instagram.com/a2".into());
    second.social.tiktok = Some(String::new());
    second.scrape_status = ScrapeStatus::Failed;
    second.scrape_error = Some("timeout".into());
    second.server = "w2".into();
    engine.upsert(&second, None).await.unwrap();

    let stored = engine.get("https://a.com").await.unwrap().unwrap();
    assert_eq!(stored.social_facebook.as_deref(), Some("https://facebook.com/a"));
    assert_eq!(stored.social_instagram.as_deref(), Some("https://instagram.com/a2"));
    assert_eq!(stored.social_tiktok, None);
    assert_eq!(stored.scrape_status, ScrapeStatus::Failed);
    assert_eq!(stored.scrape_error.as_deref(), Some("timeout"));
    assert_eq!(stored.last_scrape_server.as_deref(), Some("w2"));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_upsert_settles_claim() {
    init_test_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL container");
    let engine = MergeEngine::new(pg.pool_clone());
    let queue = pg.queue();
    pg.seed(&["https://a.com", "https://b.com"]).await.unwrap();

    let claimed = queue.claim_batch("w1", 2, &ClaimFilter::all()).await.unwrap();
    let a = claimed.iter().find(|i| i.link == "https://a.com").unwrap();
    let b = claimed.iter().find(|i| i.link == "https://b.com").unwrap();

    let ok = engine
        .upsert(&record(&a.link, &["x@a.com"]), Some(&a.claim_ref("w1")))
        .await
        .unwrap();
    assert!(ok.claim_released);

    let mut failed = record(&b.link, &[]);
    failed.scrape_status = ScrapeStatus::Failed;
    failed.scrape_error = Some("connection refused".into());
    let out = engine.upsert(&failed, Some(&b.claim_ref("w1"))).await.unwrap();
    assert!(out.claim_released);

    // The claim is gone; a late duplicate write still merges but releases nothing
    let late = engine
        .upsert(&record(&a.link, &["z@a.com"]), Some(&a.claim_ref("w1")))
        .await
        .unwrap();
    assert!(!late.claim_released);

    let rows: Vec<(String, String, i32, Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT link, status, retry_count, claimed_by, last_error FROM work_items ORDER BY link",
    )
    .fetch_all(pg.pool())
    .await
    .unwrap();

    assert_eq!(rows[0].0, "https://a.com");
    assert_eq!(rows[0].1, WorkStatus::Success.as_str());
    assert_eq!(rows[0].2, 0);
    assert_eq!(rows[0].3, None);

    assert_eq!(rows[1].1, WorkStatus::Failed.as_str());
    assert_eq!(rows[1].2, 1);
    assert_eq!(rows[1].3, None);
    assert_eq!(rows[1].4.as_deref(), Some("connection refused"));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_upsert_rejects_wrong_partition_key() {
    init_test_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL container");
    let engine = MergeEngine::new(pg.pool_clone());

    let mut bad = record("https://a.com", &["x@a.com"]);
    bad.partition_key = 7;
    let err = engine.upsert(&bad, None).await.unwrap_err();
    assert!(matches!(
        err,
        DbError::PartitionKeyMismatch {
            expected: 15,
            actual: 7,
            ..
        }
    ));

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM enriched_records")
        .fetch_one(pg.pool())
        .await
        .unwrap();
    assert_eq!(count, 0);
}

struct StaticExtractor;

#[async_trait]
impl Extractor for StaticExtractor {
    async fn extract(&self, url: &str, _timeout: Duration) -> ExtractionResult {
        if url.contains("down") {
            ExtractionResult::failed("connection refused", Duration::from_millis(5))
        } else {
            ExtractionResult::success().with_emails(["info@example.org"])
        }
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_pipeline_drains_backlog_into_store() {
    init_test_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL container");
    let queue = pg.queue();

    let links: Vec<String> = (0..30)
        .map(|i| {
            if i % 10 == 0 {
                format!("https://down{i}.example/")
            } else {
                format!("https://up{i}.example/")
            }
        })
        .collect();
    let refs: Vec<&str> = links.iter().map(String::as_str).collect();
    pg.seed(&refs).await.unwrap();

    let config = SchedulerConfig {
        input_capacity: 5,
        output_capacity: 5,
        consumers: 3,
        resource_permits: 2,
        exit_when_drained: true,
        ..SchedulerConfig::default()
    };
    let retry = RetryPolicy {
        max_retries: 3,
        cooldown: Duration::from_secs(3600),
    };
    let scheduler = LocalScheduler::new(
        config,
        Arc::new(QueueSource::new(queue.clone(), "w1", 7, ClaimFilter::all(), retry)),
        Arc::new(MergeSink::new(MergeEngine::new(pg.pool_clone()), queue.clone(), "w1", 3)),
        Arc::new(StaticExtractor),
    )
    .unwrap();

    let snapshot = scheduler.run(CancellationToken::new()).await.unwrap();
    assert_eq!(snapshot.processed, 30);
    assert_eq!(snapshot.succeeded, 27);
    assert_eq!(snapshot.failed, 3);

    let stats = queue.stats(3).await.unwrap();
    assert_eq!(stats.success, 27);
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.claimed, 0);
    assert_eq!(stats.pending, 0);

    let records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM enriched_records")
        .fetch_one(pg.pool())
        .await
        .unwrap();
    assert_eq!(records, 30);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_mismatched_item_is_quarantined() {
    init_test_tracing();
    let pg = TestPostgres::start().await.expect("Failed to start PostgreSQL container");
    let queue = pg.queue();
    pg.seed(&["https://a.com"]).await.unwrap();

    // Simulate a row written by a process with a different key function
    sqlx::query("ALTER TABLE work_items DROP CONSTRAINT work_items_partition_key_pinned")
        .execute(pg.pool())
        .await
        .unwrap();
    sqlx::query("UPDATE work_items SET partition_key = 7 WHERE link = 'https://a.com'")
        .execute(pg.pool())
        .await
        .unwrap();

    let scheduler = LocalScheduler::new(
        SchedulerConfig {
            exit_when_drained: true,
            ..SchedulerConfig::default()
        },
        Arc::new(QueueSource::new(queue.clone(), "w1", 5, ClaimFilter::all(), RetryPolicy::default())),
        Arc::new(MergeSink::new(MergeEngine::new(pg.pool_clone()), queue.clone(), "w1", 3)),
        Arc::new(StaticExtractor),
    )
    .unwrap();

    let snapshot = scheduler.run(CancellationToken::new()).await.unwrap();
    assert_eq!(snapshot.partition_mismatches, 1);
    assert_eq!(snapshot.processed, 0);

    let (status, retry_count, last_error): (String, i32, Option<String>) =
        sqlx::query_as("SELECT status, retry_count, last_error FROM work_items WHERE link = 'https://a.com'")
            .fetch_one(pg.pool())
            .await
            .unwrap();
    assert_eq!(status, "failed");
    assert_eq!(retry_count, 3);
    assert!(last_error.unwrap_or_default().contains("partition key mismatch"));

    let records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM enriched_records")
        .fetch_one(pg.pool())
        .await
        .unwrap();
    assert_eq!(records, 0);
}
