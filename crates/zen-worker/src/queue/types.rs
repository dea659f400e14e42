//! Types for the claim protocol

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use zen_common::WorkStatus;

/// Unknown-country marker used when a source row has no usable code.
pub const UNKNOWN_COUNTRY: &str = "XX";

/// Work item (maps to work_items table)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkItem {
    pub id: i64,
    pub link: String,
    pub partition_key: i32,
    pub country_code: String,
    pub category: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: WorkStatus,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl WorkItem {
    /// Ownership token for the claim this item was returned under.
    pub fn claim_ref(&self, worker_id: &str) -> ClaimRef {
        ClaimRef {
            item_id: self.id,
            worker_id: worker_id.to_string(),
        }
    }
}

/// Source row to be added to the backlog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub link: String,
    pub country_code: Option<String>,
    pub category: Option<String>,
}

impl NewWorkItem {
    pub fn new(link: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            ..Default::default()
        }
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country_code = Some(country.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// Identifies one claim: the item and the worker that owns it. Completion
/// statements only apply while `claimed_by` still equals `worker_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimRef {
    pub item_id: i64,
    pub worker_id: String,
}

/// Workload restriction for claim calls
///
/// Category keywords match case-insensitively as substrings; an item matches
/// when any keyword does.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimFilter {
    /// Restrict to these partitions. `None` means all.
    pub partitions: Option<Vec<i32>>,
    pub country_code: Option<String>,
    pub category_keywords: Vec<String>,
}

impl ClaimFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn partitions(mut self, partitions: impl IntoIterator<Item = i32>) -> Self {
        self.partitions = Some(partitions.into_iter().collect());
        self
    }

    pub fn country(mut self, code: impl Into<String>) -> Self {
        self.country_code = Some(code.into().to_uppercase());
        self
    }

    pub fn category(mut self, keyword: impl Into<String>) -> Self {
        self.category_keywords.push(keyword.into());
        self
    }

    /// `ILIKE` patterns for the category keywords, metacharacters escaped.
    pub fn category_patterns(&self) -> Vec<String> {
        self.category_keywords
            .iter()
            .map(|kw| kw.trim())
            .filter(|kw| !kw.is_empty())
            .map(|kw| format!("%{}%", escape_like(kw)))
            .collect()
    }

    /// Same predicate the claim statements apply, evaluated in memory.
    pub fn matches(&self, item: &WorkItem) -> bool {
        if let Some(ref partitions) = self.partitions {
            if !partitions.contains(&item.partition_key) {
                return false;
            }
        }

        if let Some(ref country) = self.country_code {
            if !item.country_code.eq_ignore_ascii_case(country) {
                return false;
            }
        }

        let keywords: Vec<String> = self
            .category_keywords
            .iter()
            .map(|kw| kw.trim().to_lowercase())
            .filter(|kw| !kw.is_empty())
            .collect();

        if keywords.is_empty() {
            return true;
        }

        match item.category {
            Some(ref category) => {
                let category = category.to_lowercase();
                keywords.iter().any(|kw| category.contains(kw.as_str()))
            },
            None => false,
        }
    }
}

/// Escape `\`, `%` and `_` so a keyword matches literally under `LIKE`.
pub fn escape_like(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len());
    for c in keyword.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Upper-case ISO alpha-2 code, or [`UNKNOWN_COUNTRY`].
pub fn normalize_country(code: Option<&str>) -> String {
    match code.map(str::trim) {
        Some(c) if c.len() == 2 && c.chars().all(|ch| ch.is_ascii_alphabetic()) => {
            c.to_ascii_uppercase()
        },
        _ => UNKNOWN_COUNTRY.to_string(),
    }
}

/// Retry eligibility for failed items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            cooldown: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// In-memory form of the eligibility predicate used by `claim_for_retry`.
    pub fn is_eligible(&self, item: &WorkItem, now: DateTime<Utc>) -> bool {
        if item.status != WorkStatus::Failed || item.retry_count >= self.max_retries {
            return false;
        }
        match item.last_retry_at {
            None => true,
            Some(last) => {
                let cooldown = chrono::Duration::from_std(self.cooldown)
                    .unwrap_or(chrono::Duration::MAX);
                now.signed_duration_since(last) >= cooldown
            },
        }
    }
}

/// Final result reported for a claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompletionOutcome {
    Success,
    Failed { error: String },
}

impl CompletionOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CompletionOutcome::Success)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            CompletionOutcome::Success => None,
            CompletionOutcome::Failed { error } => Some(error),
        }
    }
}

/// Item counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub claimed: i64,
    pub success: i64,
    pub failed: i64,
    /// Failed items that used up their retry budget
    pub exhausted: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.claimed + self.success + self.failed
    }
}
