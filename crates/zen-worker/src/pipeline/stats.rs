//! Pipeline counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by all pipeline stages
#[derive(Debug, Default)]
pub struct PipelineStats {
    claimed: AtomicU64,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
    abandoned: AtomicU64,
    partition_mismatches: AtomicU64,
    write_failures: AtomicU64,
    max_input_depth: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub claimed: u64,
    /// Items whose outcome reached the store
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub in_flight: u64,
    /// Claimed items dropped at shutdown; the stale sweep returns them
    pub abandoned: u64,
    pub partition_mismatches: u64,
    /// Outcomes that could not be written within the retry budget
    pub write_failures: u64,
    pub max_input_depth: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_claimed(&self, count: usize) {
        self.claimed.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record the input queue depth seen right after an enqueue.
    pub fn observe_input_depth(&self, depth: usize) {
        self.max_input_depth.fetch_max(depth as u64, Ordering::AcqRel);
    }

    pub fn start_item(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub fn finish_item(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| Some(d.saturating_sub(1)));
    }

    pub fn record_written(&self, success: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_abandoned(&self, count: u64) {
        self.abandoned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_mismatch(&self) {
        self.partition_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Acquire),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            partition_mismatches: self.partition_mismatches.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            max_input_depth: self.max_input_depth.load(Ordering::Acquire),
        }
    }
}
