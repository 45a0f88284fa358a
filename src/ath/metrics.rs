//! Run counters for the batch scheduler.
//!
//! Workers bump these concurrently; the scheduler reads them for progress
//! lines and the final summary.

use crate::ath::error::SkipReason;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters for one scheduler run.
#[derive(Debug)]
pub struct RunMetrics {
    started: Instant,
    processed: AtomicU64,
    succeeded: AtomicU64,
    already_resolved: AtomicU64,
    skipped_no_data: AtomicU64,
    skipped_rate_limited: AtomicU64,
    skipped_transient: AtomicU64,
    skipped_malformed: AtomicU64,
    skipped_persistence: AtomicU64,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            already_resolved: AtomicU64::new(0),
            skipped_no_data: AtomicU64::new(0),
            skipped_rate_limited: AtomicU64::new(0),
            skipped_transient: AtomicU64::new(0),
            skipped_malformed: AtomicU64::new(0),
            skipped_persistence: AtomicU64::new(0),
        }
    }

    /// Count a call whose ATH was written. Returns the processed total.
    pub fn record_success(&self) -> u64 {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.bump_processed()
    }

    /// Count a call some other run resolved first. Returns the processed total.
    pub fn record_already_resolved(&self) -> u64 {
        self.already_resolved.fetch_add(1, Ordering::Relaxed);
        self.bump_processed()
    }

    /// Count a skipped call. Returns the processed total.
    pub fn record_skip(&self, reason: SkipReason) -> u64 {
        self.skip_counter(reason).fetch_add(1, Ordering::Relaxed);
        self.bump_processed()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> RunSummary {
        let skipped = SkipReason::all()
            .into_iter()
            .map(|reason| (reason.as_str(), self.skip_counter(reason).load(Ordering::Relaxed)))
            .collect();

        RunSummary {
            processed: self.processed(),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            already_resolved: self.already_resolved.load(Ordering::Relaxed),
            skipped,
            elapsed: self.started.elapsed(),
        }
    }

    fn bump_processed(&self) -> u64 {
        self.processed.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn skip_counter(&self, reason: SkipReason) -> &AtomicU64 {
        match reason {
            SkipReason::NoData => &self.skipped_no_data,
            SkipReason::RateLimited => &self.skipped_rate_limited,
            SkipReason::Transient => &self.skipped_transient,
            SkipReason::Malformed => &self.skipped_malformed,
            SkipReason::Persistence => &self.skipped_persistence,
        }
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a run's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub already_resolved: u64,
    /// Skipped calls per reason
    pub skipped: BTreeMap<&'static str, u64>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn total_skipped(&self) -> u64 {
        self.skipped.values().sum()
    }

    pub fn skipped_for(&self, reason: SkipReason) -> u64 {
        self.skipped.get(reason.as_str()).copied().unwrap_or(0)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} succeeded={} already_resolved={} skipped={}",
            self.processed,
            self.succeeded,
            self.already_resolved,
            self.total_skipped()
        )?;
        for (reason, count) in self.skipped.iter().filter(|(_, count)| **count > 0) {
            write!(f, " {}={}", reason, count)?;
        }
        write!(f, " elapsed={:.1}s", self.elapsed.as_secs_f64())
    }
}
