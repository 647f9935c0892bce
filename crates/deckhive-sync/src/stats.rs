//! Run statistics and rate-limited progress logging.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::executor::TaskError;

/// Capacity of the recent-error ring.
pub const MAX_RECENT_ERRORS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub url: String,
    pub dataset: String,
    pub category: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Thread-safe counters shared by every worker of one run.
#[derive(Debug, Default)]
pub struct ExtractStats {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    normalized: AtomicU64,
    duplicates: AtomicU64,
    skipped: AtomicU64,
    cancelled: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    recent_errors: Mutex<VecDeque<ErrorRecord>>,
    validation_failures: Mutex<BTreeMap<String, u64>>,
}

/// Point-in-time copy of [`ExtractStats`], also the JSON export shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub cache_hit_rate: f64,
    pub normalized: u64,
    pub duplicates: u64,
    pub skipped: u64,
    pub cancelled: u64,
    pub validation_failures: BTreeMap<String, u64>,
    pub recent_errors: Vec<ErrorRecord>,
}

impl ExtractStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.successful.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, url: &str, dataset: &str, category: &str, err: &dyn fmt::Display) {
        self.count_failure();

        let mut recent = self.recent_errors.lock();
        if recent.len() == MAX_RECENT_ERRORS {
            recent.pop_front();
        }
        recent.push_back(ErrorRecord {
            url: url.to_string(),
            dataset: dataset.to_string(),
            category: category.to_string(),
            error: err.to_string(),
            at: Utc::now(),
        });
    }

    /// Records a failed task under its taxonomy category; validation failures
    /// are additionally bucketed by the invariant they broke. Cancelled tasks
    /// are counted but stay out of the recent-error ring.
    pub fn record_categorized_error(&self, url: &str, dataset: &str, err: &TaskError) {
        match err {
            TaskError::Cancelled => {
                self.count_failure();
                self.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            TaskError::Validation(validation) => {
                self.record_validation_failure(validation.category());
                self.record_error(url, dataset, err.category(), err);
            }
            _ => self.record_error(url, dataset, err.category(), err),
        }
    }

    fn count_failure(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_failure(&self, category: &str) {
        *self
            .validation_failures
            .lock()
            .entry(category.to_string())
            .or_default() += 1;
    }

    pub fn record_normalized(&self, names: usize) {
        self.normalized.fetch_add(names as u64, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn successful(&self) -> u64 {
        self.successful.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn success_rate(&self) -> f64 {
        ratio(self.successful(), self.total())
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        ratio(hits, hits + self.cache_misses.load(Ordering::Relaxed))
    }

    /// Recent errors, oldest first.
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.lock().iter().cloned().collect()
    }

    pub fn validation_failures(&self) -> BTreeMap<String, u64> {
        self.validation_failures.lock().clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total(),
            successful: self.successful(),
            failed: self.failed(),
            success_rate: self.success_rate(),
            cache_hit_rate: self.cache_hit_rate(),
            normalized: self.normalized.load(Ordering::Relaxed),
            duplicates: self.duplicates(),
            skipped: self.skipped(),
            cancelled: self.cancelled(),
            validation_failures: self.validation_failures(),
            recent_errors: self.errors(),
        }
    }

    pub fn summary(&self) -> String {
        let snap = self.snapshot();
        let mut line = format!(
            "total={} successful={} failed={} success_rate={:.1}% duplicates={} skipped={} normalized={}",
            snap.total,
            snap.successful,
            snap.failed,
            snap.success_rate * 100.0,
            snap.duplicates,
            snap.skipped,
            snap.normalized,
        );
        if !snap.validation_failures.is_empty() {
            let buckets = snap
                .validation_failures
                .iter()
                .map(|(category, count)| format!("{category}:{count}"))
                .collect::<Vec<_>>()
                .join(",");
            line.push_str(&format!(" validation_failures=[{buckets}]"));
        }
        line
    }

    pub fn export_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Lets exactly one caller per interval through, without holding a lock.
#[derive(Debug)]
pub struct ReportGate {
    interval_ms: u64,
    last_ms: AtomicU64,
}

impl ReportGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_ms: AtomicU64::new(0),
        }
    }

    /// `now_ms` is measured from an origin the caller keeps fixed.
    pub fn try_claim(&self, now_ms: u64) -> bool {
        let last = self.last_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(last) < self.interval_ms {
            return false;
        }
        self.last_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Logs throughput at most once per interval, however many workers report.
#[derive(Debug)]
pub struct ProgressReporter {
    dataset: String,
    started: Instant,
    gate: ReportGate,
    processed: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    reports: AtomicU64,
}

impl ProgressReporter {
    pub fn new(dataset: impl Into<String>, interval: Duration) -> Self {
        Self {
            dataset: dataset.into(),
            started: Instant::now(),
            gate: ReportGate::new(interval),
            processed: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            reports: AtomicU64::new(0),
        }
    }

    pub fn increment_success(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.successful.fetch_add(1, Ordering::Relaxed);
        self.maybe_report();
    }

    pub fn increment_failed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.maybe_report();
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// How many progress lines were emitted, final report included.
    pub fn reports_emitted(&self) -> u64 {
        self.reports.load(Ordering::Relaxed)
    }

    pub fn final_report(&self) {
        self.emit(true);
    }

    fn maybe_report(&self) {
        let now_ms = self.started.elapsed().as_millis() as u64;
        if self.gate.try_claim(now_ms) {
            self.emit(false);
        }
    }

    fn emit(&self, last: bool) {
        self.reports.fetch_add(1, Ordering::Relaxed);
        let processed = self.processed();
        let successful = self.successful.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let minutes = self.started.elapsed().as_secs_f64() / 60.0;
        let items_per_minute = if minutes > 0.0 {
            processed as f64 / minutes
        } else {
            0.0
        };
        let success_rate = ratio(successful, processed) * 100.0;
        info!(
            dataset = %self.dataset,
            final_report = last,
            processed,
            successful,
            failed,
            items_per_minute = %format!("{items_per_minute:.1}"),
            success_rate = %format!("{success_rate:.1}%"),
            "extraction progress"
        );
    }
}
