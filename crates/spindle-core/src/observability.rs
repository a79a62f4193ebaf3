//! Engine statistics: cumulative counters plus a sliding window of attempt
//! durations.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::queue::LaneDepth;
use crate::worker::WorkerCounts;

/// Cumulative task counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounters {
    /// Accepted by `submit`/`try_submit` (including `retry()` resubmissions).
    pub submitted: u64,
    /// Rejected at admission.
    pub rejected: u64,
    /// Attempts executed by workers, retries included.
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Attempts that were rescheduled.
    pub retried: u64,
    pub cancelled: u64,
}

/// Attempt duration aggregates over the recent window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimingStats {
    pub samples: usize,
    pub avg_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub running: bool,
    pub paused: bool,
    pub accepting: bool,
    pub lanes: Vec<LaneDepth>,
    pub queued: usize,
    pub capacity: usize,
    pub pressure: f64,
    /// Ready tasks over capacity; what the scaler reacts to.
    pub ready_pressure: f64,
    pub workers: WorkerCounts,
    pub tasks: TaskCounters,
    pub timing: TimingStats,
    /// Entries currently held by the result store.
    pub stored_results: usize,
}

/// Lock-free counters plus a small mutex-guarded duration window.
pub(crate) struct StatsCollector {
    submitted: AtomicU64,
    rejected: AtomicU64,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    window: Mutex<VecDeque<Duration>>,
    window_size: usize,
}

impl StatsCollector {
    pub(crate) fn new(window_size: usize) -> Self {
        Self {
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            window: Mutex::new(VecDeque::with_capacity(window_size.min(4096))),
            window_size: window_size.max(1),
        }
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// One executed attempt and how long it took.
    pub(crate) fn record_attempt(&self, duration: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let mut window = self.window.lock();
        if window.len() == self.window_size {
            window.pop_front();
        }
        window.push_back(duration);
    }

    pub(crate) fn counters(&self) -> TaskCounters {
        TaskCounters {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn timing(&self) -> TimingStats {
        let mut ms: Vec<f64> = self
            .window
            .lock()
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        if ms.is_empty() {
            return TimingStats::default();
        }
        ms.sort_by(f64::total_cmp);
        let sum: f64 = ms.iter().sum();
        TimingStats {
            samples: ms.len(),
            avg_ms: sum / ms.len() as f64,
            p95_ms: percentile(&ms, 0.95),
            p99_ms: percentile(&ms, 0.99),
            max_ms: ms[ms.len() - 1],
        }
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = ((sorted.len() as f64) * p.clamp(0.0, 1.0)).ceil().max(1.0) as usize;
    sorted[rank.min(sorted.len()) - 1]
}
