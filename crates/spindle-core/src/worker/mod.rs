//! Worker pool.
//!
//! Workers are long-lived tokio tasks that pull from the priority queue.
//! The pool only tracks them; the loop each one runs lives in `dispatch`.

pub(crate) mod dispatch;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Busy = 1,
    /// Finishing its current task (if any), then exits.
    Draining = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Idle,
            1 => WorkerState::Busy,
            2 => WorkerState::Draining,
            _ => WorkerState::Stopped,
        }
    }
}

/// Worker counts at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerCounts {
    /// Idle + busy.
    pub active: usize,
    pub idle: usize,
    pub busy: usize,
    pub draining: usize,
    /// Every worker task still alive (active + draining).
    pub total: usize,
}

impl WorkerCounts {
    /// Busy share of active workers.
    pub fn utilization(&self) -> f64 {
        if self.active == 0 {
            return 0.0;
        }
        self.busy as f64 / self.active as f64
    }
}

/// Per-worker status shared between the pool and the worker task.
pub(crate) struct WorkerStatus {
    id: usize,
    state: AtomicU8,
    drain: CancellationToken,
}

impl WorkerStatus {
    fn new(id: usize) -> Self {
        Self {
            id,
            state: AtomicU8::new(WorkerState::Idle as u8),
            drain: CancellationToken::new(),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn swap_state(&self, from: WorkerState, to: WorkerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Idle -> Busy. A draining worker stays draining.
    pub(crate) fn mark_busy(&self) {
        self.swap_state(WorkerState::Idle, WorkerState::Busy);
    }

    /// Busy -> Idle. A draining worker stays draining.
    pub(crate) fn mark_idle(&self) {
        self.swap_state(WorkerState::Busy, WorkerState::Idle);
    }

    pub(crate) fn mark_stopped(&self) {
        self.state
            .store(WorkerState::Stopped as u8, Ordering::Release);
    }

    /// Ask the worker to stop after its current task. False if it was
    /// already draining or stopped.
    fn begin_drain(&self) -> bool {
        let started = self.swap_state(WorkerState::Idle, WorkerState::Draining)
            || self.swap_state(WorkerState::Busy, WorkerState::Draining);
        if started {
            self.drain.cancel();
        }
        started
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    /// Resolves once the worker was asked to drain.
    pub(crate) fn drained(&self) -> WaitForCancellationFuture<'_> {
        self.drain.cancelled()
    }
}

struct WorkerEntry {
    status: Arc<WorkerStatus>,
    join: JoinHandle<()>,
}

/// The set of live workers.
///
/// Design:
/// - The lock is held only while adding, selecting, or reaping entries.
/// - Retiring never interrupts an in-flight task: the worker sees its drain
///   token between tasks.
pub(crate) struct WorkerPool {
    workers: Mutex<Vec<WorkerEntry>>,
    next_id: AtomicUsize,
}

impl WorkerPool {
    pub(crate) fn new() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Start `n` workers; `spawn` launches the loop for one worker.
    pub(crate) fn spawn_workers<F>(&self, n: usize, spawn: F) -> Vec<usize>
    where
        F: Fn(Arc<WorkerStatus>) -> JoinHandle<()>,
    {
        let mut workers = self.workers.lock();
        reap(&mut workers);
        (0..n)
            .map(|_| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let status = Arc::new(WorkerStatus::new(id));
                let join = spawn(Arc::clone(&status));
                workers.push(WorkerEntry { status, join });
                id
            })
            .collect()
    }

    /// Gracefully retire up to `n` workers, idle ones first. Returns the ids
    /// asked to drain.
    pub(crate) fn retire_workers(&self, n: usize) -> Vec<usize> {
        let mut workers = self.workers.lock();
        reap(&mut workers);
        let mut candidates: Vec<&Arc<WorkerStatus>> = workers
            .iter()
            .map(|w| &w.status)
            .filter(|s| matches!(s.state(), WorkerState::Idle | WorkerState::Busy))
            .collect();
        candidates.sort_by_key(|s| s.state() != WorkerState::Idle);
        candidates
            .into_iter()
            .filter(|s| s.begin_drain())
            .take(n)
            .map(|s| s.id())
            .collect()
    }

    pub(crate) fn counts(&self) -> WorkerCounts {
        let mut workers = self.workers.lock();
        reap(&mut workers);
        let mut counts = WorkerCounts::default();
        for w in workers.iter() {
            match w.status.state() {
                WorkerState::Idle => counts.idle += 1,
                WorkerState::Busy => counts.busy += 1,
                WorkerState::Draining => counts.draining += 1,
                WorkerState::Stopped => continue,
            }
            counts.total += 1;
        }
        counts.active = counts.idle + counts.busy;
        counts
    }

    /// Ask every worker to drain.
    pub(crate) fn drain_all(&self) {
        for w in self.workers.lock().iter() {
            w.status.begin_drain();
        }
    }

    /// Wait up to `timeout` for every worker task to exit. Returns how many
    /// were still running at the deadline (they are detached and exit after
    /// their current task).
    pub(crate) async fn join(&self, timeout: Duration) -> usize {
        let entries = std::mem::take(&mut *self.workers.lock());
        let deadline = Instant::now() + timeout;
        let mut stragglers = 0;
        for mut entry in entries {
            match tokio::time::timeout_at(deadline.into(), &mut entry.join).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(
                        target: "spindle::worker",
                        worker_id = entry.status.id(),
                        error = %e,
                        "worker task ended abnormally"
                    );
                }
                Err(_) => stragglers += 1,
            }
        }
        stragglers
    }
}

fn reap(workers: &mut Vec<WorkerEntry>) {
    workers.retain(|w| w.status.state() != WorkerState::Stopped || !w.join.is_finished());
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A stand-in worker loop: idles until drained.
    fn idle_worker(status: Arc<WorkerStatus>) -> JoinHandle<()> {
        tokio::spawn(async move {
            status.drained().await;
            status.mark_stopped();
        })
    }

    #[tokio::test]
    async fn spawn_and_count() {
        let pool = WorkerPool::new();
        let ids = pool.spawn_workers(3, idle_worker);
        assert_eq!(ids, vec![0, 1, 2]);
        let counts = pool.counts();
        assert_eq!(counts.active, 3);
        assert_eq!(counts.idle, 3);
        assert_eq!(counts.total, 3);
        pool.drain_all();
        assert_eq!(pool.join(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test]
    async fn retire_prefers_idle_workers() {
        let pool = WorkerPool::new();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&statuses);
        pool.spawn_workers(3, move |status| {
            seen.lock().push(Arc::clone(&status));
            idle_worker(status)
        });
        // worker 0 is busy
        statuses.lock()[0].mark_busy();

        let retired = pool.retire_workers(2);
        assert_eq!(retired.len(), 2);
        assert!(!retired.contains(&0));
        assert_eq!(statuses.lock()[0].state(), WorkerState::Busy);

        pool.drain_all();
        assert_eq!(pool.join(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test]
    async fn draining_worker_is_not_marked_idle_again() {
        let pool = WorkerPool::new();
        let slot = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&slot);
        pool.spawn_workers(1, move |status| {
            *seen.lock() = Some(Arc::clone(&status));
            // busy until drained, then stays alive a bit
            tokio::spawn(async move {
                status.drained().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                status.mark_stopped();
            })
        });
        let status = slot.lock().clone().unwrap();
        status.mark_busy();
        assert_eq!(pool.retire_workers(1).len(), 1);
        status.mark_idle();
        assert_eq!(status.state(), WorkerState::Draining);
        assert_eq!(pool.counts().draining, 1);
        assert_eq!(pool.join(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test]
    async fn join_reports_stragglers() {
        let pool = WorkerPool::new();
        pool.spawn_workers(1, |_status| {
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        });
        assert_eq!(pool.join(Duration::from_millis(20)).await, 1);
    }
}
