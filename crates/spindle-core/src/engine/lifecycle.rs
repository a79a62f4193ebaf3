//! Graceful shutdown and the maintenance loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{Lifecycle, Shared};

const JOIN_GRACE: Duration = Duration::from_millis(50);

/// How `Engine::shutdown` treats outstanding work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOptions {
    /// Let queued and running tasks finish (up to `timeout`).
    pub wait_for_completion: bool,
    /// Overall budget for waiting on tasks and workers.
    pub timeout: Duration,
    /// Cancel every queued task up front instead of running it.
    pub cancel_pending: bool,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            wait_for_completion: true,
            timeout: Duration::from_secs(30),
            cancel_pending: false,
        }
    }
}

impl ShutdownOptions {
    /// Cancel queued work and stop as soon as running tasks return.
    pub fn immediate() -> Self {
        Self {
            wait_for_completion: false,
            cancel_pending: true,
            ..Self::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// What happened during shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Queued tasks cancelled because `cancel_pending` was set.
    pub cancelled_pending: usize,
    /// Tasks still queued when the wait ended, cancelled rather than dropped.
    pub cancelled_after_deadline: usize,
    /// Queue and workers went idle before the deadline.
    pub drained_in_time: bool,
    /// Workers still running a task when the deadline hit (left detached).
    pub stragglers: usize,
    pub elapsed: Duration,
    /// Shutdown had already been requested; nothing was done.
    pub already_stopped: bool,
}

pub(super) async fn shutdown(shared: &Arc<Shared>, options: ShutdownOptions) -> ShutdownReport {
    let was_running = {
        let mut lifecycle = shared.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Stopping | Lifecycle::Stopped => {
                return ShutdownReport {
                    already_stopped: true,
                    ..ShutdownReport::default()
                };
            }
            Lifecycle::Running => {
                *lifecycle = Lifecycle::Stopping;
                true
            }
            Lifecycle::Created => {
                *lifecycle = Lifecycle::Stopping;
                false
            }
        }
    };

    let started = Instant::now();
    let deadline = started + options.timeout;
    info!(
        target: "spindle::engine",
        wait_for_completion = options.wait_for_completion,
        cancel_pending = options.cancel_pending,
        timeout_ms = options.timeout.as_millis() as u64,
        queued = shared.queue.queued(),
        "engine shutting down"
    );

    shared.closing.cancel();
    shared.queue.wake_blocked_submitters();

    let mut report = ShutdownReport::default();
    if options.cancel_pending {
        report.cancelled_pending = shared.cancel_queued();
    }

    if options.wait_for_completion && was_running {
        if shared.queue.is_paused() {
            shared.queue.resume();
        }
        report.drained_in_time = wait_idle(shared, deadline).await;
    } else {
        report.drained_in_time = shared.queue.is_empty();
    }

    // nothing is silently dropped: leftovers end as Cancelled
    report.cancelled_after_deadline = shared.cancel_queued();
    shared.queue.close();
    shared.shutdown.cancel();
    shared.pool.drain_all();

    // idle workers need a scheduler turn to observe the drain
    let remaining = deadline
        .saturating_duration_since(Instant::now())
        .max(JOIN_GRACE);
    report.stragglers = shared.pool.join(remaining).await;
    // retries scheduled by tasks that were still in flight above
    report.cancelled_after_deadline += shared.cancel_queued();

    let background = std::mem::take(&mut *shared.background.lock());
    for loop_task in background {
        if let Err(e) = loop_task.await {
            warn!(target: "spindle::engine", error = %e, "background loop ended abnormally");
        }
    }

    *shared.lifecycle.lock() = Lifecycle::Stopped;
    report.elapsed = started.elapsed();
    info!(
        target: "spindle::engine",
        cancelled_pending = report.cancelled_pending,
        cancelled_after_deadline = report.cancelled_after_deadline,
        drained_in_time = report.drained_in_time,
        stragglers = report.stragglers,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "engine stopped"
    );
    report
}

/// Poll until the queue is empty and no worker is busy, or `deadline`.
/// Idle must be observed twice in a row: a worker that just dequeued a task
/// is not yet marked busy.
async fn wait_idle(shared: &Shared, deadline: Instant) -> bool {
    const POLL: Duration = Duration::from_millis(10);
    let mut idle_rounds = 0;
    loop {
        if shared.queue.is_empty() && shared.pool.counts().busy == 0 {
            idle_rounds += 1;
            if idle_rounds >= 2 {
                return true;
            }
        } else {
            idle_rounds = 0;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(POLL.min(deadline - now)).await;
    }
}

/// Promotes due delayed tasks and applies the result retention TTL.
pub(super) async fn run_maintenance(shared: Arc<Shared>) {
    let mut tick = tokio::time::interval(shared.config.sweep_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }

        let promoted = shared.queue.promote_due(Instant::now());
        if promoted > 0 {
            debug!(target: "spindle::engine", promoted, "promoted delayed tasks");
        }
        shared.queue.nudge();

        if let Some(ttl) = shared.config.result_ttl {
            let dropped = shared.store.sweep_expired(ttl, shared.clock.now());
            if dropped > 0 {
                debug!(target: "spindle::engine", dropped, "expired results dropped");
            }
        }
    }
}
