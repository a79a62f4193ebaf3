//! Priority queue: four bounded FIFO lanes plus a delay buffer.

mod delay;
mod lane;
mod retry;

pub use retry::RetryPolicy;

use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

use crate::config::LaneCapacities;
use crate::domain::{Priority, TaskRecord, TaskState};
use crate::error::SubmissionError;

use self::delay::DelayBuffer;
use self::lane::Lane;

/// Depth of one lane at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LaneDepth {
    pub priority: Priority,
    /// Ready to run now.
    pub ready: usize,
    /// Parked in the delay buffer.
    pub delayed: usize,
    pub capacity: usize,
}

/// Thread-safe admission and retrieval of ready tasks in priority order.
///
/// Design:
/// - A task lives in exactly one place: its lane, the delay buffer, or neither
///   (running/terminal).
/// - Workers always take from the highest-priority non-empty lane; equal
///   priorities never reorder.
/// - Delayed tasks are promoted on every dequeue attempt and by the engine's
///   sweep loop.
pub struct PriorityQueue {
    lanes: [Lane; 4],
    delayed: DelayBuffer,
    /// Woken when a task becomes ready (or the queue is resumed/closed).
    ready: Notify,
    /// Woken when lane capacity is released.
    space: Notify,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl PriorityQueue {
    pub fn new(capacities: &LaneCapacities) -> Self {
        Self {
            lanes: Priority::ALL.map(|p| Lane::new(p, capacities.get(p))),
            delayed: DelayBuffer::default(),
            ready: Notify::new(),
            space: Notify::new(),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn lane(&self, priority: Priority) -> &Lane {
        &self.lanes[priority.index()]
    }

    /// Admit a task, failing with `QueueFull` when its lane is at capacity.
    pub fn enqueue(&self, record: Arc<TaskRecord>) -> Result<(), SubmissionError> {
        let lane = self.lane(record.priority());
        if !lane.try_reserve() {
            return Err(SubmissionError::QueueFull {
                priority: lane.priority(),
                capacity: lane.capacity(),
            });
        }
        self.place(record);
        Ok(())
    }

    /// Admit a task without the capacity check. Used for retries and chain
    /// dependents, which were admitted once already.
    pub(crate) fn enqueue_forced(&self, record: Arc<TaskRecord>) {
        self.lane(record.priority()).force_reserve();
        self.place(record);
    }

    fn place(&self, record: Arc<TaskRecord>) {
        let due = record.scheduled_at();
        if due > Instant::now() {
            self.delayed.push(due, record);
        } else {
            self.lane(record.priority()).push(record);
        }
        self.ready.notify_one();
    }

    /// Oldest pending task from the highest-priority non-empty lane, without
    /// waiting. `None` while paused or closed.
    pub fn try_dequeue(&self) -> Option<Arc<TaskRecord>> {
        if self.closed.load(Ordering::Acquire) || self.paused.load(Ordering::Acquire) {
            return None;
        }
        self.promote_due(Instant::now());
        for lane in &self.lanes {
            while let Some(record) = lane.pop() {
                self.space.notify_waiters();
                // cancelled while queued: the slot is released, skip it
                if record.state() == TaskState::Pending {
                    return Some(record);
                }
            }
        }
        None
    }

    /// Like `try_dequeue`, but waits up to `timeout` (forever if `None`) for a
    /// task. Returns `None` on timeout, while paused, or once closed.
    pub async fn dequeue(&self, timeout: Option<Duration>) -> Option<Arc<TaskRecord>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.is_closed() {
                return None;
            }
            let mut notified = pin!(self.ready.notified());
            notified.as_mut().enable();

            if let Some(record) = self.try_dequeue() {
                return Some(record);
            }

            let now = Instant::now();
            if deadline.is_some_and(|d| d <= now) {
                return None;
            }
            let next_due = if self.is_paused() {
                None
            } else {
                self.delayed.next_due()
            };
            let wake = match (next_due, deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            match wake {
                Some(wake) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(wake.into()) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Move due delayed tasks into their lanes. Returns how many moved.
    pub fn promote_due(&self, now: Instant) -> usize {
        let due = self.delayed.pop_due(now);
        let moved = due.len();
        for record in due {
            self.lane(record.priority()).push(record);
        }
        if moved > 0 {
            self.ready.notify_waiters();
        }
        moved
    }

    /// Remove a pending task from its lane or the delay buffer.
    pub fn remove(&self, record: &TaskRecord) -> bool {
        let lane = self.lane(record.priority());
        let removed = if self.delayed.remove(record) {
            lane.release();
            true
        } else {
            lane.remove(record)
        };
        if removed {
            self.space.notify_waiters();
        }
        removed
    }

    /// Remove every queued task (ready and delayed).
    pub fn drain(&self) -> Vec<Arc<TaskRecord>> {
        let mut drained = Vec::new();
        for record in self.delayed.drain() {
            self.lane(record.priority()).release();
            drained.push(record);
        }
        for lane in &self.lanes {
            drained.extend(lane.drain());
        }
        self.space.notify_waiters();
        drained
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.ready.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Stop handing out tasks for good and wake every waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_waiters();
        self.space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wake one idle worker if anything is ready.
    pub(crate) fn nudge(&self) {
        if self.lanes.iter().any(|l| l.ready_len() > 0) {
            self.ready.notify_one();
        }
    }

    /// Future resolving when capacity is released somewhere.
    pub(crate) fn space_available(&self) -> Notified<'_> {
        self.space.notified()
    }

    pub(crate) fn wake_blocked_submitters(&self) {
        self.space.notify_waiters();
    }

    pub fn depths(&self) -> [LaneDepth; 4] {
        let delayed = self.delayed.counts_by_lane();
        Priority::ALL.map(|p| {
            let lane = self.lane(p);
            LaneDepth {
                priority: p,
                ready: lane.ready_len(),
                delayed: delayed[p.index()],
                capacity: lane.capacity(),
            }
        })
    }

    /// Tasks admitted and not yet dequeued, across all lanes.
    pub fn queued(&self) -> usize {
        self.lanes.iter().map(Lane::reserved).sum()
    }

    pub fn total_capacity(&self) -> usize {
        self.lanes.iter().map(Lane::capacity).sum()
    }

    /// `queued / total_capacity`. May exceed 1.0 when forced admissions pile up.
    pub fn pressure(&self) -> f64 {
        let capacity = self.total_capacity();
        if capacity == 0 {
            return 0.0;
        }
        self.queued() as f64 / capacity as f64
    }

    /// Like `pressure`, but counting only tasks a worker could take now.
    /// Delayed tasks and retry backoffs hold a reservation without being ready.
    pub fn ready_pressure(&self) -> f64 {
        let capacity = self.total_capacity();
        if capacity == 0 {
            return 0.0;
        }
        let ready: usize = self.lanes.iter().map(Lane::ready_len).sum();
        ready as f64 / capacity as f64
    }

    pub fn is_empty(&self) -> bool {
        self.queued() == 0
    }
}
