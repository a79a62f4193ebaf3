//! Task record: immutable task definition + mutable execution status.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{AttemptRecord, Priority, TaskId, TaskState};
use crate::error::TaskError;
use crate::payload::{Payload, PayloadKind, TaskContext};

/// Final result of a task.
pub type TaskOutcome = Result<Value, TaskError>;

/// Completion callback. Runs exactly once, on whichever thread finalizes the task.
pub type Callback = Box<dyn FnOnce(&TaskOutcome) + Send + 'static>;

/// Everything needed to create a record.
pub(crate) struct NewTask {
    pub id: TaskId,
    pub payload: Option<Payload>,
    pub kind: PayloadKind,
    pub priority: Priority,
    pub args: Value,
    pub max_retries: u32,
    pub timeout: Option<Duration>,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
    pub retry_of: Option<TaskId>,
    pub scheduled_at: Instant,
    pub created_at: DateTime<Utc>,
}

/// Mutable part of a record. Only touched under `TaskRecord::status`.
struct TaskStatus {
    state: TaskState,
    attempt: u32,
    scheduled_at: Instant,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    outcome: Option<TaskOutcome>,
    last_error: Option<TaskError>,
    history: Vec<AttemptRecord>,
    callbacks: Vec<Callback>,
}

/// Result of `TaskRecord::request_cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelRequest {
    /// Was pending; now `Cancelled`. The caller must drop it from the queue.
    Removed,
    /// Already running; the cooperative flag was raised.
    Signalled,
    /// Already terminal; nothing changed.
    Terminal,
}

/// A task as the engine tracks it.
///
/// Design:
/// - The definition (payload, priority, policy) never changes after creation.
/// - All state transitions go through methods that hold the status lock, so
///   readers always see a consistent state/outcome pair.
/// - Queue lanes and the result store share the same `Arc<TaskRecord>`.
pub struct TaskRecord {
    id: TaskId,
    priority: Priority,
    payload: Option<Payload>,
    kind: PayloadKind,
    args: Value,
    max_retries: u32,
    timeout: Option<Duration>,
    tags: Arc<[String]>,
    metadata: Arc<Map<String, Value>>,
    retry_of: Option<TaskId>,
    cancel: CancellationToken,
    status: Mutex<TaskStatus>,
    terminal: Condvar,
    state_tx: watch::Sender<TaskState>,
}

impl TaskRecord {
    pub(crate) fn new(task: NewTask) -> Self {
        let (state_tx, _) = watch::channel(TaskState::Pending);
        Self {
            id: task.id,
            priority: task.priority,
            payload: task.payload,
            kind: task.kind,
            args: task.args,
            max_retries: task.max_retries,
            timeout: task.timeout,
            tags: Arc::from(task.tags),
            metadata: Arc::new(task.metadata),
            retry_of: task.retry_of,
            cancel: CancellationToken::new(),
            status: Mutex::new(TaskStatus {
                state: TaskState::Pending,
                attempt: 0,
                scheduled_at: task.scheduled_at,
                created_at: task.created_at,
                started_at: None,
                completed_at: None,
                outcome: None,
                last_error: None,
                history: Vec::new(),
                callbacks: Vec::new(),
            }),
            terminal: Condvar::new(),
            state_tx,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    pub(crate) fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn retry_of(&self) -> Option<TaskId> {
        self.retry_of
    }

    pub fn state(&self) -> TaskState {
        self.status.lock().state
    }

    pub fn attempt(&self) -> u32 {
        self.status.lock().attempt
    }

    pub fn scheduled_at(&self) -> Instant {
        self.status.lock().scheduled_at
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.status.lock().outcome.clone()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.status.lock().completed_at
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.state_tx.subscribe()
    }

    /// Context handed to the payload for one attempt. Each attempt gets its own
    /// child token so a deadline trips only that attempt.
    pub(crate) fn context(&self, attempt: u32) -> (TaskContext, CancellationToken) {
        let token = self.cancel.child_token();
        let ctx = TaskContext::new(
            self.id,
            self.priority,
            attempt,
            self.args.clone(),
            Arc::clone(&self.tags),
            Arc::clone(&self.metadata),
            token.clone(),
        );
        (ctx, token)
    }

    /// Pending -> Running. Returns the attempt number, or `None` if the task is
    /// no longer pending (cancelled while it sat in the queue).
    pub(crate) fn try_start(&self, now: DateTime<Utc>) -> Option<u32> {
        let mut st = self.status.lock();
        if st.state != TaskState::Pending {
            return None;
        }
        self.transition(&mut st, TaskState::Running);
        st.started_at = Some(now);
        Some(st.attempt)
    }

    /// Running -> Retrying -> Pending with `attempt += 1`. Returns the new
    /// `scheduled_at`.
    pub(crate) fn schedule_retry(
        &self,
        error: TaskError,
        attempt: AttemptRecord,
        delay: Duration,
    ) -> Instant {
        let mut st = self.status.lock();
        self.transition(&mut st, TaskState::Retrying);
        assert!(
            st.attempt < self.max_retries,
            "internal invariant violated: {} retried past max_retries={}",
            self.id,
            self.max_retries
        );
        st.history.push(attempt);
        st.last_error = Some(error);
        st.attempt += 1;
        st.scheduled_at = Instant::now() + delay;
        self.transition(&mut st, TaskState::Pending);
        st.scheduled_at
    }

    /// Move to a terminal state and fire callbacks (outside the lock).
    pub(crate) fn finish(
        &self,
        next: TaskState,
        outcome: TaskOutcome,
        attempt: Option<AttemptRecord>,
        now: DateTime<Utc>,
    ) {
        debug_assert!(next.is_terminal());
        let callbacks = {
            let mut st = self.status.lock();
            self.transition(&mut st, next);
            if let Some(attempt) = attempt {
                st.history.push(attempt);
            }
            if let Err(e) = &outcome {
                st.last_error = Some(e.clone());
            }
            st.completed_at = Some(now);
            st.outcome = Some(outcome.clone());
            std::mem::take(&mut st.callbacks)
        };
        self.terminal.notify_all();
        self.state_tx.send_replace(next);
        for cb in callbacks {
            run_callback(self.id, cb, &outcome);
        }
    }

    /// Cancel if still pending; otherwise raise the cooperative flag.
    pub(crate) fn request_cancel(&self, error: TaskError, now: DateTime<Utc>) -> CancelRequest {
        let state = self.state();
        match state {
            TaskState::Pending => {
                let callbacks = {
                    let mut st = self.status.lock();
                    // re-check: a worker may have started it in between
                    if st.state != TaskState::Pending {
                        drop(st);
                        return self.request_cancel(error, now);
                    }
                    self.transition(&mut st, TaskState::Cancelled);
                    st.completed_at = Some(now);
                    st.last_error = Some(error.clone());
                    st.outcome = Some(Err(error.clone()));
                    std::mem::take(&mut st.callbacks)
                };
                self.cancel.cancel();
                self.terminal.notify_all();
                self.state_tx.send_replace(TaskState::Cancelled);
                let outcome: TaskOutcome = Err(error);
                for cb in callbacks {
                    run_callback(self.id, cb, &outcome);
                }
                CancelRequest::Removed
            }
            TaskState::Running | TaskState::Retrying => {
                self.cancel.cancel();
                CancelRequest::Signalled
            }
            _ => CancelRequest::Terminal,
        }
    }

    /// Register a completion callback; runs immediately if already terminal.
    pub fn add_callback(&self, cb: Callback) {
        let outcome = {
            let mut st = self.status.lock();
            match st.outcome.clone() {
                Some(outcome) => outcome,
                None => {
                    st.callbacks.push(cb);
                    return;
                }
            }
        };
        run_callback(self.id, cb, &outcome);
    }

    /// Block the current thread until terminal or `timeout` elapses.
    pub(crate) fn wait_blocking(&self, timeout: Option<Duration>) -> Option<TaskOutcome> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.status.lock();
        loop {
            if let Some(outcome) = &st.outcome {
                return Some(outcome.clone());
            }
            match deadline {
                Some(deadline) => {
                    if self.terminal.wait_until(&mut st, deadline).timed_out() {
                        return st.outcome.clone();
                    }
                }
                None => self.terminal.wait(&mut st),
            }
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let st = self.status.lock();
        TaskSnapshot {
            id: self.id,
            priority: self.priority,
            kind: self.kind,
            state: st.state,
            attempt: st.attempt,
            max_retries: self.max_retries,
            timeout: self.timeout,
            tags: self.tags.to_vec(),
            metadata: (*self.metadata).clone(),
            retry_of: self.retry_of,
            created_at: st.created_at,
            started_at: st.started_at,
            completed_at: st.completed_at,
            last_error: st.last_error.clone(),
            history: st.history.clone(),
        }
    }

    fn transition(&self, st: &mut TaskStatus, next: TaskState) {
        // An illegal edge means queue/worker bookkeeping is corrupt. Abort loudly.
        assert!(
            st.state.can_transition_to(next),
            "internal invariant violated: illegal transition {} -> {} for {}",
            st.state,
            next,
            self.id
        );
        st.state = next;
    }
}

impl std::fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRecord")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn run_callback(id: TaskId, cb: Callback, outcome: &TaskOutcome) {
    if catch_unwind(AssertUnwindSafe(|| cb(outcome))).is_err() {
        tracing::error!(task_id = %id, "completion callback panicked");
    }
}

/// Read-only view of a task, safe to serialize.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub priority: Priority,
    pub kind: PayloadKind,
    pub state: TaskState,
    pub attempt: u32,
    pub max_retries: u32,
    pub timeout: Option<Duration>,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
    pub retry_of: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<TaskError>,
    pub history: Vec<AttemptRecord>,
}
