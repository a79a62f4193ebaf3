//! Caller-side handle to a submitted task.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::domain::{Priority, TaskId, TaskOutcome, TaskRecord, TaskSnapshot, TaskState};
use crate::engine::Shared;
use crate::error::{HandleError, TaskError, WaitError};

/// Future-like view of one task.
///
/// Cheap to clone; every clone observes the same record.
#[derive(Clone)]
pub struct TaskHandle {
    record: Arc<TaskRecord>,
    shared: Arc<Shared>,
}

impl TaskHandle {
    pub(crate) fn new(record: Arc<TaskRecord>, shared: Arc<Shared>) -> Self {
        Self { record, shared }
    }

    pub(crate) fn record(&self) -> &Arc<TaskRecord> {
        &self.record
    }

    pub fn id(&self) -> TaskId {
        self.record.id()
    }

    pub fn priority(&self) -> Priority {
        self.record.priority()
    }

    /// Wait until the task is terminal.
    ///
    /// `WaitError::Timeout` means only that this wait gave up; the task keeps
    /// going. A task that itself timed out comes back as
    /// `WaitError::Task(TaskError::Timeout { .. })`.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Value, WaitError> {
        let mut rx = self.record.subscribe();
        let terminal = async {
            // sender lives in the record we hold, so this cannot close early
            let _ = rx.wait_for(|state| state.is_terminal()).await;
            self.record.outcome()
        };
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, terminal)
                .await
                .map_err(|_| WaitError::Timeout(limit))?,
            None => terminal.await,
        };
        match outcome {
            Some(outcome) => outcome.map_err(WaitError::from),
            None => Err(WaitError::Timeout(timeout.unwrap_or_default())),
        }
    }

    /// Blocking variant of `wait` for synchronous callers. Do not call it from
    /// inside an async task.
    pub fn wait_blocking(&self, timeout: Option<Duration>) -> Result<Value, WaitError> {
        match self.record.wait_blocking(timeout) {
            Some(outcome) => outcome.map_err(WaitError::from),
            None => Err(WaitError::Timeout(timeout.unwrap_or_default())),
        }
    }

    pub fn state(&self) -> TaskState {
        self.record.state()
    }

    /// 0-based attempt counter.
    pub fn attempt(&self) -> u32 {
        self.record.attempt()
    }

    pub fn is_complete(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_successful(&self) -> bool {
        self.state() == TaskState::Succeeded
    }

    pub fn is_failed(&self) -> bool {
        self.state().is_failure()
    }

    pub fn get_result(&self) -> Option<Value> {
        self.record.outcome().and_then(Result::ok)
    }

    pub fn get_error(&self) -> Option<TaskError> {
        self.record.outcome().and_then(Result::err)
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.record.outcome()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.record.snapshot()
    }

    /// Run `f` exactly once when the task is terminal. Runs right away, on
    /// this thread, if it already is.
    pub fn add_callback<F>(&self, f: F)
    where
        F: FnOnce(&TaskOutcome) + Send + 'static,
    {
        self.record.add_callback(Box::new(f));
    }

    pub fn on_success<F>(&self, f: F)
    where
        F: FnOnce(&Value) + Send + 'static,
    {
        self.add_callback(move |outcome| {
            if let Ok(value) = outcome {
                f(value);
            }
        });
    }

    pub fn on_failure<F>(&self, f: F)
    where
        F: FnOnce(&TaskError) + Send + 'static,
    {
        self.add_callback(move |outcome| {
            if let Err(error) = outcome {
                f(error);
            }
        });
    }

    /// Cancel the task.
    ///
    /// Returns true only if it was still pending and is now `Cancelled`. A
    /// running task gets its cooperative flag raised and false is returned.
    pub fn cancel(&self) -> bool {
        self.shared.cancel(&self.record, TaskError::Cancelled)
    }

    /// Submit a fresh copy of a failed, timed-out, or cancelled task. The new
    /// task has its own id, starts at attempt 0 and links back through
    /// `retry_of`.
    pub fn retry(&self) -> Result<TaskHandle, HandleError> {
        let state = self.state();
        if !state.is_retryable() {
            return Err(HandleError::NotRetryable { state });
        }
        match self.shared.resubmit(&self.record) {
            Some(admitted) => Ok(admitted?),
            None => Err(HandleError::NotRetryable { state }),
        }
    }

    /// Drop the result from the engine's store. Only terminal tasks can be
    /// acknowledged; this handle keeps working afterwards.
    pub fn acknowledge(&self) -> bool {
        if !self.is_complete() {
            return false;
        }
        self.shared.store.remove(self.id()).is_some()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.record.id())
            .field("state", &self.record.state())
            .finish()
    }
}
