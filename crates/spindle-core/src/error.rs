//! Error taxonomy.
//!
//! - `SubmissionError`: admission failed, nothing was queued.
//! - `TaskError`: terminal error stored on a task (cloned out to every reader).
//! - `WaitError`: what `TaskHandle::wait` returns; keeps wait-level timeouts
//!   apart from task-level timeouts.
//! - `HandleError`, `ChainError`, `ConfigError`, `EngineError`: API misuse and
//!   setup failures.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::domain::{Priority, TaskId, TaskState};
use crate::payload::PayloadError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("queue lane `{priority}` is full (capacity {capacity})")]
    QueueFull { priority: Priority, capacity: usize },

    #[error("engine is shutting down; submissions are closed")]
    EngineShutdown,

    #[error("invalid priority `{0}` (expected critical, high, normal or low)")]
    InvalidPriority(String),
}

/// Coarse classification of a `TaskError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Execution,
    Timeout,
    RetryExhausted,
    Cancelled,
    DependencyFailed,
    ChainFailed,
}

/// Terminal error of a task.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    #[error("task execution failed: {0}")]
    Execution(PayloadError),

    #[error("task exceeded its deadline of {timeout:?} (after {attempts} attempt(s))")]
    Timeout { timeout: Duration, attempts: u32 },

    #[error("task failed after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<TaskError> },

    #[error("task was cancelled")]
    Cancelled,

    #[error("task was cancelled because dependency {dependency} did not succeed")]
    DependencyFailed { dependency: TaskId },

    #[error("chain failed; unsuccessful tasks: {failed:?}")]
    ChainFailed { failed: Vec<TaskId> },
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Execution(_) => ErrorKind::Execution,
            TaskError::Timeout { .. } => ErrorKind::Timeout,
            TaskError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            TaskError::Cancelled => ErrorKind::Cancelled,
            TaskError::DependencyFailed { .. } => ErrorKind::DependencyFailed,
            TaskError::ChainFailed { .. } => ErrorKind::ChainFailed,
        }
    }

    /// The innermost error, looking through `RetryExhausted`.
    pub fn root_cause(&self) -> &TaskError {
        match self {
            TaskError::RetryExhausted { last, .. } => last.root_cause(),
            other => other,
        }
    }

    /// The payload's own error, if the failure came from the payload.
    pub fn payload_error(&self) -> Option<&PayloadError> {
        match self.root_cause() {
            TaskError::Execution(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            TaskError::Cancelled | TaskError::DependencyFailed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WaitError {
    /// The wait itself ran out of time; the task may still complete later.
    #[error("timed out after {0:?} waiting for the task to complete")]
    Timeout(Duration),

    #[error(transparent)]
    Task(#[from] TaskError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HandleError {
    #[error("task in state `{state}` cannot be retried")]
    NotRetryable { state: TaskState },

    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChainError {
    #[error("cyclic dependency detected: {cycle:?}")]
    CyclicDependency { cycle: Vec<TaskId> },

    #[error("task {task} depends on {dependency}, which is not part of the chain")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("chain has no tasks")]
    Empty,

    #[error("chain was already executed")]
    AlreadyExecuted,

    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("min_workers ({min}) must not exceed max_workers ({max})")]
    WorkerBounds { min: usize, max: usize },

    #[error("max_workers must be at least 1")]
    NoWorkers,

    #[error("lane `{0}` must have a capacity of at least 1")]
    ZeroCapacity(Priority),

    #[error("invalid scaler thresholds: down={down} up={up} (need 0 <= down < up <= 1)")]
    Thresholds { down: f64, up: f64 },

    #[error("scale_factor must be greater than 1.0 (got {0})")]
    ScaleFactor(f64),

    #[error("`{0}` must be greater than zero")]
    ZeroInterval(&'static str),

    #[error("environment variable {key}={value:?} is invalid: {reason}")]
    Env {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine was already started")]
    AlreadyStarted,

    #[error("engine was shut down and cannot be restarted")]
    Stopped,

    #[error("engine must be started from within a tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Umbrella error for callers that want a single type.
#[derive(Debug, Error)]
pub enum SpindleError {
    #[error(transparent)]
    Submission(#[from] SubmissionError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}
