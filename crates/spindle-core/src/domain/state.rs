//! Task state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Pending -> Running -> Succeeded
/// - Pending -> Running -> Retrying -> Pending (loop while attempt < max_retries)
/// - Pending -> Running -> Failed | TimedOut (retries exhausted)
/// - Pending -> Cancelled (removed before it ran)
/// - Running -> Cancelled (payload observed the cancellation flag)
///
/// Any other edge is an internal invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Queued in a lane or waiting in the delay buffer.
    Pending,

    /// Owned by a worker.
    Running,

    /// Failed attempt waiting for its backoff to be scheduled.
    Retrying,

    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::TimedOut | TaskState::Cancelled
        )
    }

    /// Terminal and not successful.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            TaskState::Failed | TaskState::TimedOut | TaskState::Cancelled
        )
    }

    /// Can a caller re-submit a task ending in this state?
    pub fn is_retryable(self) -> bool {
        self.is_failure()
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Retrying)
                | (Running, Cancelled)
                | (Retrying, Pending)
                | (Retrying, Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Retrying => "retrying",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::TimedOut => "timed_out",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
