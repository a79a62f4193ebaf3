//! Attempt history: one entry per execution of a task.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// How a single attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
    Cancelled,
}

/// A single execution attempt of a task.
///
/// Callers only ever see the final outcome of a task; the history is what
/// explains how it got there (which attempts failed, how long each ran).
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    /// 0-based attempt number.
    pub attempt: u32,
    pub worker_id: Option<usize>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub outcome: AttemptOutcome,
}

impl AttemptRecord {
    pub fn new(
        attempt: u32,
        worker_id: Option<usize>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        duration: Duration,
        outcome: AttemptOutcome,
    ) -> Self {
        Self {
            attempt,
            worker_id,
            started_at,
            finished_at,
            duration,
            outcome,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_is_tagged() {
        let v = serde_json::to_value(AttemptOutcome::Failed("disk full".into())).unwrap();
        assert_eq!(v["result"], "failed");
        assert_eq!(v["detail"], "disk full");

        let v = serde_json::to_value(AttemptOutcome::TimedOut).unwrap();
        assert_eq!(v["result"], "timed_out");
    }
}
