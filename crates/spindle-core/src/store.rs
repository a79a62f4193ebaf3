//! Result store: task id -> record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::domain::{TaskId, TaskRecord};

/// Read-mostly map of every task the engine knows about.
///
/// Entries are created at submission and only leave through `remove`
/// (acknowledgment) or `sweep_expired` (retention TTL).
#[derive(Default)]
pub struct ResultStore {
    entries: RwLock<HashMap<TaskId, Arc<TaskRecord>>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: Arc<TaskRecord>) {
        self.entries.write().insert(record.id(), record);
    }

    pub fn get(&self, id: TaskId) -> Option<Arc<TaskRecord>> {
        self.entries.read().get(&id).cloned()
    }

    pub fn remove(&self, id: TaskId) -> Option<Arc<TaskRecord>> {
        self.entries.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop terminal entries completed more than `ttl` before `now`.
    /// Returns how many were dropped.
    pub fn sweep_expired(&self, ttl: Duration, now: DateTime<Utc>) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let cutoff = now - ttl;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, record| record.completed_at().is_none_or(|at| at > cutoff));
        before - entries.len()
    }
}
