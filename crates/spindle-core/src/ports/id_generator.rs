//! IdGenerator port: task and chain ids.

use crate::domain::{ChainId, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

/// Generates ids. Must be usable from every worker concurrently.
pub trait IdGenerator: Send + Sync {
    fn task_id(&self) -> TaskId;

    fn chain_id(&self) -> ChainId;
}

/// ULID-based generator. The timestamp half comes from the injected clock, so a
/// `FixedClock` yields ids with a deterministic time component.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn chain_id(&self) -> ChainId {
        ChainId::from(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;

    #[test]
    fn generates_unique_ids() {
        let ids = UlidGenerator::new(SystemClock);
        let set: HashSet<TaskId> = (0..1_000).map(|_| ids.task_id()).collect();
        assert_eq!(set.len(), 1_000);
    }

    #[test]
    fn fixed_clock_pins_timestamp_component() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let ids = UlidGenerator::new(FixedClock::new(at));

        let a = ids.task_id();
        let b = ids.task_id();
        assert_ne!(a, b);
        assert_eq!(a.as_ulid().timestamp_ms(), at.timestamp_millis() as u64);
        assert_eq!(b.as_ulid().timestamp_ms(), at.timestamp_millis() as u64);
    }

    #[test]
    fn chain_ids_have_their_own_prefix() {
        let ids = UlidGenerator::new(SystemClock);
        assert!(ids.chain_id().to_string().starts_with("chain-"));
        assert!(ids.task_id().to_string().starts_with("task-"));
    }
}
