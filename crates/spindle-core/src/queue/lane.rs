//! One priority lane: bounded FIFO of ready tasks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::domain::{Priority, TaskRecord};

/// A bounded FIFO lane.
///
/// Design:
/// - `reserved` counts every task admitted to this lane that has not been
///   dequeued yet, including tasks parked in the delay buffer. Admission
///   reserves a slot with a CAS loop, so a full lane is rejected without
///   touching the FIFO lock.
/// - The FIFO itself is guarded by a lane-local lock held only for a single
///   push/pop/remove.
pub(crate) struct Lane {
    priority: Priority,
    capacity: usize,
    reserved: AtomicUsize,
    ready: Mutex<VecDeque<Arc<TaskRecord>>>,
}

impl Lane {
    pub(crate) fn new(priority: Priority, capacity: usize) -> Self {
        Self {
            priority,
            capacity,
            reserved: AtomicUsize::new(0),
            ready: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admitted and not yet dequeued (ready + delayed).
    pub(crate) fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready.lock().len()
    }

    /// Claim one slot if below capacity.
    pub(crate) fn try_reserve(&self) -> bool {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    /// Claim one slot regardless of capacity (retries, chain dependents).
    pub(crate) fn force_reserve(&self) {
        self.reserved.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        let prev = self.reserved.fetch_sub(1, Ordering::AcqRel);
        assert!(
            prev > 0,
            "internal invariant violated: lane `{}` released more slots than it reserved",
            self.priority
        );
    }

    /// Append a task that already holds a reservation.
    pub(crate) fn push(&self, record: Arc<TaskRecord>) {
        self.ready.lock().push_back(record);
    }

    /// Oldest task, releasing its slot.
    pub(crate) fn pop(&self) -> Option<Arc<TaskRecord>> {
        let popped = self.ready.lock().pop_front();
        if popped.is_some() {
            self.release();
        }
        popped
    }

    /// Remove a specific task (cancellation). Releases its slot when found.
    pub(crate) fn remove(&self, record: &TaskRecord) -> bool {
        let removed = {
            let mut ready = self.ready.lock();
            match ready.iter().position(|r| r.id() == record.id()) {
                Some(idx) => ready.remove(idx).is_some(),
                None => false,
            }
        };
        if removed {
            self.release();
        }
        removed
    }

    /// Take every ready task, releasing their slots.
    pub(crate) fn drain(&self) -> Vec<Arc<TaskRecord>> {
        let drained: Vec<_> = self.ready.lock().drain(..).collect();
        for _ in &drained {
            self.release();
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::tests::record;

    #[test]
    fn reserve_respects_capacity() {
        let lane = Lane::new(Priority::Normal, 2);
        assert!(lane.try_reserve());
        assert!(lane.try_reserve());
        assert!(!lane.try_reserve());
        lane.force_reserve();
        assert_eq!(lane.reserved(), 3);
    }

    #[test]
    fn fifo_order_and_release_on_pop() {
        let lane = Lane::new(Priority::Low, 8);
        let ids: Vec<_> = (0..3)
            .map(|_| {
                let r = Arc::new(record(Priority::Low, 0));
                assert!(lane.try_reserve());
                let id = r.id();
                lane.push(r);
                id
            })
            .collect();

        let popped: Vec<_> = std::iter::from_fn(|| lane.pop()).map(|r| r.id()).collect();
        assert_eq!(popped, ids);
        assert_eq!(lane.reserved(), 0);
    }

    #[test]
    fn remove_releases_slot() {
        let lane = Lane::new(Priority::High, 1);
        let r = Arc::new(record(Priority::High, 0));
        assert!(lane.try_reserve());
        lane.push(Arc::clone(&r));
        assert!(!lane.try_reserve());

        assert!(lane.remove(&r));
        assert!(!lane.remove(&r));
        assert!(lane.try_reserve());
    }
}
