//! Delay buffer: tasks whose `scheduled_at` is in the future.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::domain::TaskRecord;

/// Heap entry. Reverse ordering so `BinaryHeap` pops the earliest due time;
/// `seq` keeps insertion order among equal due times.
struct Scheduled {
    due: Instant,
    seq: u64,
    record: Arc<TaskRecord>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Heap {
    entries: BinaryHeap<Scheduled>,
    next_seq: u64,
}

/// Min-heap of delayed tasks. Tasks keep their lane reservation while here.
#[derive(Default)]
pub(crate) struct DelayBuffer {
    heap: Mutex<Heap>,
}

impl DelayBuffer {
    pub(crate) fn push(&self, due: Instant, record: Arc<TaskRecord>) {
        let mut heap = self.heap.lock();
        let seq = heap.next_seq;
        heap.next_seq += 1;
        heap.entries.push(Scheduled { due, seq, record });
    }

    /// Pop every entry due at or before `now`, earliest first.
    pub(crate) fn pop_due(&self, now: Instant) -> Vec<Arc<TaskRecord>> {
        let mut heap = self.heap.lock();
        let mut due = Vec::new();
        while heap.entries.peek().is_some_and(|e| e.due <= now) {
            if let Some(entry) = heap.entries.pop() {
                due.push(entry.record);
            }
        }
        due
    }

    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.heap.lock().entries.peek().map(|e| e.due)
    }

    pub(crate) fn remove(&self, record: &TaskRecord) -> bool {
        let mut heap = self.heap.lock();
        let before = heap.entries.len();
        heap.entries.retain(|e| e.record.id() != record.id());
        heap.entries.len() != before
    }

    pub(crate) fn drain(&self) -> Vec<Arc<TaskRecord>> {
        let mut heap = self.heap.lock();
        heap.entries.drain().map(|e| e.record).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.lock().entries.len()
    }

    /// Delayed tasks per lane index.
    pub(crate) fn counts_by_lane(&self) -> [usize; 4] {
        let heap = self.heap.lock();
        let mut counts = [0; 4];
        for e in heap.entries.iter() {
            counts[e.record.priority().index()] += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Priority;
    use crate::domain::record::tests::record;
    use std::time::Duration;

    #[test]
    fn pops_only_due_entries_in_due_order() {
        let buf = DelayBuffer::default();
        let now = Instant::now();
        let late = Arc::new(record(Priority::Low, 0));
        let early = Arc::new(record(Priority::High, 0));
        let future = Arc::new(record(Priority::Normal, 0));

        buf.push(now + Duration::from_millis(5), Arc::clone(&late));
        buf.push(now, Arc::clone(&early));
        buf.push(now + Duration::from_secs(60), Arc::clone(&future));

        let due: Vec<_> = buf
            .pop_due(now + Duration::from_millis(10))
            .iter()
            .map(|r| r.id())
            .collect();
        assert_eq!(due, vec![early.id(), late.id()]);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.next_due(), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn equal_due_times_keep_insertion_order() {
        let buf = DelayBuffer::default();
        let at = Instant::now();
        let ids: Vec<_> = (0..5)
            .map(|_| {
                let r = Arc::new(record(Priority::Normal, 0));
                let id = r.id();
                buf.push(at, r);
                id
            })
            .collect();
        let popped: Vec<_> = buf.pop_due(at).iter().map(|r| r.id()).collect();
        assert_eq!(popped, ids);
    }

    #[test]
    fn remove_and_count() {
        let buf = DelayBuffer::default();
        let r = Arc::new(record(Priority::Critical, 0));
        buf.push(Instant::now() + Duration::from_secs(1), Arc::clone(&r));
        assert_eq!(buf.counts_by_lane(), [1, 0, 0, 0]);
        assert!(buf.remove(&r));
        assert!(!buf.remove(&r));
        assert_eq!(buf.len(), 0);
    }
}
