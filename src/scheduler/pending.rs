//! Ordered pending set.
//!
//! Holds every queued [`TaskRecord`] in a min-heap keyed on `(fire_at, seq)` behind a single
//! mutex. Producers insert from any thread; the execution loop peeks and pops. Callers only
//! ever receive owned records or metadata copies, never references into the heap.

// Import mutex for the single exclusion boundary
use parking_lot::Mutex;
// Import BinaryHeap for min-heap on deadline
use std::collections::BinaryHeap;
// Import time types for deadlines
use std::time::Instant;

use super::task::{TaskId, TaskRecord};

/// Metadata copy of the earliest pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: TaskId,
    pub fire_at: Instant,
    pub repeating: bool,
}

impl From<&TaskRecord> for PendingEntry {
    fn from(record: &TaskRecord) -> Self {
        Self {
            id: record.id(),
            fire_at: record.fire_at(),
            repeating: record.is_repeating(),
        }
    }
}

struct Inner {
    heap: BinaryHeap<TaskRecord>,
    /// Next insertion sequence number (tie-breaker for equal deadlines)
    next_seq: u64,
}

/// Priority-ordered collection of task records, earliest deadline first.
pub struct PendingSet {
    inner: Mutex<Inner>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Insert a record, returning true when it became the new earliest entry.
    ///
    /// "New earliest" means the set was empty or the record is strictly earlier than the
    /// previous head; an equal deadline does not require a re-arm.
    pub fn insert(&self, mut task: TaskRecord) -> bool {
        let mut guard = self.inner.lock();
        let became_earliest = match guard.heap.peek() {
            None => true,
            Some(head) => task.fire_at() < head.fire_at(),
        };
        let seq = guard.next_seq;
        guard.next_seq += 1;
        task.set_seq(seq);
        guard.heap.push(task);
        became_earliest
    }

    /// Non-destructive look at the earliest entry.
    pub fn peek_earliest(&self) -> Option<PendingEntry> {
        self.inner.lock().heap.peek().map(PendingEntry::from)
    }

    /// Remove and return the earliest entry.
    pub fn pop_earliest(&self) -> Option<TaskRecord> {
        self.inner.lock().heap.pop()
    }

    /// Remove every entry due at `now` (`fire_at <= now`), in ascending deadline order.
    pub fn pop_due(&self, now: Instant) -> Vec<TaskRecord> {
        let mut guard = self.inner.lock();
        let mut due = Vec::new();
        while guard.heap.peek().is_some_and(|head| head.fire_at() <= now) {
            if let Some(task) = guard.heap.pop() {
                due.push(task);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    /// Drop every pending entry and return how many were discarded.
    pub fn clear(&self) -> usize {
        // Take the heap out first so actions are dropped outside the lock
        let drained = {
            let mut guard = self.inner.lock();
            std::mem::take(&mut guard.heap)
        };
        drained.len()
    }
}

impl Default for PendingSet {
    fn default() -> Self {
        Self::new()
    }
}
