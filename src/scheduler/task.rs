//! Task records: one deferred action plus its due time and repeat policy.
//!
//! A record is created at submission with an absolute `fire_at` and never edited afterwards.
//! Repeating tasks are re-queued by consuming the old record and producing a fresh one through
//! [`TaskRecord::next_occurrence`].

// Import ordering trait for the heap ordering
use std::cmp::Ordering;
// Import Display for panic and error messages
use std::fmt;
// Import unwind helpers so a panicking action cannot take down the loop
use std::panic::{self, AssertUnwindSafe};
// Import time types for deadlines
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::SchedulerError;

/// Identifier handed back by `submit`.
///
/// A repeating task keeps its identifier across firings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    /// Raw numeric value, mostly useful for logging.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Failure returned by a fallible action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure(String);

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Boxed action stored in a record.
pub type Action = Box<dyn FnMut() -> Result<(), TaskFailure> + Send + 'static>;

/// Immutable description of a unit of deferred work.
pub struct TaskRecord {
    /// Identifier shared by every occurrence of the task
    id: TaskId,
    /// Absolute deadline on the monotonic clock
    fire_at: Instant,
    /// Period used to compute the next deadline of a repeating task
    interval: Duration,
    /// Whether the task is re-queued after it runs
    repeating: bool,
    /// Insertion order, assigned by the pending set to break `fire_at` ties
    seq: u64,
    /// The work itself
    action: Action,
}

impl TaskRecord {
    /// Build a record due `delay` after `now`.
    ///
    /// Fails with `DelayOverflow` when `now + delay` is past the end of the monotonic clock.
    pub fn new(
        id: TaskId,
        now: Instant,
        delay: Duration,
        repeating: bool,
        action: Action,
    ) -> Result<Self, SchedulerError> {
        let fire_at = now
            .checked_add(delay)
            .ok_or(SchedulerError::DelayOverflow(delay))?;
        Ok(Self {
            id,
            fire_at,
            interval: delay,
            repeating,
            seq: 0,
            action,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn fire_at(&self) -> Instant {
        self.fire_at
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_repeating(&self) -> bool {
        self.repeating
    }

    pub(crate) fn set_seq(&mut self, seq: u64) {
        self.seq = seq;
    }

    /// Consume this record and produce the next occurrence, due `interval` after `now`.
    ///
    /// Returns `None` for one-shot tasks, and for repeating tasks whose next deadline would
    /// overflow the monotonic clock.
    pub fn next_occurrence(self, now: Instant) -> Option<Self> {
        if !self.repeating {
            return None;
        }
        let fire_at = now.checked_add(self.interval)?;
        Some(Self {
            id: self.id,
            fire_at,
            interval: self.interval,
            repeating: true,
            seq: 0,
            action: self.action,
        })
    }

    /// Run the action, turning both `Err` returns and panics into `TaskExecution`.
    pub fn execute(&mut self) -> Result<(), SchedulerError> {
        let id = self.id;
        let action = &mut self.action;
        match panic::catch_unwind(AssertUnwindSafe(|| action())) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(failure)) => Err(SchedulerError::TaskExecution {
                task: id,
                message: failure.0,
            }),
            Err(payload) => Err(SchedulerError::TaskExecution {
                task: id,
                message: format!("panicked: {}", panic_message(payload.as_ref())),
            }),
        }
    }
}

impl fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("id", &self.id)
            .field("fire_at", &self.fire_at)
            .field("interval", &self.interval)
            .field("repeating", &self.repeating)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl Ord for TaskRecord {
    /// Reverse order on `(fire_at, seq)` so `BinaryHeap` pops the earliest first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TaskRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TaskRecord {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for TaskRecord {}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    fn noop() -> Action {
        Box::new(|| Ok(()))
    }

    #[test]
    fn fire_at_is_now_plus_delay() {
        let now = Instant::now();
        let record =
            TaskRecord::new(TaskId(1), now, Duration::from_millis(250), false, noop()).unwrap();
        assert_eq!(record.fire_at(), now + Duration::from_millis(250));
        assert_eq!(record.interval(), Duration::from_millis(250));
    }

    #[test]
    fn one_shot_has_no_next_occurrence() {
        let now = Instant::now();
        let record =
            TaskRecord::new(TaskId(1), now, Duration::from_secs(1), false, noop()).unwrap();
        assert!(record.next_occurrence(now).is_none());
    }

    #[test]
    fn next_occurrence_keeps_id_and_moves_deadline() {
        let start = Instant::now();
        let record =
            TaskRecord::new(TaskId(7), start, Duration::from_millis(100), true, noop()).unwrap();
        let later = start + Duration::from_millis(130);
        let next = record.next_occurrence(later).expect("repeating task");
        assert_eq!(next.id(), TaskId(7));
        assert_eq!(next.fire_at(), later + Duration::from_millis(100));
        assert!(next.is_repeating());
    }

    #[test]
    fn earlier_deadline_sorts_greater() {
        let now = Instant::now();
        let early =
            TaskRecord::new(TaskId(1), now, Duration::from_millis(1), false, noop()).unwrap();
        let late =
            TaskRecord::new(TaskId(2), now, Duration::from_millis(5), false, noop()).unwrap();
        assert!(early > late);
    }

    #[test]
    fn ties_break_on_insertion_sequence() {
        let now = Instant::now();
        let mut first = TaskRecord::new(TaskId(1), now, Duration::ZERO, false, noop()).unwrap();
        let mut second = TaskRecord::new(TaskId(2), now, Duration::ZERO, false, noop()).unwrap();
        first.set_seq(1);
        second.set_seq(2);
        assert!(first > second);
    }

    #[test]
    fn execute_reports_err_and_panic() {
        let now = Instant::now();
        let mut failing = TaskRecord::new(
            TaskId(3),
            now,
            Duration::ZERO,
            false,
            Box::new(|| Err(TaskFailure::new("disk full"))),
        )
        .unwrap();
        match failing.execute() {
            Err(SchedulerError::TaskExecution { task, message }) => {
                assert_eq!(task, TaskId(3));
                assert_eq!(message, "disk full");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let mut panicking = TaskRecord::new(
            TaskId(4),
            now,
            Duration::ZERO,
            false,
            Box::new(|| panic!("boom")),
        )
        .unwrap();
        match panicking.execute() {
            Err(SchedulerError::TaskExecution { message, .. }) => {
                assert_eq!(message, "panicked: boom")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn execute_runs_the_action_each_time() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let mut record = TaskRecord::new(
            TaskId(5),
            Instant::now(),
            Duration::ZERO,
            true,
            Box::new(move || {
                seen.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
        record.execute().unwrap();
        record.execute().unwrap();
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 2);
    }

    /// Largest delay, halving down from `Duration::MAX`, that still fits after `now`.
    fn largest_fitting_delay(now: Instant) -> Duration {
        let mut delay = Duration::MAX;
        while now.checked_add(delay).is_none() {
            delay /= 2;
        }
        delay
    }

    #[test]
    fn delay_past_the_clock_is_rejected() {
        let now = Instant::now();
        match TaskRecord::new(TaskId(8), now, Duration::MAX, false, noop()) {
            Err(SchedulerError::DelayOverflow(delay)) => assert_eq!(delay, Duration::MAX),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn repeat_past_the_clock_is_retired() {
        let now = Instant::now();
        let interval = largest_fitting_delay(now);
        let record = TaskRecord::new(TaskId(9), now, interval, true, noop()).unwrap();
        let fire_at = record.fire_at();
        assert!(record.next_occurrence(fire_at).is_none());
    }
}
