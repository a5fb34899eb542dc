//! Task records, the ordered pending set and the scheduler service built on top of them.

pub mod pending;
pub mod service;
pub mod task;

pub use pending::{PendingEntry, PendingSet};
pub use service::{Scheduler, SchedulerConfig, SchedulerStats, ServiceState, SubmitOptions};
pub use task::{Action, TaskFailure, TaskId, TaskRecord};
