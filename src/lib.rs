pub mod backend;
pub mod error;
pub mod fault;
pub mod scheduler;
pub mod threading;

// Re-export for easier use from binaries and tests
pub use backend::BackendKind;
pub use error::SchedulerError;
pub use fault::{FaultKind, FaultReporter, TracingReporter};
pub use scheduler::{
    Scheduler, SchedulerConfig, SchedulerStats, ServiceState, SubmitOptions, TaskFailure, TaskId,
};
