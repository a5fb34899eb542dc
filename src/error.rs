//! Error taxonomy shared by the backends and the scheduler service.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::scheduler::task::TaskId;

/// Errors surfaced by the scheduler and its OS primitives.
///
/// `ResourceInitialization` is returned from construction and `DelayOverflow` from submission.
/// `TimerConfiguration` and `Multiplexer` are fatal to the execution loop. `TaskExecution` is
/// only ever handed to the fault reporter; it never escapes the loop.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to create {resource}: {source}")]
    ResourceInitialization {
        resource: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to program timer: {0}")]
    TimerConfiguration(#[source] io::Error),

    #[error("readiness wait failed: {0}")]
    Multiplexer(#[source] io::Error),

    #[error("task {task} failed: {message}")]
    TaskExecution { task: TaskId, message: String },

    #[error("scheduler is stopped")]
    Stopped,

    #[error("repeating task needs a non-zero interval")]
    InvalidInterval,

    #[error("delay of {0:?} does not fit on the monotonic clock")]
    DelayOverflow(Duration),

    #[error("failed to spawn loop thread: {0}")]
    ThreadSpawn(#[source] io::Error),
}

impl SchedulerError {
    /// Build a `ResourceInitialization` error from the current `errno`.
    pub(crate) fn init_os(resource: &'static str) -> Self {
        SchedulerError::ResourceInitialization {
            resource,
            source: io::Error::last_os_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_overflow_names_the_delay() {
        let err = SchedulerError::DelayOverflow(Duration::from_secs(7));
        assert_eq!(err.to_string(), "delay of 7s does not fit on the monotonic clock");
    }

    #[test]
    fn resource_error_names_the_resource() {
        let err = SchedulerError::ResourceInitialization {
            resource: "timerfd",
            source: io::Error::from_raw_os_error(libc::EMFILE),
        };
        assert!(err.to_string().starts_with("failed to create timerfd"));
    }
}
