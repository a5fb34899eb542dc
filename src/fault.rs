//! Fault reporting collaborator.
//!
//! The scheduler hands every task failure and every fatal loop condition to a
//! [`FaultReporter`] exactly once. How the fault is surfaced is up to the reporter; the
//! default one emits `tracing` events.

use serde::Serialize;
use std::fmt;
use tracing::{error, warn};

use crate::error::SchedulerError;

/// Kind of fault being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    ResourceInitialization,
    TimerConfiguration,
    Multiplexer,
    TaskExecution,
}

impl FaultKind {
    /// Map an error onto its reporting kind, if it is one the reporter receives.
    pub fn of(err: &SchedulerError) -> Option<Self> {
        match err {
            SchedulerError::ResourceInitialization { .. } => {
                Some(FaultKind::ResourceInitialization)
            }
            SchedulerError::TimerConfiguration(_) => Some(FaultKind::TimerConfiguration),
            SchedulerError::Multiplexer(_) => Some(FaultKind::Multiplexer),
            SchedulerError::TaskExecution { .. } => Some(FaultKind::TaskExecution),
            _ => None,
        }
    }

    pub fn is_fatal(self) -> bool {
        !matches!(self, FaultKind::TaskExecution)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FaultKind::ResourceInitialization => "resource_initialization",
            FaultKind::TimerConfiguration => "timer_configuration",
            FaultKind::Multiplexer => "multiplexer",
            FaultKind::TaskExecution => "task_execution",
        };
        write!(f, "{label}")
    }
}

/// Receives `(kind, context)` for each failure.
pub trait FaultReporter: Send + Sync {
    fn report(&self, kind: FaultKind, context: &str);
}

/// Reporter that logs through `tracing`: task failures at `warn`, fatal faults at `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl FaultReporter for TracingReporter {
    fn report(&self, kind: FaultKind, context: &str) {
        if kind.is_fatal() {
            error!(%kind, context, "scheduler fault");
        } else {
            warn!(%kind, context, "task fault");
        }
    }
}

impl<F> FaultReporter for F
where
    F: Fn(FaultKind, &str) + Send + Sync,
{
    fn report(&self, kind: FaultKind, context: &str) {
        self(kind, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;

    #[test]
    fn kinds_follow_the_error_taxonomy() {
        let timer = SchedulerError::TimerConfiguration(io::Error::from_raw_os_error(libc::EINVAL));
        assert_eq!(FaultKind::of(&timer), Some(FaultKind::TimerConfiguration));
        assert_eq!(FaultKind::of(&SchedulerError::Stopped), None);
        assert!(FaultKind::Multiplexer.is_fatal());
        assert!(!FaultKind::TaskExecution.is_fatal());
    }

    #[test]
    fn closures_are_reporters() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter =
            move |kind: FaultKind, context: &str| sink.lock().push((kind, context.to_string()));
        reporter.report(FaultKind::TaskExecution, "task #1 failed");
        assert_eq!(
            seen.lock().as_slice(),
            &[(FaultKind::TaskExecution, "task #1 failed".to_string())]
        );
    }
}
