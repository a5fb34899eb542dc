//! OS primitives the execution loop blocks on.
//!
//! The loop needs three things: a timer armed with an absolute monotonic deadline, a
//! coalescing wake signal any thread can raise, and a multiplexer that sleeps until either of
//! them is ready. Each is a trait so the scheduler logic does not care which backend provides
//! it:
//!
//! - [`BackendKind::Native`]: `timerfd` + `eventfd` + `epoll` (Linux only)
//! - [`BackendKind::Portable`]: a mutex/condition-variable pair, available everywhere

#[cfg(target_os = "linux")]
pub mod linux;
pub mod portable;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::error::SchedulerError;

/// Absolute-deadline timer.
///
/// At most one deadline is armed at a time; re-arming replaces it.
pub trait TimerHandle: Send + Sync {
    /// Arm for a single expiration at `deadline`. A deadline already in the past fires as
    /// soon as possible.
    fn arm(&self, deadline: Instant) -> Result<(), SchedulerError>;

    /// Cancel any pending expiration. Idempotent.
    fn disarm(&self) -> Result<(), SchedulerError>;

    /// Drain the expiration count after the multiplexer reported the timer ready.
    ///
    /// Returns 0 when nothing had expired (spurious readiness).
    fn acknowledge(&self) -> Result<u64, SchedulerError>;
}

/// Coalescing cross-thread wake signal.
pub trait WakeChannel: Send + Sync {
    /// Raise the signal. Never fails; repeated raises collapse into one.
    fn signal(&self);

    /// Drain and reset the signal, returning whether one was pending.
    fn consume(&self) -> bool;
}

/// Which sources were ready when [`Multiplexer::wait_until_ready`] returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub timer: bool,
    pub wake: bool,
}

impl Readiness {
    pub fn any(self) -> bool {
        self.timer || self.wake
    }
}

/// Blocking wait over the timer and the wake channel.
///
/// Sources are level-triggered: readiness raised before the call and not yet consumed is
/// reported immediately.
pub trait Multiplexer: Send {
    fn wait_until_ready(&mut self) -> Result<Readiness, SchedulerError>;
}

/// Backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// timerfd/eventfd/epoll
    Native,
    /// Mutex + condition variable
    Portable,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            BackendKind::Native
        } else {
            BackendKind::Portable
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "native" | "epoll" | "timerfd" => Ok(BackendKind::Native),
            "portable" | "condvar" => Ok(BackendKind::Portable),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// The three primitives built by [`open`], ready to be handed to the scheduler.
pub struct BackendParts {
    pub timer: Arc<dyn TimerHandle>,
    pub wake: Arc<dyn WakeChannel>,
    pub multiplexer: Box<dyn Multiplexer>,
}

/// Create the timer, wake channel and multiplexer for `kind`.
///
/// `max_events` bounds how many readiness events the native multiplexer fetches per wait.
pub fn open(kind: BackendKind, max_events: usize) -> Result<BackendParts, SchedulerError> {
    match kind {
        BackendKind::Native => open_native(max_events),
        BackendKind::Portable => Ok(portable::open()),
    }
}

#[cfg(target_os = "linux")]
fn open_native(max_events: usize) -> Result<BackendParts, SchedulerError> {
    linux::open(max_events)
}

#[cfg(not(target_os = "linux"))]
fn open_native(_max_events: usize) -> Result<BackendParts, SchedulerError> {
    Err(SchedulerError::ResourceInitialization {
        resource: "native timer backend",
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "timerfd/epoll are only available on Linux",
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_aliases() {
        assert_eq!("native".parse::<BackendKind>(), Ok(BackendKind::Native));
        assert_eq!("EPOLL".parse::<BackendKind>(), Ok(BackendKind::Native));
        assert_eq!("condvar".parse::<BackendKind>(), Ok(BackendKind::Portable));
        assert!("kqueue".parse::<BackendKind>().is_err());
    }

    #[test]
    fn readiness_any() {
        assert!(!Readiness::default().any());
        assert!(Readiness { timer: true, wake: false }.any());
        assert!(Readiness { timer: false, wake: true }.any());
    }

    #[test]
    fn portable_backend_always_opens() {
        assert!(open(BackendKind::Portable, 10).is_ok());
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn native_backend_is_rejected_off_linux() {
        assert!(matches!(
            open(BackendKind::Native, 10),
            Err(SchedulerError::ResourceInitialization { .. })
        ));
    }
}
