//! Portable backend built on one mutex and one condition variable.
//!
//! The timer, the wake channel and the multiplexer share a single [`Shared`] state. Arming or
//! signalling updates the state and notifies the condition variable; the multiplexer sleeps
//! until the armed deadline (or indefinitely when disarmed) and re-checks the state on every
//! wakeup, so spurious condvar wakeups are harmless.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Instant;

use super::{BackendParts, Multiplexer, Readiness, TimerHandle, WakeChannel};
use crate::error::SchedulerError;

#[derive(Debug, Default)]
struct State {
    /// Armed deadline, if any
    deadline: Option<Instant>,
    /// Expirations not yet acknowledged
    expirations: u64,
    /// Pending wake signal
    wake: bool,
}

struct Shared {
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    fn notify(&self) {
        self.changed.notify_all();
    }
}

/// Build the condvar-backed timer, wake channel and multiplexer.
pub fn open() -> BackendParts {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::default()),
        changed: Condvar::new(),
    });
    BackendParts {
        timer: Arc::new(CondvarTimer {
            shared: shared.clone(),
        }),
        wake: Arc::new(CondvarWake {
            shared: shared.clone(),
        }),
        multiplexer: Box::new(CondvarMultiplexer { shared }),
    }
}

pub struct CondvarTimer {
    shared: Arc<Shared>,
}

impl TimerHandle for CondvarTimer {
    fn arm(&self, deadline: Instant) -> Result<(), SchedulerError> {
        {
            let mut state = self.shared.state.lock();
            state.deadline = Some(deadline);
            // Re-arming resets the expiration count, as timerfd_settime does
            state.expirations = 0;
        }
        self.shared.notify();
        Ok(())
    }

    fn disarm(&self) -> Result<(), SchedulerError> {
        let mut state = self.shared.state.lock();
        state.deadline = None;
        state.expirations = 0;
        Ok(())
    }

    fn acknowledge(&self) -> Result<u64, SchedulerError> {
        let mut state = self.shared.state.lock();
        expire_if_due(&mut state, Instant::now());
        Ok(std::mem::take(&mut state.expirations))
    }
}

pub struct CondvarWake {
    shared: Arc<Shared>,
}

impl WakeChannel for CondvarWake {
    fn signal(&self) {
        self.shared.state.lock().wake = true;
        self.shared.notify();
    }

    fn consume(&self) -> bool {
        std::mem::take(&mut self.shared.state.lock().wake)
    }
}

pub struct CondvarMultiplexer {
    shared: Arc<Shared>,
}

/// Move an elapsed deadline into the expiration count.
fn expire_if_due(state: &mut State, now: Instant) {
    if state.deadline.is_some_and(|deadline| deadline <= now) {
        state.deadline = None;
        state.expirations += 1;
    }
}

impl Multiplexer for CondvarMultiplexer {
    fn wait_until_ready(&mut self) -> Result<Readiness, SchedulerError> {
        let mut state = self.shared.state.lock();
        loop {
            expire_if_due(&mut state, Instant::now());
            let readiness = Readiness {
                timer: state.expirations > 0,
                wake: state.wake,
            };
            if readiness.any() {
                return Ok(readiness);
            }
            match state.deadline {
                Some(deadline) => {
                    self.shared.changed.wait_until(&mut state, deadline);
                }
                None => self.shared.changed.wait(&mut state),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wake_coalesces() {
        let parts = open();
        parts.wake.signal();
        parts.wake.signal();
        assert!(parts.wake.consume());
        assert!(!parts.wake.consume());
    }

    #[test]
    fn signal_before_wait_is_not_lost() {
        let parts = open();
        let mut mux = parts.multiplexer;
        parts.wake.signal();
        let ready = mux.wait_until_ready().unwrap();
        assert_eq!(ready, Readiness { timer: false, wake: true });
    }

    #[test]
    fn timer_fires_at_deadline() {
        let parts = open();
        let mut mux = parts.multiplexer;
        let deadline = Instant::now() + Duration::from_millis(20);
        parts.timer.arm(deadline).unwrap();
        let ready = mux.wait_until_ready().unwrap();
        assert!(ready.timer);
        assert!(Instant::now() >= deadline);
        assert_eq!(parts.timer.acknowledge().unwrap(), 1);
        assert_eq!(parts.timer.acknowledge().unwrap(), 0);
    }

    #[test]
    fn past_deadline_is_ready_immediately() {
        let parts = open();
        let mut mux = parts.multiplexer;
        parts.timer.arm(Instant::now()).unwrap();
        assert!(mux.wait_until_ready().unwrap().timer);
    }

    #[test]
    fn disarm_cancels_expiration() {
        let parts = open();
        parts
            .timer
            .arm(Instant::now() + Duration::from_millis(5))
            .unwrap();
        parts.timer.disarm().unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(parts.timer.acknowledge().unwrap(), 0);
    }

    #[test]
    fn earlier_rearm_wakes_a_sleeping_wait() {
        let parts = open();
        let mut mux = parts.multiplexer;
        parts
            .timer
            .arm(Instant::now() + Duration::from_secs(60))
            .unwrap();
        let timer = parts.timer.clone();
        let rearm = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            timer.arm(Instant::now() + Duration::from_millis(10)).unwrap();
        });
        let started = Instant::now();
        assert!(mux.wait_until_ready().unwrap().timer);
        assert!(started.elapsed() < Duration::from_secs(5));
        rearm.join().unwrap();
    }
}
