//! Linux backend: `timerfd` for the deadline, `eventfd` for wakeups, `epoll` to wait on both.
//!
//! Every descriptor is created non-blocking and close-on-exec and is closed when its owner
//! drops. epoll is used level-triggered, so a timer expiration or a wake signal that lands
//! before `epoll_wait` is still reported until it is read.

use libc::{c_int, c_void, epoll_event, itimerspec, timespec};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use super::{BackendParts, Multiplexer, Readiness, TimerHandle, WakeChannel};
use crate::error::SchedulerError;

const TIMER_TOKEN: u64 = 1;
const WAKE_TOKEN: u64 = 2;

/// Build the native timer, wake channel and multiplexer.
pub fn open(max_events: usize) -> Result<BackendParts, SchedulerError> {
    let timer = Arc::new(TimerFd::new()?);
    let wake = Arc::new(EventFd::new()?);
    let epoll = Epoll::new(timer.clone(), wake.clone(), max_events)?;
    debug!(
        epoll_fd = epoll.epfd.as_raw_fd(),
        timer_fd = timer.as_raw_fd(),
        wake_fd = wake.as_raw_fd(),
        "opened native timer backend"
    );
    Ok(BackendParts {
        timer,
        wake,
        multiplexer: Box::new(epoll),
    })
}

/// Read one 8-byte counter from a non-blocking descriptor.
///
/// `Ok(None)` means the descriptor had nothing to read.
fn read_counter(fd: RawFd) -> io::Result<Option<u64>> {
    let mut buf = [0u8; 8];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n == buf.len() as isize {
            return Ok(Some(u64::from_ne_bytes(buf)));
        }
        if n >= 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read of {n} bytes"),
            ));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Ok(None),
            _ => return Err(err),
        }
    }
}

fn monotonic_now() -> io::Result<timespec> {
    let mut now = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(now)
}

/// `base + offset`, saturating instead of overflowing `time_t`.
fn timespec_add(base: timespec, offset: Duration) -> timespec {
    let secs = libc::time_t::try_from(offset.as_secs()).unwrap_or(libc::time_t::MAX);
    let mut tv_sec = base.tv_sec.saturating_add(secs);
    let mut tv_nsec = base.tv_nsec + offset.subsec_nanos() as libc::c_long;
    if tv_nsec >= 1_000_000_000 {
        tv_nsec -= 1_000_000_000;
        tv_sec = tv_sec.saturating_add(1);
    }
    timespec { tv_sec, tv_nsec }
}

/// Absolute-time timer on `CLOCK_MONOTONIC`.
pub struct TimerFd {
    fd: OwnedFd,
}

impl TimerFd {
    pub fn new() -> Result<Self, SchedulerError> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd == -1 {
            return Err(SchedulerError::init_os("timerfd"));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn set(&self, value: timespec, flags: c_int) -> Result<(), SchedulerError> {
        let spec = itimerspec {
            it_interval: timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: value,
        };
        let rc = unsafe {
            libc::timerfd_settime(self.fd.as_raw_fd(), flags, &spec, std::ptr::null_mut())
        };
        if rc == -1 {
            return Err(SchedulerError::TimerConfiguration(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl TimerHandle for TimerFd {
    fn arm(&self, deadline: Instant) -> Result<(), SchedulerError> {
        // Translate the Instant into CLOCK_MONOTONIC time through the remaining delay. A
        // deadline in the past becomes "now", which TFD_TIMER_ABSTIME fires immediately; the
        // value is never zero, which would disarm instead.
        let remaining = deadline.saturating_duration_since(Instant::now());
        let now = monotonic_now().map_err(SchedulerError::TimerConfiguration)?;
        let target = timespec_add(now, remaining);
        trace!(
            remaining_us = u64::try_from(remaining.as_micros()).unwrap_or(u64::MAX),
            "arming timerfd"
        );
        self.set(target, libc::TFD_TIMER_ABSTIME)
    }

    fn disarm(&self) -> Result<(), SchedulerError> {
        self.set(
            timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            0,
        )
    }

    fn acknowledge(&self) -> Result<u64, SchedulerError> {
        read_counter(self.fd.as_raw_fd())
            .map(|count| count.unwrap_or(0))
            .map_err(SchedulerError::TimerConfiguration)
    }
}

/// Coalescing wake signal backed by an eventfd counter.
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn new() -> Result<Self, SchedulerError> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd == -1 {
            return Err(SchedulerError::init_os("eventfd"));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl WakeChannel for EventFd {
    fn signal(&self) {
        let one = 1u64.to_ne_bytes();
        loop {
            let n = unsafe {
                libc::write(self.fd.as_raw_fd(), one.as_ptr() as *const c_void, one.len())
            };
            if n >= 0 {
                return;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                // Counter saturated: a wakeup is already pending
                Some(libc::EAGAIN) => return,
                _ => {
                    warn!(error = %err, "eventfd write failed");
                    return;
                }
            }
        }
    }

    fn consume(&self) -> bool {
        match read_counter(self.fd.as_raw_fd()) {
            Ok(count) => count.is_some(),
            Err(err) => {
                warn!(error = %err, "eventfd read failed");
                false
            }
        }
    }
}

/// epoll instance watching one timerfd and one eventfd.
pub struct Epoll {
    epfd: OwnedFd,
    events: Vec<epoll_event>,
    // Registered descriptors stay open for as long as the epoll set refers to them
    _timer: Arc<TimerFd>,
    _wake: Arc<EventFd>,
}

impl Epoll {
    pub fn new(
        timer: Arc<TimerFd>,
        wake: Arc<EventFd>,
        max_events: usize,
    ) -> Result<Self, SchedulerError> {
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw == -1 {
            return Err(SchedulerError::init_os("epoll"));
        }
        let epfd = unsafe { OwnedFd::from_raw_fd(raw) };
        register(&epfd, timer.as_raw_fd(), TIMER_TOKEN, "epoll timer registration")?;
        register(&epfd, wake.as_raw_fd(), WAKE_TOKEN, "epoll wake registration")?;

        let capacity = max_events.max(2);
        Ok(Self {
            epfd,
            events: vec![epoll_event { events: 0, u64: 0 }; capacity],
            _timer: timer,
            _wake: wake,
        })
    }
}

fn register(
    epfd: &OwnedFd,
    fd: RawFd,
    token: u64,
    resource: &'static str,
) -> Result<(), SchedulerError> {
    let mut event = epoll_event {
        events: libc::EPOLLIN as u32,
        u64: token,
    };
    let rc = unsafe { libc::epoll_ctl(epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
    if rc == -1 {
        return Err(SchedulerError::init_os(resource));
    }
    Ok(())
}

impl Multiplexer for Epoll {
    fn wait_until_ready(&mut self) -> Result<Readiness, SchedulerError> {
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd.as_raw_fd(),
                    self.events.as_mut_ptr(),
                    self.events.len() as c_int,
                    -1,
                )
            };
            if n == -1 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(SchedulerError::Multiplexer(err));
            }

            let mut readiness = Readiness::default();
            // Only the first `n` slots are valid
            for event in &self.events[..n as usize] {
                let token = event.u64;
                match token {
                    TIMER_TOKEN => readiness.timer = true,
                    WAKE_TOKEN => readiness.wake = true,
                    other => warn!(token = other, "unexpected epoll token"),
                }
            }
            if readiness.any() {
                return Ok(readiness);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn timespec_add_carries_nanoseconds() {
        let base = timespec {
            tv_sec: 10,
            tv_nsec: 900_000_000,
        };
        let sum = timespec_add(base, Duration::from_millis(250));
        assert_eq!(sum.tv_sec, 11);
        assert_eq!(sum.tv_nsec, 150_000_000);
    }

    #[test]
    fn timespec_add_saturates() {
        let base = timespec {
            tv_sec: 10,
            tv_nsec: 0,
        };
        let sum = timespec_add(base, Duration::from_secs(u64::MAX));
        assert_eq!(sum.tv_sec, libc::time_t::MAX);
    }

    #[test]
    fn eventfd_coalesces_signals() {
        let wake = EventFd::new().unwrap();
        assert!(!wake.consume());
        wake.signal();
        wake.signal();
        wake.signal();
        assert!(wake.consume());
        assert!(!wake.consume());
    }

    #[test]
    fn timerfd_expires_once_per_deadline() {
        let timer = TimerFd::new().unwrap();
        assert_eq!(timer.acknowledge().unwrap(), 0);
        timer.arm(Instant::now() + Duration::from_millis(20)).unwrap();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(timer.acknowledge().unwrap(), 1);
        assert_eq!(timer.acknowledge().unwrap(), 0);
    }

    #[test]
    fn timerfd_past_deadline_fires_immediately() {
        let timer = TimerFd::new().unwrap();
        let past = Instant::now()
            .checked_sub(Duration::from_secs(1))
            .unwrap_or_else(Instant::now);
        timer.arm(past).unwrap();
        thread::sleep(Duration::from_millis(5));
        assert_eq!(timer.acknowledge().unwrap(), 1);
    }

    #[test]
    fn timerfd_disarm_and_rearm_cancel_previous_deadline() {
        let timer = TimerFd::new().unwrap();
        timer.arm(Instant::now() + Duration::from_millis(10)).unwrap();
        timer.disarm().unwrap();
        timer.disarm().unwrap();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(timer.acknowledge().unwrap(), 0);

        timer.arm(Instant::now() + Duration::from_millis(10)).unwrap();
        timer.arm(Instant::now() + Duration::from_secs(60)).unwrap();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(timer.acknowledge().unwrap(), 0);
    }

    #[test]
    fn epoll_reports_each_source() {
        let parts = open(10).unwrap();
        let mut mux = parts.multiplexer;

        parts.wake.signal();
        let ready = mux.wait_until_ready().unwrap();
        assert!(ready.wake);
        assert!(!ready.timer);
        // Level-triggered: still ready until consumed
        assert!(mux.wait_until_ready().unwrap().wake);
        assert!(parts.wake.consume());

        parts
            .timer
            .arm(Instant::now() + Duration::from_millis(15))
            .unwrap();
        let started = Instant::now();
        let ready = mux.wait_until_ready().unwrap();
        assert!(ready.timer);
        assert!(started.elapsed() >= Duration::from_millis(10));
        assert_eq!(parts.timer.acknowledge().unwrap(), 1);
    }

    #[test]
    fn epoll_wakes_on_signal_from_another_thread() {
        let parts = open(10).unwrap();
        let mut mux = parts.multiplexer;
        let wake = parts.wake.clone();
        let signaller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            wake.signal();
        });
        let ready = mux.wait_until_ready().unwrap();
        assert!(ready.wake);
        signaller.join().unwrap();
    }
}
