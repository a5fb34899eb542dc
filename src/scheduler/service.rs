//! Scheduler service: owns the pending set and the OS primitives and runs the execution loop.
//!
//! Lifecycle is `Uninitialized -> Running -> Stopped`, with no restart. `start` runs the loop
//! on a dedicated background thread; `run` runs it on the calling thread and blocks until the
//! service stops. Either way actions execute synchronously on the loop thread, never under the
//! pending-set lock.
//!
//! Loop:
//! 1. Arm the timer for whatever was submitted before the loop started
//! 2. Block in the multiplexer until the timer or the wake channel is ready
//! 3. Acknowledge the timer / consume the wake signal; exit if a stop was requested
//! 4. Pop every due task and run it in deadline order, reporting failures
//! 5. Re-queue repeating tasks at `now + interval`
//! 6. Re-arm for the new earliest deadline (or disarm when empty)
//!
//! Timer and multiplexer failures are fatal: they are reported once, the loop exits and the
//! service ends up `Stopped`. Pending tasks are dropped when the loop exits.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::pending::PendingSet;
use super::task::{Action, TaskFailure, TaskId, TaskRecord};
use crate::backend::{self, BackendKind, BackendParts, Multiplexer, TimerHandle, WakeChannel};
use crate::error::SchedulerError;
use crate::fault::{FaultKind, FaultReporter, TracingReporter};
use crate::threading::tune_current_thread;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Which timer/wake/multiplexer implementation to use.
    pub backend: BackendKind,
    /// Name given to the background loop thread.
    pub thread_name: String,
    /// Optional scheduling priority for the loop thread (see [`crate::threading`]).
    pub thread_priority: Option<i32>,
    /// Optional CPU core to pin the loop thread to.
    pub thread_core: Option<usize>,
    /// Readiness events fetched per wait by the native multiplexer.
    pub max_events: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            thread_name: "timer-loop".to_string(),
            thread_priority: None,
            thread_core: None,
            max_events: 10,
        }
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Re-queue the task at `now + delay` after every run.
    pub repeating: bool,
    /// When the task becomes the earliest deadline, re-arm the timer from the submitting
    /// thread instead of waking the loop to do it.
    pub auto_arm: bool,
}

impl SubmitOptions {
    pub const fn once() -> Self {
        Self {
            repeating: false,
            auto_arm: false,
        }
    }

    pub const fn repeating() -> Self {
        Self {
            repeating: true,
            auto_arm: false,
        }
    }

    pub const fn with_auto_arm(mut self) -> Self {
        self.auto_arm = true;
        self
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Uninitialized,
    Running,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServiceState::Uninitialized => "uninitialized",
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
        };
        write!(f, "{label}")
    }
}

/// Counter snapshot returned by [`Scheduler::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub state: ServiceState,
    pub pending: usize,
    pub submitted: u64,
    pub executed: u64,
    pub failed: u64,
    pub requeued: u64,
    pub wakeups: u64,
    pub timer_expirations: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    wakeups: AtomicU64,
    timer_expirations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, AtomicOrdering::Relaxed);
    }
}

/// State shared between handles and the loop thread.
struct Inner {
    config: SchedulerConfig,
    pending: PendingSet,
    timer: Arc<dyn TimerHandle>,
    wake: Arc<dyn WakeChannel>,
    /// Taken by whichever call ends up running the loop
    multiplexer: Mutex<Option<Box<dyn Multiplexer>>>,
    /// Serializes timer programming so the last arm always reflects the current earliest
    arm_lock: Mutex<()>,
    state: Mutex<ServiceState>,
    stop_requested: AtomicBool,
    next_id: AtomicU64,
    reporter: Arc<dyn FaultReporter>,
    counters: Counters,
    loop_thread: Mutex<Option<ThreadId>>,
}

impl Inner {
    fn is_loop_thread(&self) -> bool {
        *self.loop_thread.lock() == Some(thread::current().id())
    }

    fn report(&self, err: &SchedulerError) {
        if let Some(kind) = FaultKind::of(err) {
            self.reporter.report(kind, &err.to_string());
        }
    }

    /// Program the timer for the current earliest deadline, or disarm when nothing is pending.
    fn rearm(&self) -> Result<(), SchedulerError> {
        let _guard = self.arm_lock.lock();
        match self.pending.peek_earliest() {
            Some(earliest) => {
                trace!(task_id = earliest.id.get(), "arming for earliest task");
                self.timer.arm(earliest.fire_at)
            }
            None => self.timer.disarm(),
        }
    }

    fn request_stop(&self) {
        self.stop_requested.store(true, AtomicOrdering::SeqCst);
        let mut state = self.state.lock();
        match *state {
            ServiceState::Uninitialized => {
                *state = ServiceState::Stopped;
                drop(state);
                let dropped = self.pending.clear();
                info!(dropped, "scheduler stopped before start");
            }
            ServiceState::Running => {
                drop(state);
                self.wake.signal();
            }
            ServiceState::Stopped => {}
        }
    }

    fn enqueue(
        &self,
        delay: Duration,
        action: Action,
        options: SubmitOptions,
    ) -> Result<TaskId, SchedulerError> {
        if options.repeating && delay.is_zero() {
            return Err(SchedulerError::InvalidInterval);
        }
        if self.stop_requested.load(AtomicOrdering::SeqCst) {
            return Err(SchedulerError::Stopped);
        }

        let id = TaskId(self.next_id.fetch_add(1, AtomicOrdering::Relaxed) + 1);
        let record = TaskRecord::new(id, Instant::now(), delay, options.repeating, action)?;
        let became_earliest = self.pending.insert(record);
        Counters::bump(&self.counters.submitted, 1);
        trace!(
            task_id = id.get(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            repeating = options.repeating,
            became_earliest,
            "task submitted"
        );

        if became_earliest {
            if options.auto_arm {
                if let Err(err) = self.rearm() {
                    // The loop re-arms on its own thread; a persistent failure becomes fatal there
                    warn!(task_id = id.get(), error = %err, "direct re-arm failed, waking loop");
                    self.wake.signal();
                }
            } else {
                self.wake.signal();
            }
        }
        Ok(id)
    }

    /// Pop and run every due task, re-queueing repeating ones.
    fn run_due(&self) {
        let now = Instant::now();
        for mut task in self.pending.pop_due(now) {
            let id = task.id();
            let late = now.saturating_duration_since(task.fire_at());
            debug!(
                task_id = id.get(),
                late_us = u64::try_from(late.as_micros()).unwrap_or(u64::MAX),
                "firing task"
            );
            Counters::bump(&self.counters.executed, 1);
            if let Err(err) = task.execute() {
                Counters::bump(&self.counters.failed, 1);
                self.report(&err);
            }

            if self.stop_requested.load(AtomicOrdering::SeqCst) {
                continue;
            }
            let repeating = task.is_repeating();
            match task.next_occurrence(Instant::now()) {
                Some(next) => {
                    self.pending.insert(next);
                    Counters::bump(&self.counters.requeued, 1);
                }
                None if repeating => {
                    warn!(task_id = id.get(), "next deadline overflows the clock, retiring task");
                }
                None => {}
            }
        }
    }

    fn drive(&self, multiplexer: &mut dyn Multiplexer) -> Result<(), SchedulerError> {
        self.rearm()?;
        loop {
            if self.stop_requested.load(AtomicOrdering::SeqCst) {
                return Ok(());
            }

            let readiness = multiplexer.wait_until_ready()?;
            if readiness.timer {
                let expirations = self.timer.acknowledge()?;
                Counters::bump(&self.counters.timer_expirations, expirations);
            }
            if readiness.wake && self.wake.consume() {
                Counters::bump(&self.counters.wakeups, 1);
            }
            if self.stop_requested.load(AtomicOrdering::SeqCst) {
                return Ok(());
            }

            // A wake may mean "earlier task arrived" and a timer report may be stale, so the
            // due set is always re-evaluated from the pending set itself
            self.run_due();
            self.rearm()?;
        }
    }

    fn run_loop(&self, mut multiplexer: Box<dyn Multiplexer>) -> Result<(), SchedulerError> {
        *self.loop_thread.lock() = Some(thread::current().id());
        tune_current_thread(self.config.thread_priority, self.config.thread_core);
        info!(backend = ?self.config.backend, "timer loop started");

        let outcome = self.drive(multiplexer.as_mut());
        if let Err(err) = &outcome {
            self.report(err);
        }

        self.stop_requested.store(true, AtomicOrdering::SeqCst);
        *self.state.lock() = ServiceState::Stopped;
        if let Err(err) = self.timer.disarm() {
            debug!(error = %err, "disarm during teardown failed");
        }
        let dropped = self.pending.clear();
        info!(dropped, "timer loop stopped");
        outcome
    }
}

/// Owner of the loop thread; stops and joins it when the last `Scheduler` handle drops.
struct Handle {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<Result<(), SchedulerError>>>>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.inner.request_stop();
        if let Some(thread) = self.thread.get_mut().take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

/// Timed-task scheduler.
///
/// Cheap to clone; every clone refers to the same service. Dropping the last clone stops the
/// loop and joins its thread. A task whose action captures a clone keeps the service alive
/// until `stop` is called.
#[derive(Clone)]
pub struct Scheduler {
    handle: Arc<Handle>,
}

impl Scheduler {
    /// Create a scheduler, opening the configured backend.
    ///
    /// Fails with `ResourceInitialization` when the timer, wake channel or multiplexer cannot
    /// be created; no service exists in that case.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::with_reporter(config, Arc::new(TracingReporter))
    }

    /// Like [`Scheduler::new`] with a custom fault reporter.
    pub fn with_reporter(
        config: SchedulerConfig,
        reporter: Arc<dyn FaultReporter>,
    ) -> Result<Self, SchedulerError> {
        let parts = match backend::open(config.backend, config.max_events) {
            Ok(parts) => parts,
            Err(err) => {
                reporter.report(FaultKind::ResourceInitialization, &err.to_string());
                return Err(err);
            }
        };
        Ok(Self::from_parts(config, parts, reporter))
    }

    /// Build a scheduler over externally supplied primitives.
    pub fn from_parts(
        config: SchedulerConfig,
        parts: BackendParts,
        reporter: Arc<dyn FaultReporter>,
    ) -> Self {
        let inner = Arc::new(Inner {
            config,
            pending: PendingSet::new(),
            timer: parts.timer,
            wake: parts.wake,
            multiplexer: Mutex::new(Some(parts.multiplexer)),
            arm_lock: Mutex::new(()),
            state: Mutex::new(ServiceState::Uninitialized),
            stop_requested: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            reporter,
            counters: Counters::default(),
            loop_thread: Mutex::new(None),
        });
        Self {
            handle: Arc::new(Handle {
                inner,
                thread: Mutex::new(None),
            }),
        }
    }

    fn inner(&self) -> &Arc<Inner> {
        &self.handle.inner
    }

    /// Move to `Running` and hand back the multiplexer, or say why not.
    ///
    /// `Ok(None)` means the service is already running.
    fn claim_loop(&self) -> Result<Option<Box<dyn Multiplexer>>, SchedulerError> {
        let inner = self.inner();
        let mut state = inner.state.lock();
        match *state {
            ServiceState::Running => Ok(None),
            ServiceState::Stopped => Err(SchedulerError::Stopped),
            ServiceState::Uninitialized => {
                let multiplexer = inner.multiplexer.lock().take().ok_or(SchedulerError::Stopped)?;
                *state = ServiceState::Running;
                Ok(Some(multiplexer))
            }
        }
    }

    /// Start the execution loop on a background thread.
    ///
    /// A no-op when already running; `Err(Stopped)` once the service has stopped.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let Some(multiplexer) = self.claim_loop()? else {
            return Ok(());
        };

        let inner = self.inner().clone();
        let spawned = thread::Builder::new()
            .name(inner.config.thread_name.clone())
            .spawn(move || inner.run_loop(multiplexer));

        match spawned {
            Ok(thread) => {
                *self.handle.thread.lock() = Some(thread);
                Ok(())
            }
            Err(err) => {
                let inner = self.inner();
                inner.stop_requested.store(true, AtomicOrdering::SeqCst);
                *inner.state.lock() = ServiceState::Stopped;
                Err(SchedulerError::ThreadSpawn(err))
            }
        }
    }

    /// Run the execution loop on the calling thread until the service stops.
    ///
    /// Returns immediately when the loop is already running elsewhere. A fatal loop error is
    /// returned here after being reported.
    pub fn run(&self) -> Result<(), SchedulerError> {
        match self.claim_loop()? {
            Some(multiplexer) => self.inner().run_loop(multiplexer),
            None => Ok(()),
        }
    }

    /// Ask the loop to stop. Idempotent and safe from any thread, including from inside a
    /// running action; it never waits for the loop.
    pub fn stop(&self) {
        self.inner().request_stop();
    }

    /// Wait for the background loop thread to exit.
    ///
    /// The first joiner receives the loop's fatal error, if any. Returns `Ok(())` right away
    /// when called from the loop thread itself or when no background thread was started.
    pub fn join(&self) -> Result<(), SchedulerError> {
        if self.inner().is_loop_thread() {
            return Ok(());
        }
        let Some(thread) = self.handle.thread.lock().take() else {
            return Ok(());
        };
        match thread.join() {
            Ok(outcome) => outcome,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Stop and wait for the loop thread.
    pub fn shutdown(&self) -> Result<(), SchedulerError> {
        self.stop();
        self.join()
    }

    /// Submit an infallible action.
    pub fn submit<F>(
        &self,
        delay: Duration,
        mut action: F,
        options: SubmitOptions,
    ) -> Result<TaskId, SchedulerError>
    where
        F: FnMut() + Send + 'static,
    {
        self.inner().enqueue(
            delay,
            Box::new(move || {
                action();
                Ok(())
            }),
            options,
        )
    }

    /// Submit an action whose `Err` is reported as a task failure.
    pub fn submit_fallible<F, E>(
        &self,
        delay: Duration,
        mut action: F,
        options: SubmitOptions,
    ) -> Result<TaskId, SchedulerError>
    where
        F: FnMut() -> Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        self.inner().enqueue(
            delay,
            Box::new(move || action().map_err(|err| TaskFailure::new(err.to_string()))),
            options,
        )
    }

    /// Run `action` once after `delay`.
    pub fn schedule_once<F>(&self, delay: Duration, action: F) -> Result<TaskId, SchedulerError>
    where
        F: FnMut() + Send + 'static,
    {
        self.submit(delay, action, SubmitOptions::once())
    }

    /// Run `action` every `interval`, first after one interval.
    pub fn schedule_repeating<F>(
        &self,
        interval: Duration,
        action: F,
    ) -> Result<TaskId, SchedulerError>
    where
        F: FnMut() + Send + 'static,
    {
        self.submit(interval, action, SubmitOptions::repeating())
    }

    pub fn state(&self) -> ServiceState {
        *self.inner().state.lock()
    }

    pub fn pending_len(&self) -> usize {
        self.inner().pending.len()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner().config
    }

    pub fn stats(&self) -> SchedulerStats {
        let inner = self.inner();
        let counters = &inner.counters;
        SchedulerStats {
            state: self.state(),
            pending: inner.pending.len(),
            submitted: counters.submitted.load(AtomicOrdering::Relaxed),
            executed: counters.executed.load(AtomicOrdering::Relaxed),
            failed: counters.failed.load(AtomicOrdering::Relaxed),
            requeued: counters.requeued.load(AtomicOrdering::Relaxed),
            wakeups: counters.wakeups.load(AtomicOrdering::Relaxed),
            timer_expirations: counters.timer_expirations.load(AtomicOrdering::Relaxed),
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state())
            .field("pending", &self.pending_len())
            .field("backend", &self.config().backend)
            .finish()
    }
}
