//! Hashed timing wheel.
//!
//! A single background thread advances the wheel once per tick. Producers
//! never touch the wheel itself: new timeouts and cancellations travel to the
//! worker through lock-free queues and are applied at the start of each tick.
//!
//! ```text
//!   schedule ──► pending queue ──┐
//!                                ▼
//!   ┌────┬────┬────┬────┬────┬────┬────┬────┐
//!   │ b0 │ b1 │ b2 │ b3 │ b4 │ b5 │ b6 │ b7 │  ◄── worker, one bucket per tick
//!   └────┴────┴────┴────┴────┴────┴────┴────┘
//!                                ▲
//!   cancel ────► cancel queue ───┘
//! ```
//!
//! A timeout whose deadline is more than one revolution away waits in its
//! bucket for `remaining_rounds` revolutions before it expires.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle, Thread, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{TimerError, TimerResult};

/// Maximum number of pending timeouts moved into the wheel per tick.
const MAX_TRANSFER_PER_TICK: usize = 100_000;

const NO_BUCKET: usize = usize::MAX;

const WORKER_INIT: u8 = 0;
const WORKER_STARTED: u8 = 1;
const WORKER_SHUTDOWN: u8 = 2;

/// State of a [`Timeout`]. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutState {
    /// Scheduled and waiting.
    Initial,
    /// Cancelled before it fired.
    Cancelled,
    /// Fired; its task ran or is running.
    Expired,
}

impl TimeoutState {
    const INITIAL: u8 = 0;
    const CANCELLED: u8 = 1;
    const EXPIRED: u8 = 2;

    fn from_u8(value: u8) -> Self {
        match value {
            Self::CANCELLED => Self::Cancelled,
            Self::EXPIRED => Self::Expired,
            _ => Self::Initial,
        }
    }
}

/// Timer configuration.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Duration of one tick.
    pub tick_duration: Duration,
    /// Number of buckets; rounded up to a power of two.
    pub ticks_per_wheel: usize,
    /// Upper bound on timeouts waiting to fire, if any.
    pub max_pending_timeouts: Option<usize>,
    /// Name of the worker thread.
    pub thread_name: String,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_duration: Duration::from_millis(100),
            ticks_per_wheel: 512,
            max_pending_timeouts: None,
            thread_name: "polyrpc-timer".to_string(),
        }
    }
}

impl TimerConfig {
    /// Builder: set tick duration.
    pub fn with_tick_duration(mut self, tick: Duration) -> Self {
        self.tick_duration = tick;
        self
    }

    /// Builder: set wheel size.
    pub fn with_ticks_per_wheel(mut self, ticks: usize) -> Self {
        self.ticks_per_wheel = ticks;
        self
    }

    /// Builder: bound the number of pending timeouts.
    pub fn with_max_pending_timeouts(mut self, max: usize) -> Self {
        self.max_pending_timeouts = Some(max);
        self
    }
}

type Task = Box<dyn FnOnce(&Timeout) + Send>;

struct TimeoutInner {
    id: u64,
    /// Deadline measured from the timer's start instant.
    deadline: Duration,
    state: AtomicU8,
    task: Mutex<Option<Task>>,
    remaining_rounds: AtomicI64,
    bucket: AtomicUsize,
    timer: Weak<Shared>,
}

/// Handle to a scheduled task.
#[derive(Clone)]
pub struct Timeout {
    inner: Arc<TimeoutInner>,
}

impl std::fmt::Debug for Timeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeout")
            .field("id", &self.inner.id)
            .field("deadline", &self.inner.deadline)
            .field("state", &self.state())
            .finish()
    }
}

impl Timeout {
    /// Current state.
    pub fn state(&self) -> TimeoutState {
        TimeoutState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Deadline relative to the timer's start.
    pub fn deadline(&self) -> Duration {
        self.inner.deadline
    }

    /// Whether the timeout was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state() == TimeoutState::Cancelled
    }

    /// Whether the timeout fired.
    pub fn is_expired(&self) -> bool {
        self.state() == TimeoutState::Expired
    }

    /// Cancels the timeout.
    ///
    /// Returns `false` if it already fired or was already cancelled. The
    /// handle is removed from its bucket on the worker's next tick.
    pub fn cancel(&self) -> bool {
        if !self.transition(TimeoutState::CANCELLED) {
            return false;
        }
        self.inner.task.lock().take();
        if let Some(shared) = self.inner.timer.upgrade() {
            shared.cancelled.push(self.clone());
            shared.unpark_worker();
        }
        true
    }

    fn transition(&self, to: u8) -> bool {
        self.inner
            .state
            .compare_exchange(
                TimeoutState::INITIAL,
                to,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn expire(&self, shared: &Shared) {
        if !self.transition(TimeoutState::EXPIRED) {
            return;
        }
        shared.pending_count.fetch_sub(1, Ordering::AcqRel);
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if catch_unwind(AssertUnwindSafe(|| task(self))).is_err() {
                warn!(timeout_id = self.inner.id, "Timer task panicked");
            }
        }
    }
}

struct Shared {
    config: TimerConfig,
    worker_state: AtomicU8,
    start_time: OnceLock<Instant>,
    worker_thread: OnceLock<Thread>,
    pending: SegQueue<Timeout>,
    cancelled: SegQueue<Timeout>,
    pending_count: AtomicUsize,
    next_id: AtomicU64,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.worker_state.load(Ordering::Acquire) == WORKER_STARTED
    }

    fn unpark_worker(&self) {
        if let Some(thread) = self.worker_thread.get() {
            thread.unpark();
        }
    }
}

/// Tick-driven scheduler for many concurrent delayed tasks.
///
/// The worker thread starts lazily on the first scheduled timeout.
pub struct HashedWheelTimer {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<Vec<Timeout>>>>,
    worker_id: OnceLock<ThreadId>,
}

impl std::fmt::Debug for HashedWheelTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashedWheelTimer")
            .field("tick_duration", &self.shared.config.tick_duration)
            .field("pending", &self.pending_timeouts())
            .finish()
    }
}

impl HashedWheelTimer {
    /// Creates a timer with the given configuration.
    pub fn new(mut config: TimerConfig) -> TimerResult<Self> {
        if config.tick_duration.is_zero() {
            return Err(TimerError::Config("tick duration must be positive".into()));
        }
        if config.ticks_per_wheel == 0 || config.ticks_per_wheel > (1 << 30) {
            return Err(TimerError::Config(format!(
                "ticks per wheel must be in 1..=2^30, got {}",
                config.ticks_per_wheel
            )));
        }
        config.ticks_per_wheel = config.ticks_per_wheel.next_power_of_two();

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                worker_state: AtomicU8::new(WORKER_INIT),
                start_time: OnceLock::new(),
                worker_thread: OnceLock::new(),
                pending: SegQueue::new(),
                cancelled: SegQueue::new(),
                pending_count: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
            worker_id: OnceLock::new(),
        })
    }

    /// Tick duration of this timer.
    pub fn tick_duration(&self) -> Duration {
        self.shared.config.tick_duration
    }

    /// Number of timeouts scheduled and neither expired nor swept as cancelled.
    pub fn pending_timeouts(&self) -> usize {
        self.shared.pending_count.load(Ordering::Acquire)
    }

    /// Starts the worker thread. Starting twice is a no-op.
    pub fn start(&self) -> TimerResult<()> {
        match self.shared.worker_state.compare_exchange(
            WORKER_INIT,
            WORKER_STARTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(WORKER_STARTED) => return Ok(()),
            Err(_) => return Err(TimerError::Stopped),
        }

        let _ = self.shared.start_time.set(Instant::now());
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(self.shared.config.thread_name.clone())
            .spawn(move || Worker::new(shared).run());
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                self.shared
                    .worker_state
                    .store(WORKER_SHUTDOWN, Ordering::Release);
                return Err(TimerError::Spawn(e));
            }
        };
        let _ = self.shared.worker_thread.set(handle.thread().clone());
        let _ = self.worker_id.set(handle.thread().id());
        *self.worker.lock() = Some(handle);

        debug!(
            tick_ms = self.shared.config.tick_duration.as_millis() as u64,
            buckets = self.shared.config.ticks_per_wheel,
            "Timer started"
        );
        Ok(())
    }

    /// Schedules `task` to run once after `delay`.
    pub fn new_timeout<T>(&self, task: T, delay: Duration) -> TimerResult<Timeout>
    where
        T: FnOnce(&Timeout) + Send + 'static,
    {
        if let Some(max) = self.shared.config.max_pending_timeouts {
            let pending = self.shared.pending_count.fetch_add(1, Ordering::AcqRel) + 1;
            if pending > max {
                self.shared.pending_count.fetch_sub(1, Ordering::AcqRel);
                return Err(TimerError::TooManyPending { pending, max });
            }
        } else {
            self.shared.pending_count.fetch_add(1, Ordering::AcqRel);
        }

        if let Err(e) = self.start() {
            self.shared.pending_count.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }

        let start = self.shared.start_time.get().copied().unwrap_or_else(Instant::now);
        let deadline = start.elapsed().saturating_add(delay);
        let timeout = Timeout {
            inner: Arc::new(TimeoutInner {
                id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
                deadline,
                state: AtomicU8::new(TimeoutState::INITIAL),
                task: Mutex::new(Some(Box::new(task))),
                remaining_rounds: AtomicI64::new(0),
                bucket: AtomicUsize::new(NO_BUCKET),
                timer: Arc::downgrade(&self.shared),
            }),
        };
        self.shared.pending.push(timeout.clone());
        // A stop that raced us may have drained `pending` already.
        if !self.shared.is_running() && timeout.transition(TimeoutState::CANCELLED) {
            timeout.inner.task.lock().take();
            self.shared.pending_count.fetch_sub(1, Ordering::AcqRel);
            return Err(TimerError::Stopped);
        }
        trace!(timeout_id = timeout.inner.id, ?delay, "Scheduled timeout");
        Ok(timeout)
    }

    /// Stops the worker and returns the timeouts that neither expired nor
    /// were cancelled. Stopping an already stopped timer returns nothing.
    pub fn stop(&self) -> TimerResult<Vec<Timeout>> {
        if self.worker_id.get() == Some(&thread::current().id()) {
            return Err(TimerError::StopFromWorker);
        }

        match self.shared.worker_state.compare_exchange(
            WORKER_STARTED,
            WORKER_SHUTDOWN,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(_) => {
                self.shared
                    .worker_state
                    .store(WORKER_SHUTDOWN, Ordering::Release);
                return Ok(Vec::new());
            }
        }

        self.shared.unpark_worker();
        let handle = self.worker.lock().take();
        let unprocessed = match handle {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                warn!("Timer worker panicked");
                Vec::new()
            }),
            None => Vec::new(),
        };
        debug!(unprocessed = unprocessed.len(), "Timer stopped");
        Ok(unprocessed)
    }
}

impl Drop for HashedWheelTimer {
    fn drop(&mut self) {
        if self.shared.is_running() {
            self.shared
                .worker_state
                .store(WORKER_SHUTDOWN, Ordering::Release);
            self.shared.unpark_worker();
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    wheel: Vec<HashMap<u64, Timeout>>,
    mask: u64,
    tick: u64,
}

impl Worker {
    fn new(shared: Arc<Shared>) -> Self {
        let buckets = shared.config.ticks_per_wheel;
        Self {
            wheel: (0..buckets).map(|_| HashMap::new()).collect(),
            mask: buckets as u64 - 1,
            tick: 0,
            shared,
        }
    }

    fn run(mut self) -> Vec<Timeout> {
        while let Some(deadline) = self.wait_for_next_tick() {
            self.process_cancelled();
            self.transfer_pending();
            let index = (self.tick & self.mask) as usize;
            self.expire_bucket(index, deadline);
            self.tick += 1;
        }
        self.unprocessed()
    }

    /// Sleeps until the current tick's deadline; `None` once shut down.
    fn wait_for_next_tick(&self) -> Option<Duration> {
        let tick_duration = self.shared.config.tick_duration;
        let deadline = tick_duration.saturating_mul((self.tick + 1).min(u32::MAX as u64) as u32);
        let start = self.shared.start_time.get().copied()?;

        loop {
            if !self.shared.is_running() {
                return None;
            }
            let now = start.elapsed();
            if now >= deadline {
                return Some(now);
            }
            // Unparked early by cancellations and shutdown.
            thread::park_timeout(deadline - now);
        }
    }

    fn transfer_pending(&mut self) {
        let tick_nanos = self.shared.config.tick_duration.as_nanos().max(1);
        let buckets = self.wheel.len() as u64;

        for _ in 0..MAX_TRANSFER_PER_TICK {
            let Some(timeout) = self.shared.pending.pop() else {
                break;
            };
            if timeout.state() == TimeoutState::Cancelled {
                // Counted down when its cancellation is swept.
                continue;
            }

            let calculated = (timeout.inner.deadline.as_nanos() / tick_nanos) as u64;
            let rounds = calculated.saturating_sub(self.tick) / buckets;
            let ticks = calculated.max(self.tick);
            let index = (ticks & self.mask) as usize;

            timeout
                .inner
                .remaining_rounds
                .store(rounds as i64, Ordering::Relaxed);
            timeout.inner.bucket.store(index, Ordering::Release);
            self.wheel[index].insert(timeout.inner.id, timeout);
        }
    }

    fn process_cancelled(&mut self) {
        while let Some(timeout) = self.shared.cancelled.pop() {
            let bucket = timeout.inner.bucket.load(Ordering::Acquire);
            if bucket != NO_BUCKET {
                self.wheel[bucket].remove(&timeout.inner.id);
            }
            self.shared.pending_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn expire_bucket(&mut self, index: usize, deadline: Duration) {
        let mut expired = Vec::new();
        self.wheel[index].retain(|_, timeout| {
            if timeout.state() != TimeoutState::Initial {
                // Cancelled; the cancel queue sweep accounts for it.
                return false;
            }
            let rounds = timeout.inner.remaining_rounds.load(Ordering::Relaxed);
            if rounds <= 0 {
                if timeout.inner.deadline <= deadline {
                    expired.push(timeout.clone());
                    return false;
                }
                warn!(
                    timeout_id = timeout.inner.id,
                    "Timeout placed in the wrong bucket"
                );
                return true;
            }
            timeout
                .inner
                .remaining_rounds
                .store(rounds - 1, Ordering::Relaxed);
            true
        });

        for timeout in expired {
            timeout.inner.bucket.store(NO_BUCKET, Ordering::Release);
            timeout.expire(&self.shared);
        }
    }

    fn unprocessed(&mut self) -> Vec<Timeout> {
        let mut unprocessed = Vec::new();
        for bucket in &mut self.wheel {
            for (_, timeout) in bucket.drain() {
                if timeout.state() == TimeoutState::Initial {
                    unprocessed.push(timeout);
                }
            }
        }
        while let Some(timeout) = self.shared.pending.pop() {
            if timeout.state() == TimeoutState::Initial {
                unprocessed.push(timeout);
            }
        }
        while self.shared.cancelled.pop().is_some() {
            self.shared.pending_count.fetch_sub(1, Ordering::AcqRel);
        }
        unprocessed
    }
}
