//! Hashed timer wheel for request expiration.
//!
//! One wheel is shared by every channel of a client. A tokio task advances
//! the wheel once per `resolution`, so an expiration fires no earlier than
//! its deadline and at most about one tick after it.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::protocol::error::{Result, RntbdError};

const WHEEL_SIZE: usize = 512;

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const EXPIRED: u8 = 2;

type ExpireTask = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    remaining_rounds: u64,
    state: Arc<AtomicU8>,
    task: ExpireTask,
}

struct Wheel {
    slots: Vec<Vec<Entry>>,
    /// Last tick that has been processed.
    tick: u64,
}

struct TimerInner {
    wheel: Mutex<Wheel>,
    started: Instant,
    resolution: Duration,
    pending: AtomicUsize,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

/// Handle to one scheduled expiration.
#[derive(Clone)]
pub struct TimeoutHandle {
    state: Arc<AtomicU8>,
    timer: Weak<TimerInner>,
}

impl TimeoutHandle {
    /// Cancels the expiration. Returns false if it already fired or was
    /// already cancelled, in which case this is a no-op.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            if let Some(timer) = self.timer.upgrade() {
                timer.pending.fetch_sub(1, Ordering::AcqRel);
            }
        }
        cancelled
    }

    pub fn is_expired(&self) -> bool {
        self.state.load(Ordering::Acquire) == EXPIRED
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

impl std::fmt::Debug for TimeoutHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            PENDING => "pending",
            CANCELLED => "cancelled",
            _ => "expired",
        };
        f.debug_struct("TimeoutHandle").field("state", &state).finish()
    }
}

/// Request expiration timer.
pub struct RequestTimer {
    inner: Arc<TimerInner>,
    request_timeout: Duration,
}

impl RequestTimer {
    /// Creates the timer and spawns its driver on the current tokio runtime.
    pub fn new(request_timeout: Duration, resolution: Duration) -> Result<Self> {
        if resolution.is_zero() {
            return Err(RntbdError::Config("timer resolution must be non-zero".to_string()));
        }

        let inner = Arc::new(TimerInner {
            wheel: Mutex::new(Wheel {
                slots: (0..WHEEL_SIZE).map(|_| Vec::new()).collect(),
                tick: 0,
            }),
            started: Instant::now(),
            resolution,
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&inner);
        let shutdown = inner.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(resolution);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match weak.upgrade() {
                    Some(timer) => timer.advance(Instant::now()),
                    None => break,
                }
            }
        });

        Ok(RequestTimer {
            inner,
            request_timeout,
        })
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn resolution(&self) -> Duration {
        self.inner.resolution
    }

    /// Schedules `task` to run once the configured request timeout elapses.
    pub fn new_timeout<F>(&self, task: F) -> Result<TimeoutHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Instant::now() + self.request_timeout, task)
    }

    /// Schedules `task` to run at `deadline`.
    pub fn schedule<F>(&self, deadline: Instant, task: F) -> Result<TimeoutHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = &self.inner;
        let state = Arc::new(AtomicU8::new(PENDING));

        let mut wheel = inner.wheel.lock();
        if inner.closed.load(Ordering::Acquire) {
            return Err(RntbdError::Shutdown("request timer is closed".to_string()));
        }

        let target = inner.tick_for(deadline).max(wheel.tick + 1);
        let ticks_ahead = target - wheel.tick;
        let slot = (target % WHEEL_SIZE as u64) as usize;
        wheel.slots[slot].push(Entry {
            remaining_rounds: (ticks_ahead - 1) / WHEEL_SIZE as u64,
            state: state.clone(),
            task: Box::new(task),
        });
        inner.pending.fetch_add(1, Ordering::AcqRel);

        Ok(TimeoutHandle {
            state,
            timer: Arc::downgrade(inner),
        })
    }

    /// Number of scheduled expirations that have neither fired nor been
    /// cancelled.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stops the driver and cancels every pending expiration without
    /// running it. Returns the number cancelled.
    pub fn close(&self) -> usize {
        let inner = &self.inner;
        let entries: Vec<Entry> = {
            let mut wheel = inner.wheel.lock();
            if inner.closed.swap(true, Ordering::AcqRel) {
                return 0;
            }
            wheel.slots.iter_mut().flat_map(std::mem::take).collect()
        };
        inner.shutdown.cancel();

        let mut count = 0;
        for entry in entries {
            if entry
                .state
                .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                inner.pending.fetch_sub(1, Ordering::AcqRel);
                count += 1;
            }
        }

        tracing::debug!(count, "request expiration tasks cancelled: {}", count);
        count
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl TimerInner {
    /// First tick at or after `deadline`.
    fn tick_for(&self, deadline: Instant) -> u64 {
        let offset = deadline.saturating_duration_since(self.started).as_nanos();
        let resolution = self.resolution.as_nanos();
        offset.div_ceil(resolution) as u64
    }

    fn advance(&self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.started).as_nanos();
        let current = (elapsed / self.resolution.as_nanos()) as u64;

        let mut due = Vec::new();
        {
            let mut wheel = self.wheel.lock();
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            while wheel.tick < current {
                wheel.tick += 1;
                let slot = (wheel.tick % WHEEL_SIZE as u64) as usize;
                let entries = std::mem::take(&mut wheel.slots[slot]);
                let mut keep = Vec::new();
                for mut entry in entries {
                    if entry.state.load(Ordering::Acquire) != PENDING {
                        continue;
                    }
                    if entry.remaining_rounds == 0 {
                        due.push(entry);
                    } else {
                        entry.remaining_rounds -= 1;
                        keep.push(entry);
                    }
                }
                wheel.slots[slot] = keep;
            }
        }

        // run outside the wheel lock; tasks may schedule or cancel
        for entry in due {
            if entry
                .state
                .compare_exchange(PENDING, EXPIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                (entry.task)();
            }
        }
    }
}
