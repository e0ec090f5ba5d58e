//! Timer scheduling
//!
//! All device work runs from [`TimerEvent`]s. Periodic ticks re-arm themselves
//! from their own handler; one-shot delays are a single `schedule`. The host
//! drives the queue by popping due events and handing them back to the device.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::protocol::RequestId;

/// Work items the device schedules for itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerEvent {
    /// Reconnect check while disconnected
    Supervise,
    /// Back-off elapsed after a transport failure
    Reconnect,
    /// Poll the transport for incoming bytes
    Read,
    /// Status polling and sending the next queued request
    Write,
    /// Response deadline for a request
    RequestTimeout(RequestId),
    /// Wall-clock bound on a park session
    ParkDeadline,
    /// Settle delay after the tool-change unwind
    ToolChangeSettle,
    /// Re-check whether the vacated slot reports ready
    ToolChangeWait,
}

/// Cancellable reference to a scheduled event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Host scheduler primitive consumed by the device
pub trait Scheduler: Send {
    /// Monotonic time
    fn now(&self) -> Instant;

    /// Schedule `event` to fire at `at`
    fn schedule(&mut self, at: Instant, event: TimerEvent) -> TimerHandle;

    /// Cancel a scheduled event; returns false when it already fired or was cancelled
    fn cancel(&mut self, handle: TimerHandle) -> bool;

    /// Earliest pending deadline
    fn next_deadline(&self) -> Option<Instant>;

    /// Remove and return the earliest event whose deadline has passed
    fn pop_due(&mut self) -> Option<TimerEvent>;

    /// Schedule `event` after `delay`
    fn schedule_in(&mut self, delay: Duration, event: TimerEvent) -> TimerHandle {
        let at = self.now() + delay;
        self.schedule(at, event)
    }
}

/// Source of monotonic time
pub trait Clock: Send {
    /// Current instant
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock following tokio's time source, so paused test time applies
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Manually advanced clock for deterministic tests
///
/// Clones share the same time, so a test can keep one handle while the
/// scheduler owns another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    offset_us: Arc<AtomicU64>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Clock frozen at the current instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset_us: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        self.offset_us
            .fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }

    /// Time elapsed since the clock was created
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.offset_us.load(Ordering::SeqCst))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }
}

/// Deadline-ordered timer queue
///
/// Events with equal deadlines fire in scheduling order.
#[derive(Debug)]
pub struct TimerQueue<C: Clock = SystemClock> {
    clock: C,
    next_seq: u64,
    entries: BTreeMap<(Instant, u64), TimerEvent>,
    deadlines: HashMap<u64, Instant>,
}

impl Default for TimerQueue<SystemClock> {
    fn default() -> Self {
        Self::new(SystemClock)
    }
}

impl<C: Clock> TimerQueue<C> {
    /// Empty queue reading time from `clock`
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            next_seq: 0,
            entries: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Number of scheduled events
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Nothing scheduled
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an event equal to `event` is scheduled
    pub fn contains(&self, event: TimerEvent) -> bool {
        self.entries.values().any(|e| *e == event)
    }

    /// Underlying clock
    pub fn clock(&self) -> &C {
        &self.clock
    }
}

impl<C: Clock> Scheduler for TimerQueue<C> {
    fn now(&self) -> Instant {
        self.clock.now()
    }

    fn schedule(&mut self, at: Instant, event: TimerEvent) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((at, seq), event);
        self.deadlines.insert(seq, at);
        TimerHandle(seq)
    }

    fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.deadlines.remove(&handle.0) {
            Some(at) => self.entries.remove(&(at, handle.0)).is_some(),
            None => false,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(at, _)| *at)
    }

    fn pop_due(&mut self) -> Option<TimerEvent> {
        let now = self.clock.now();
        let (&(at, seq), _) = self.entries.iter().next()?;
        if at > now {
            return None;
        }
        self.deadlines.remove(&seq);
        self.entries.remove(&(at, seq))
    }
}
