//! Per-instance job queue for engines whose event loop the host pumps.
//!
//! Script timers wait in a deadline index; once due they move into a FIFO of
//! macrotasks alongside completed channel calls. Microtasks belong to the
//! engine and never pass through here.
//!
//! Every queued item takes a stamp from one counter, so:
//!
//! - timers sharing a deadline fire in the order they were set
//! - a macrotask queued earlier is handed out earlier, whatever its kind
//! - `tick` hands out at most one macrotask

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Scheduling stamp. Strictly increasing per scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seq(u64);

impl Seq {
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a finished host channel call hands back to script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// JSON-encoded result; `None` when the callback returned nothing.
    Success(Option<String>),
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacrotaskKind {
    TimerFired { timer_id: u64 },
    ChannelComplete { call_id: u64, outcome: ChannelOutcome },
}

impl MacrotaskKind {
    const fn label(&self) -> &'static str {
        match self {
            Self::TimerFired { .. } => "timer",
            Self::ChannelComplete { .. } => "channel",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Macrotask {
    pub seq: Seq,
    pub kind: MacrotaskKind,
}

/// Time source for timers.
pub trait Clock: Send + Sync {
    /// Milliseconds on a monotonic scale.
    fn now_ms(&self) -> u64;

    /// Resolve once `ms` milliseconds have passed on this clock. Must not
    /// block the polling thread.
    fn sleep(&self, ms: u64) -> BoxFuture<'static, ()>;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn sleep(&self, ms: u64) -> BoxFuture<'static, ()> {
        (**self).sleep(ms)
    }
}

/// Monotonic real time, measured from the first read in this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now_ms(&self) -> u64 {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        let elapsed = EPOCH.get_or_init(Instant::now).elapsed().as_millis();
        u64::try_from(elapsed).unwrap_or(u64::MAX)
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn sleep(&self, ms: u64) -> BoxFuture<'static, ()> {
        async_io::Timer::after(Duration::from_millis(ms)).map(drop).boxed()
    }

    // The browser runs its own timers; nothing on wasm32 waits on this clock.
    #[cfg(target_arch = "wasm32")]
    fn sleep(&self, _ms: u64) -> BoxFuture<'static, ()> {
        future::ready(()).boxed()
    }
}

/// Manually driven clock for tests. Sleeping jumps forward and resolves
/// immediately.
#[derive(Debug)]
pub struct DeterministicClock {
    now: AtomicU64,
}

impl DeterministicClock {
    #[must_use]
    pub const fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for DeterministicClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, ms: u64) -> BoxFuture<'static, ()> {
        self.advance(ms);
        future::ready(()).boxed()
    }
}

pub struct Scheduler<C: Clock = WallClock> {
    clock: C,
    next_seq: u64,
    next_timer_id: u64,
    /// `(deadline, seq) -> timer id`, iterated in firing order.
    timers: BTreeMap<(u64, Seq), u64>,
    /// `timer id -> key in timers`, for cancellation.
    timer_keys: HashMap<u64, (u64, Seq)>,
    ready: VecDeque<Macrotask>,
}

impl Scheduler<WallClock> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(WallClock)
    }
}

impl Default for Scheduler<WallClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Scheduler<C> {
    #[must_use]
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            next_seq: 0,
            next_timer_id: 1,
            timers: BTreeMap::new(),
            timer_keys: HashMap::new(),
            ready: VecDeque::new(),
        }
    }

    fn stamp(&mut self) -> Seq {
        let seq = Seq(self.next_seq);
        self.next_seq += 1;
        seq
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// True while a timer is armed or a macrotask is waiting.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.ready.is_empty() || !self.timers.is_empty()
    }

    #[must_use]
    pub fn macrotask_count(&self) -> usize {
        self.ready.len()
    }

    /// Armed timers, not counting ones that already fired or were cleared.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Arm a timer `delay_ms` from now and return its id. Ids start at 1 and
    /// are never reused.
    pub fn set_timeout(&mut self, delay_ms: u64) -> u64 {
        let timer_id = self.next_timer_id;
        self.next_timer_id += 1;
        let key = (self.clock.now_ms().saturating_add(delay_ms), self.stamp());
        self.timers.insert(key, timer_id);
        self.timer_keys.insert(timer_id, key);
        tracing::trace!(
            event = "scheduler.timer.set",
            timer_id,
            delay_ms,
            deadline_ms = key.0,
            seq = %key.1,
            "Timer armed"
        );
        timer_id
    }

    /// Disarm a timer. Returns false when it is unknown, already fired, or
    /// already cleared.
    pub fn clear_timeout(&mut self, timer_id: u64) -> bool {
        let removed = self
            .timer_keys
            .remove(&timer_id)
            .is_some_and(|key| self.timers.remove(&key).is_some());
        tracing::trace!(event = "scheduler.timer.clear", timer_id, removed, "Timer cleared");
        removed
    }

    pub fn enqueue_channel_complete(&mut self, call_id: u64, outcome: ChannelOutcome) {
        let seq = self.stamp();
        tracing::trace!(
            event = "scheduler.channel.enqueue",
            call_id,
            %seq,
            "Channel completion queued"
        );
        self.ready.push_back(Macrotask {
            seq,
            kind: MacrotaskKind::ChannelComplete { call_id, outcome },
        });
    }

    /// Queue every timer whose deadline has passed, earliest first.
    fn promote_due_timers(&mut self) {
        let now = self.clock.now_ms();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let timer_id = entry.remove();
            self.timer_keys.remove(&timer_id);
            let seq = self.stamp();
            self.ready.push_back(Macrotask {
                seq,
                kind: MacrotaskKind::TimerFired { timer_id },
            });
            tracing::trace!(event = "scheduler.timer.due", timer_id, now_ms = now, %seq, "Timer due");
        }
    }

    /// Promote due timers, then hand out the oldest macrotask.
    pub fn tick(&mut self) -> Option<Macrotask> {
        self.promote_due_timers();
        let task = self.ready.pop_front();
        if let Some(task) = &task {
            tracing::debug!(
                event = "scheduler.tick",
                seq = %task.seq,
                kind = task.kind.label(),
                "Handing out macrotask"
            );
        }
        task
    }

    #[must_use]
    pub fn next_timer_deadline(&self) -> Option<u64> {
        self.timers.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Milliseconds until the earliest armed timer; 0 when one is overdue.
    #[must_use]
    pub fn time_until_next_timer(&self) -> Option<u64> {
        self.next_timer_deadline()
            .map(|deadline| deadline.saturating_sub(self.clock.now_ms()))
    }

    /// Drop every timer and queued macrotask. Ids and stamps keep counting.
    pub fn clear(&mut self) {
        tracing::trace!(
            event = "scheduler.clear",
            dropped_tasks = self.ready.len(),
            dropped_timers = self.timers.len(),
            "Scheduler cleared"
        );
        self.ready.clear();
        self.timers.clear();
        self.timer_keys.clear();
    }
}

impl<C: Clock> fmt::Debug for Scheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("now_ms", &self.clock.now_ms())
            .field("timers", &self.timers.len())
            .field("ready", &self.ready.len())
            .field("next_timer_id", &self.next_timer_id)
            .finish_non_exhaustive()
    }
}
