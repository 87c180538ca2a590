//! Process-wide registry of live engine instances.
//!
//! Native trampolines installed into a script context only carry the
//! instance id. They resolve it here to reach the channel registry, the
//! scheduler and parked channel calls of the owning instance. An instance is
//! registered on creation and removed on dispose; lookups after that return
//! `None` so routing fails fast instead of hanging.

use crate::channels::{ChannelCallback, ChannelRegistry, ParkedCall};
use crate::platform::EngineKind;
use crate::scheduler::{Clock, Scheduler};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

/// Process-unique, monotonically increasing engine instance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Allocate the next id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine:{}", self.0)
    }
}

pub type SharedClock = Arc<dyn Clock>;

/// Host-side state of one engine instance, shared with its trampolines.
pub struct InstanceState {
    id: InstanceId,
    kind: EngineKind,
    channels: Mutex<ChannelRegistry>,
    scheduler: Mutex<Scheduler<SharedClock>>,
    parked: Mutex<Vec<ParkedCall>>,
    clock: SharedClock,
    inspectable: AtomicBool,
    next_call_id: AtomicU64,
}

impl InstanceState {
    #[must_use]
    pub fn new(kind: EngineKind, clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            id: InstanceId::next(),
            kind,
            channels: Mutex::new(ChannelRegistry::default()),
            scheduler: Mutex::new(Scheduler::with_clock(Arc::clone(&clock))),
            parked: Mutex::new(Vec::new()),
            clock,
            inspectable: AtomicBool::new(false),
            next_call_id: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub const fn id(&self) -> InstanceId {
        self.id
    }

    #[must_use]
    pub const fn kind(&self) -> EngineKind {
        self.kind
    }

    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn channels(&self) -> MutexGuard<'_, ChannelRegistry> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn scheduler(&self) -> MutexGuard<'_, Scheduler<SharedClock>> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn parked(&self) -> MutexGuard<'_, Vec<ParkedCall>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn channel(&self, name: &str) -> Option<ChannelCallback> {
        self.channels().get(name)
    }

    pub fn next_call_id(&self) -> u64 {
        self.next_call_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn set_inspectable(&self, enabled: bool) {
        self.inspectable.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_inspectable(&self) -> bool {
        self.inspectable.load(Ordering::Relaxed)
    }

    /// Drop every channel, timer and parked call.
    pub fn clear(&self) {
        self.channels().clear();
        self.scheduler().clear();
        self.parked().clear();
    }
}

impl fmt::Debug for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceState")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("channels", &self.channels().len())
            .field("parked", &self.parked().len())
            .finish_non_exhaustive()
    }
}

fn live() -> &'static Mutex<HashMap<InstanceId, Arc<InstanceState>>> {
    static LIVE: OnceLock<Mutex<HashMap<InstanceId, Arc<InstanceState>>>> = OnceLock::new();
    LIVE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn live_guard() -> MutexGuard<'static, HashMap<InstanceId, Arc<InstanceState>>> {
    live().lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn register(state: &Arc<InstanceState>) {
    live_guard().insert(state.id(), Arc::clone(state));
    tracing::debug!(
        event = "instance.register",
        instance = %state.id(),
        kind = %state.kind(),
        "Engine instance registered"
    );
}

/// Remove an instance; returns its state if it was still live.
pub fn deregister(id: InstanceId) -> Option<Arc<InstanceState>> {
    let removed = live_guard().remove(&id);
    tracing::debug!(
        event = "instance.deregister",
        instance = %id,
        was_live = removed.is_some(),
        "Engine instance deregistered"
    );
    removed
}

/// Deregister `state` and drop its channels, timers and parked calls.
pub fn retire(state: &InstanceState) {
    deregister(state.id());
    state.clear();
}

#[must_use]
pub fn lookup(id: InstanceId) -> Option<Arc<InstanceState>> {
    live_guard().get(&id).cloned()
}

#[must_use]
pub fn is_live(id: InstanceId) -> bool {
    live_guard().contains_key(&id)
}
