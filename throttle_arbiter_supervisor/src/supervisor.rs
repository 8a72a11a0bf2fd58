//! Sharded throttle supervisor.
//!
//! This crate is the outside-world facing orchestration layer around
//! `throttle_arbiter_core`:
//! - owns one `ThrottleService` per session
//! - routes `SignalEvent`s to the session's observers
//! - turns applied levels into `LevelChange` events for the caller
//!
//! No IO. No async. Each shard is one `Mutex`, so a session's recompute is a
//! single critical section and readers never see a half-applied level.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use throttle_arbiter_core::{
    Clock, DurationHistogram, DurationStats, LevelSink, ObserverContext, PriorityLevel,
    SignalHandle, SignalObserver, SystemClock, ThrottleCfg, ThrottleService,
};

use crate::adapter::{group_by_session, ObserverSpec, SignalEvent};

/// Output event: a session's applied level changed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelChange {
    pub session_id: String,
    pub level: PriorityLevel,
    /// Observer credited with the level when it was applied.
    pub effective_observer: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SupervisorCfg {
    #[serde(default = "default_shards")]
    pub shards: usize,
    /// Applied to every session at open.
    #[serde(default)]
    pub throttle: ThrottleCfg,
}

fn default_shards() -> usize {
    1
}

impl Default for SupervisorCfg {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            throttle: ThrottleCfg::default(),
        }
    }
}

impl SupervisorCfg {
    pub fn from_toml_str(s: &str) -> Result<Self, throttle_arbiter_core::ConfigError> {
        let mut cfg: Self = toml::from_str(s)?;
        cfg.throttle.apply_env_overrides()?;
        Ok(cfg)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("session already open: {0}")]
    SessionExists(String),
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("session {session} declares observer {observer} twice")]
    DuplicateObserver { session: String, observer: String },
}

/// Per-session persisted state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub enforced_level: PriorityLevel,
    /// Names of observers active at snapshot time, in registration order.
    pub active: Vec<String>,
}

/// Snapshot of supervisor state for storage-agnostic persistence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorSnapshot {
    /// Sorted by session id.
    pub sessions: Vec<(String, SessionSnapshot)>,
}

impl SupervisorSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// Counters returned by restore operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreStats {
    /// Sessions found and updated.
    pub applied: usize,
    /// Snapshot entries naming sessions that are not open.
    pub missing: usize,
}

type AppliedQueue = Arc<Mutex<Vec<(PriorityLevel, Option<String>)>>>;

/// Level sink shared with its session: queues levels until drained.
struct QueueSink {
    queue: AppliedQueue,
}

impl LevelSink for QueueSink {
    fn apply_level(&mut self, level: PriorityLevel) {
        self.apply_level_from(level, None);
    }

    fn apply_level_from(&mut self, level: PriorityLevel, effective_observer: Option<&str>) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((level, effective_observer.map(str::to_string)));
    }
}

struct Session {
    service: ThrottleService,
    signals: Vec<(String, SignalHandle)>,
    applied: AppliedQueue,
    histogram: DurationHistogram,
}

impl Session {
    fn signal(&self, observer: &str) -> Option<&SignalHandle> {
        self.signals
            .iter()
            .find(|(name, _)| name == observer)
            .map(|(_, h)| h)
    }

    fn drain(&mut self, session_id: &str, out: &mut Vec<LevelChange>) {
        self.service.run_pending();
        let applied = std::mem::take(&mut *self.applied.lock().unwrap_or_else(PoisonError::into_inner));
        out.extend(applied.into_iter().map(|(level, effective_observer)| LevelChange {
            session_id: session_id.to_string(),
            level,
            effective_observer,
        }));
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            enforced_level: self.service.enforced_level(),
            active: self
                .signals
                .iter()
                .filter(|(_, h)| h.is_active())
                .map(|(name, _)| name.clone())
                .collect(),
        }
    }
}

#[derive(Default)]
struct Shard {
    sessions: HashMap<String, Session>,
}

/// Deterministic FNV-1a hash (stable across runs).
fn fnv1a_u64(s: &str) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

fn shard_index(session_id: &str, shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    (fnv1a_u64(session_id) as usize) % shard_count
}

type ClockFactory = Box<dyn Fn() -> Box<dyn Clock> + Send + Sync>;

/// A sharded supervisor owning one `ThrottleService` per session.
///
/// `shards == 1` behaves like a single-threaded supervisor. More shards let
/// unrelated sessions be driven from different threads without contention.
pub struct ThrottleSupervisor {
    cfg: SupervisorCfg,
    shards: usize,
    state_shards: Vec<Mutex<Shard>>,
    clock_factory: ClockFactory,
}

impl ThrottleSupervisor {
    pub fn new(cfg: SupervisorCfg) -> Self {
        let shards = cfg.shards.max(1);
        let mut state_shards = Vec::with_capacity(shards);
        for _ in 0..shards {
            state_shards.push(Mutex::new(Shard::default()));
        }

        Self {
            cfg,
            shards,
            state_shards,
            clock_factory: Box::new(|| Box::new(SystemClock) as Box<dyn Clock>),
        }
    }

    /// Clock used by sessions opened after this call.
    pub fn set_clock_factory<F>(&mut self, factory: F)
    where
        F: Fn() -> Box<dyn Clock> + Send + Sync + 'static,
    {
        self.clock_factory = Box::new(factory);
    }

    pub fn shard_count(&self) -> usize {
        self.shards
    }

    fn shard(&self, session_id: &str) -> MutexGuard<'_, Shard> {
        self.state_shards[shard_index(session_id, self.shards)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session with the given observers and run its first arbitration.
    ///
    /// Observer names must be unique within the session.
    ///
    /// Returns the initial level change (the configured override, or `Low`).
    pub fn open_session(
        &self,
        session_id: &str,
        observers: &[ObserverSpec],
    ) -> Result<Vec<LevelChange>, SupervisorError> {
        let mut guard = self.shard(session_id);
        if guard.sessions.contains_key(session_id) {
            return Err(SupervisorError::SessionExists(session_id.to_string()));
        }
        let mut names = HashSet::with_capacity(observers.len());
        if let Some(dup) = observers.iter().find(|spec| !names.insert(spec.name.as_str())) {
            return Err(SupervisorError::DuplicateObserver {
                session: session_id.to_string(),
                observer: dup.name.clone(),
            });
        }

        let applied = Arc::new(Mutex::new(Vec::new()));
        let histogram = DurationHistogram::new();
        let mut service = ThrottleService::new(
            ObserverContext::new(session_id),
            Box::new(QueueSink {
                queue: Arc::clone(&applied),
            }),
        )
        .with_clock((self.clock_factory)())
        .with_recorder(Box::new(histogram.clone()));

        let mut signals = Vec::with_capacity(observers.len());
        for spec in observers {
            let (observer, handle) = SignalObserver::new(spec.name.clone(), spec.level);
            service.add_observer(Box::new(observer));
            signals.push((spec.name.clone(), handle));
        }
        service.start_observers();
        service.set_enforced(self.cfg.throttle.enforced_level);
        service.on_observer_state_changed();

        tracing::debug!(session = session_id, observers = observers.len(), "opened throttle session");

        let mut session = Session {
            service,
            signals,
            applied,
            histogram,
        };
        let mut out = Vec::new();
        session.drain(session_id, &mut out);
        guard.sessions.insert(session_id.to_string(), session);
        Ok(out)
    }

    /// Close a session, stopping its observers. Returns whether it existed.
    pub fn close_session(&self, session_id: &str) -> bool {
        self.shard(session_id).sessions.remove(session_id).is_some()
    }

    /// Sorted ids of all open sessions.
    pub fn session_ids(&self) -> Vec<String> {
        let mut out = Vec::new();
        for shard in &self.state_shards {
            let guard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            out.extend(guard.sessions.keys().cloned());
        }
        out.sort();
        out
    }

    pub fn level(&self, session_id: &str) -> Option<PriorityLevel> {
        self.shard(session_id)
            .sessions
            .get(session_id)
            .map(|s| s.service.level())
    }

    pub fn enforced_level(&self, session_id: &str) -> Option<PriorityLevel> {
        self.shard(session_id)
            .sessions
            .get(session_id)
            .map(|s| s.service.enforced_level())
    }

    pub fn effective_observer(&self, session_id: &str) -> Option<String> {
        self.shard(session_id)
            .sessions
            .get(session_id)
            .and_then(|s| s.service.effective_observer().map(str::to_string))
    }

    /// Duration histograms of one session.
    pub fn duration_stats(&self, session_id: &str) -> Option<BTreeMap<String, DurationStats>> {
        self.shard(session_id)
            .sessions
            .get(session_id)
            .map(|s| s.histogram.snapshot())
    }

    /// Set or clear a session's override. Returns the resulting change, if any.
    pub fn set_enforced(
        &self,
        session_id: &str,
        level: PriorityLevel,
    ) -> Result<Vec<LevelChange>, SupervisorError> {
        let mut guard = self.shard(session_id);
        let session = guard
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SupervisorError::UnknownSession(session_id.to_string()))?;
        session.service.set_enforced(level);
        let mut out = Vec::new();
        session.drain(session_id, &mut out);
        Ok(out)
    }

    /// Apply a batch of activity events and return the resulting level changes.
    ///
    /// Events apply in input order within a session. Output is sorted by
    /// session id. Events for unknown sessions or observers are skipped.
    pub fn ingest(&self, events: &[SignalEvent<'_>]) -> Vec<LevelChange> {
        let groups = group_by_session(events);

        // Group sessions by shard to lock each shard once.
        let mut shard_sessions: Vec<Vec<&str>> = vec![Vec::new(); self.shards];
        for session_id in groups.keys() {
            shard_sessions[shard_index(session_id, self.shards)].push(*session_id);
        }

        let mut out = Vec::new();
        for (shard_idx, sessions) in shard_sessions.into_iter().enumerate() {
            if sessions.is_empty() {
                continue;
            }
            let mut guard = self.state_shards[shard_idx]
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            for session_id in sessions {
                let Some(session) = guard.sessions.get_mut(session_id) else {
                    tracing::warn!(session = session_id, "dropping signals for unknown session");
                    continue;
                };
                for ev in &groups[session_id] {
                    match session.signal(&ev.observer) {
                        Some(handle) => {
                            handle.set_active(ev.active);
                        }
                        None => tracing::warn!(
                            session = session_id,
                            observer = %ev.observer,
                            "dropping signal for unknown observer"
                        ),
                    }
                }
                session.drain(session_id, &mut out);
            }
        }

        // Stable: keeps per-session order.
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }

    /// Drain level changes queued in every session (e.g. after a restore).
    pub fn drain_changes(&self) -> Vec<LevelChange> {
        let mut out = Vec::new();
        for shard in &self.state_shards {
            let mut guard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            for (id, session) in guard.sessions.iter_mut() {
                session.drain(id, &mut out);
            }
        }
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }

    /// Export per-session state. Deterministic ordering: sorted by session id.
    pub fn snapshot(&self) -> SupervisorSnapshot {
        self.snapshot_filtered(|_, _| true)
    }

    /// Export only sessions accepted by `predicate`.
    pub fn snapshot_filtered<F>(&self, mut predicate: F) -> SupervisorSnapshot
    where
        F: FnMut(&str, &SessionSnapshot) -> bool,
    {
        let mut out: Vec<(String, SessionSnapshot)> = Vec::new();

        // Lock shards in a stable order.
        for shard in &self.state_shards {
            let guard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            for (id, session) in guard.sessions.iter() {
                let snap = session.snapshot();
                if predicate(id, &snap) {
                    out.push((id.clone(), snap));
                }
            }
        }

        out.sort_by(|a, b| a.0.cmp(&b.0));
        SupervisorSnapshot { sessions: out }
    }

    pub fn snapshot_sessions(&self, session_ids: &[&str]) -> SupervisorSnapshot {
        let want: HashSet<&str> = session_ids.iter().copied().collect();
        self.snapshot_filtered(|id, _| want.contains(id))
    }

    /// Restore activity and overrides. Observers not listed as active are
    /// deactivated. Resulting level changes are queued; see `drain_changes`.
    pub fn restore(&self, snap: SupervisorSnapshot) -> RestoreStats {
        self.import(snap, false)
    }

    /// Like `restore`, but only activates listed observers and leaves the
    /// others untouched.
    pub fn restore_merge(&self, snap: SupervisorSnapshot) -> RestoreStats {
        self.import(snap, true)
    }

    fn import(&self, snap: SupervisorSnapshot, merge: bool) -> RestoreStats {
        let mut stats = RestoreStats::default();
        for (session_id, state) in snap.sessions {
            let mut guard = self.shard(&session_id);
            let Some(session) = guard.sessions.get_mut(&session_id) else {
                tracing::warn!(session = %session_id, "snapshot names a session that is not open");
                stats.missing += 1;
                continue;
            };

            for (name, handle) in &session.signals {
                let listed = state.active.iter().any(|a| a == name);
                if listed {
                    handle.set_active(true);
                } else if !merge {
                    handle.set_active(false);
                }
            }
            session.service.set_enforced(state.enforced_level);
            session.service.run_pending();
            stats.applied += 1;
        }
        stats
    }
}

impl std::fmt::Debug for ThrottleSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleSupervisor")
            .field("cfg", &self.cfg)
            .field("shards", &self.shards)
            .finish_non_exhaustive()
    }
}
