//! Priority arbitration over a set of throttle observers.

use std::sync::mpsc;
use std::time::Instant;

use crate::cfg::ThrottleCfg;
use crate::clock::{Clock, SystemClock};
use crate::level::PriorityLevel;
use crate::metrics::{DurationRecorder, NoopRecorder};
use crate::observer::{ObserverContext, StateChangeNotifier, ThrottleObserver};
use crate::sink::LevelSink;

/// Receives every change of the applied level.
pub trait ThrottleListener: Send {
    fn on_throttle(&mut self, level: PriorityLevel);
}

impl<F> ThrottleListener for F
where
    F: FnMut(PriorityLevel) + Send,
{
    fn on_throttle(&mut self, level: PriorityLevel) {
        self(level)
    }
}

/// Returned by `ThrottleService::add_listener`; pass it back to remove.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Computes the effective priority level from its observers (or a manual
/// override) and applies it through a `LevelSink`.
///
/// Single-sequence: every method runs on the owner's thread. Observers on
/// other threads signal through their `StateChangeNotifier`, and the owner
/// picks up those signals with `run_pending`.
pub struct ThrottleService {
    context: ObserverContext,
    observers: Vec<Box<dyn ThrottleObserver>>,
    listeners: Vec<(ListenerId, Box<dyn ThrottleListener>)>,
    next_listener_id: u64,
    sink: Box<dyn LevelSink>,
    recorder: Box<dyn DurationRecorder>,
    clock: Box<dyn Clock>,
    notifier: StateChangeNotifier,
    pending: mpsc::Receiver<()>,
    level: PriorityLevel,
    enforced_level: PriorityLevel,
    last_effective_observer: Option<usize>,
    last_transition: Instant,
}

impl ThrottleService {
    pub fn new(context: ObserverContext, sink: Box<dyn LevelSink>) -> Self {
        let (notifier, pending) = StateChangeNotifier::channel();
        let clock: Box<dyn Clock> = Box::new(SystemClock);
        let last_transition = clock.now();
        Self {
            context,
            observers: Vec::new(),
            listeners: Vec::new(),
            next_listener_id: 0,
            sink,
            recorder: Box::new(NoopRecorder),
            clock,
            notifier,
            pending,
            level: PriorityLevel::Unknown,
            enforced_level: PriorityLevel::Unknown,
            last_effective_observer: None,
            last_transition,
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.last_transition = clock.now();
        self.clock = clock;
        self
    }

    pub fn with_recorder(mut self, recorder: Box<dyn DurationRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Applies the configured override right away.
    pub fn with_cfg(mut self, cfg: &ThrottleCfg) -> Self {
        self.set_enforced(cfg.enforced_level);
        self
    }

    pub fn context(&self) -> &ObserverContext {
        &self.context
    }

    pub fn level(&self) -> PriorityLevel {
        self.level
    }

    pub fn enforced_level(&self) -> PriorityLevel {
        self.enforced_level
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn observers(&self) -> impl Iterator<Item = &dyn ThrottleObserver> {
        self.observers.iter().map(|o| &**o)
    }

    /// Name of the observer that set the level during the last recompute.
    pub fn effective_observer(&self) -> Option<&str> {
        self.last_effective_observer
            .and_then(|idx| self.observers.get(idx))
            .map(|o| o.name())
    }

    pub fn add_listener(&mut self, listener: Box<dyn ThrottleListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    /// Register an observer. It is not started and the level is untouched.
    pub fn add_observer(&mut self, observer: Box<dyn ThrottleObserver>) {
        self.observers.push(observer);
    }

    pub fn start_observers(&mut self) {
        for observer in &mut self.observers {
            observer.start_observing(&self.context, self.notifier.clone());
        }
    }

    pub fn stop_observers(&mut self) {
        for observer in &mut self.observers {
            observer.stop_observing();
        }
    }

    /// Set or clear (`Unknown`) the manual override.
    pub fn set_enforced(&mut self, level: PriorityLevel) {
        if self.enforced_level == level {
            return;
        }
        self.enforced_level = level;
        self.on_observer_state_changed();
    }

    /// Drain queued observer notifications and recompute once if any arrived.
    ///
    /// Recompute reads live observer state, so one pass covers any number of
    /// queued signals. Returns how many were drained.
    pub fn run_pending(&mut self) -> usize {
        let drained = self.pending.try_iter().count();
        if drained > 0 {
            self.on_observer_state_changed();
        }
        drained
    }

    pub fn on_observer_state_changed(&mut self) {
        let mut max_level = PriorityLevel::Low;
        let mut effective_observer = None;

        if self.enforced_level.is_unknown() {
            for (idx, observer) in self.observers.iter().enumerate() {
                if !observer.active() {
                    continue;
                }
                tracing::debug!(
                    session = self.context.session_id(),
                    observer = %observer.debug_description(),
                    "active throttle observer"
                );
                // Ties go to the later observer.
                if observer.level() >= max_level {
                    max_level = observer.level();
                    effective_observer = Some(idx);
                }
            }
        } else {
            max_level = self.enforced_level;
            tracing::debug!(
                session = self.context.session_id(),
                level = %self.enforced_level,
                "throttle is enforced"
            );
        }

        if effective_observer != self.last_effective_observer {
            let now = self.clock.now();
            if let Some(prev) = self
                .last_effective_observer
                .and_then(|idx| self.observers.get(idx))
            {
                self.recorder
                    .record(prev.name(), now.saturating_duration_since(self.last_transition));
            }
            self.last_transition = now;
            self.last_effective_observer = effective_observer;
        }

        self.set_level(max_level);
    }

    fn set_level(&mut self, level: PriorityLevel) {
        if self.level == level {
            return;
        }
        tracing::info!(
            session = self.context.session_id(),
            from = %self.level,
            to = %level,
            "throttle level changed"
        );
        self.level = level;
        let effective = self
            .last_effective_observer
            .and_then(|idx| self.observers.get(idx))
            .map(|o| o.name());
        self.sink.apply_level_from(level, effective);
        for (_, listener) in &mut self.listeners {
            listener.on_throttle(level);
        }
    }

    /// Replace the whole observer set: stops the old ones, starts the new ones.
    pub fn set_observers_for_testing(&mut self, observers: Vec<Box<dyn ThrottleObserver>>) {
        self.stop_observers();
        self.observers = observers;
        self.last_effective_observer = None;
        self.start_observers();
    }

    /// Apply `level` directly, skipping arbitration.
    pub fn set_level_for_testing(&mut self, level: PriorityLevel) {
        self.set_level(level);
    }

    pub fn notify_observer_state_changed_for_testing(&mut self) {
        self.on_observer_state_changed();
    }
}

impl Drop for ThrottleService {
    fn drop(&mut self) {
        self.stop_observers();
    }
}

impl std::fmt::Debug for ThrottleService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleService")
            .field("context", &self.context)
            .field("observers", &self.observers.len())
            .field("listeners", &self.listeners.len())
            .field("level", &self.level)
            .field("enforced_level", &self.enforced_level)
            .field("effective_observer", &self.effective_observer())
            .finish()
    }
}
