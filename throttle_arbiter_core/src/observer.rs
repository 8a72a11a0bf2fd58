//! Observer contract.
//!
//! An observer reports whether some condition is currently active and which
//! priority tier it asks for while it is. Observers are owned by a
//! `ThrottleService`; they tell it about state changes through a
//! `StateChangeNotifier`, which queues the change until the owning sequence
//! drains it with `ThrottleService::run_pending`.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};

use crate::level::PriorityLevel;

/// Opaque handle identifying the session an observer watches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ObserverContext {
    session_id: String,
}

impl ObserverContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Cloneable, thread-safe "my state changed" signal.
///
/// Sends never block. If the receiving service is gone the signal is dropped.
#[derive(Clone, Debug)]
pub struct StateChangeNotifier {
    tx: mpsc::Sender<()>,
}

impl StateChangeNotifier {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    pub fn notify(&self) {
        let _ = self.tx.send(());
    }
}

/// Capability set the arbiter needs from an observer.
pub trait ThrottleObserver: Send {
    /// Label used for logs and duration histograms.
    fn name(&self) -> &str;

    /// Tier requested while active.
    fn level(&self) -> PriorityLevel;

    fn active(&self) -> bool;

    fn debug_description(&self) -> String {
        format!(
            "ThrottleObserver({}, {}, active={})",
            self.name(),
            self.level(),
            self.active()
        )
    }

    /// Begin watching. `notifier` must be signalled on every change of
    /// `active()` (or `level()`) from now until `stop_observing`.
    fn start_observing(&mut self, context: &ObserverContext, notifier: StateChangeNotifier);

    fn stop_observing(&mut self);
}

#[derive(Debug, Default)]
struct SignalState {
    active: bool,
    notifier: Option<StateChangeNotifier>,
}

/// Observer whose activity is driven from outside through a `SignalHandle`.
///
/// The requested level is fixed at construction.
#[derive(Debug)]
pub struct SignalObserver {
    name: String,
    level: PriorityLevel,
    state: Arc<Mutex<SignalState>>,
}

/// Remote control for a `SignalObserver`. Safe to move to other threads.
#[derive(Clone, Debug)]
pub struct SignalHandle {
    state: Arc<Mutex<SignalState>>,
}

impl SignalObserver {
    pub fn new(name: impl Into<String>, level: PriorityLevel) -> (Self, SignalHandle) {
        let state = Arc::new(Mutex::new(SignalState::default()));
        let handle = SignalHandle {
            state: Arc::clone(&state),
        };
        (
            Self {
                name: name.into(),
                level,
                state,
            },
            handle,
        )
    }

    pub fn is_observing(&self) -> bool {
        lock(&self.state).notifier.is_some()
    }
}

impl ThrottleObserver for SignalObserver {
    fn name(&self) -> &str {
        &self.name
    }

    fn level(&self) -> PriorityLevel {
        self.level
    }

    fn active(&self) -> bool {
        lock(&self.state).active
    }

    fn start_observing(&mut self, _context: &ObserverContext, notifier: StateChangeNotifier) {
        lock(&self.state).notifier = Some(notifier);
    }

    fn stop_observing(&mut self) {
        lock(&self.state).notifier = None;
    }
}

impl SignalHandle {
    /// Update the activity flag. Notifies the owning service only when the flag
    /// actually changes and the observer is started. Returns whether it changed.
    pub fn set_active(&self, active: bool) -> bool {
        let notifier = {
            let mut st = lock(&self.state);
            if st.active == active {
                return false;
            }
            st.active = active;
            st.notifier.clone()
        };
        if let Some(n) = notifier {
            n.notify();
        }
        true
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).active
    }
}

fn lock(state: &Mutex<SignalState>) -> std::sync::MutexGuard<'_, SignalState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_active_notifies_only_on_change_while_started() {
        let (mut obs, handle) = SignalObserver::new("media", PriorityLevel::High);
        let (notifier, rx) = StateChangeNotifier::channel();

        // Not started yet: state changes, no notification.
        assert!(handle.set_active(true));
        assert!(rx.try_recv().is_err());
        assert!(obs.active());

        obs.start_observing(&ObserverContext::new("s"), notifier);
        assert!(!handle.set_active(true));
        assert!(rx.try_recv().is_err());

        assert!(handle.set_active(false));
        assert!(rx.try_recv().is_ok());

        obs.stop_observing();
        assert!(handle.set_active(true));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn debug_description_format() {
        let (obs, _h) = SignalObserver::new("download", PriorityLevel::Medium);
        assert_eq!(
            obs.debug_description(),
            "ThrottleObserver(download, medium, active=false)"
        );
    }
}
