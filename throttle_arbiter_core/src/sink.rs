use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::level::PriorityLevel;

/// Applies an effective level to the surrounding system.
///
/// Calls must be idempotent: applying the same level twice is harmless, even
/// though the arbiter only calls on change.
pub trait LevelSink: Send {
    fn apply_level(&mut self, level: PriorityLevel);

    /// Like `apply_level`, with the observer credited for `level` (none in
    /// enforced mode or when nothing is active).
    fn apply_level_from(&mut self, level: PriorityLevel, _effective_observer: Option<&str>) {
        self.apply_level(level)
    }
}

impl<F> LevelSink for F
where
    F: FnMut(PriorityLevel) + Send,
{
    fn apply_level(&mut self, level: PriorityLevel) {
        self(level)
    }
}

/// CPU scheduling state for a throttled instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuRestriction {
    /// Full CPU share.
    Foreground,
    /// Restricted to background share.
    Background,
}

impl CpuRestriction {
    /// Only `Low` restricts; any higher tier lifts the restriction.
    pub fn for_level(level: PriorityLevel) -> Option<Self> {
        match level {
            PriorityLevel::Unknown => None,
            PriorityLevel::Low => Some(Self::Background),
            PriorityLevel::Medium | PriorityLevel::High | PriorityLevel::Critical => {
                Some(Self::Foreground)
            }
        }
    }
}

/// Sink that translates levels into CPU restriction changes.
pub struct CpuRestrictionSink<F> {
    apply: F,
    last: Option<CpuRestriction>,
}

impl<F> CpuRestrictionSink<F>
where
    F: FnMut(CpuRestriction) + Send,
{
    pub fn new(apply: F) -> Self {
        Self { apply, last: None }
    }

    pub fn current(&self) -> Option<CpuRestriction> {
        self.last
    }
}

impl<F> LevelSink for CpuRestrictionSink<F>
where
    F: FnMut(CpuRestriction) + Send,
{
    fn apply_level(&mut self, level: PriorityLevel) {
        let Some(restriction) = CpuRestriction::for_level(level) else {
            tracing::warn!(%level, "ignoring cpu restriction for unknown level");
            return;
        };
        tracing::debug!(%level, ?restriction, "applying cpu restriction");
        self.last = Some(restriction);
        (self.apply)(restriction);
    }
}

/// Sink recording every applied level. Clones share the same record.
#[derive(Clone, Debug, Default)]
pub struct RecordingSink {
    applied: Arc<Mutex<Vec<PriorityLevel>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Vec<PriorityLevel> {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<PriorityLevel> {
        std::mem::take(&mut *self.applied.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl LevelSink for RecordingSink {
    fn apply_level(&mut self, level: PriorityLevel) {
        self.applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_restriction_mapping() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let out = Arc::clone(&seen);
        let mut sink = CpuRestrictionSink::new(move |r: CpuRestriction| out.lock().unwrap().push(r));

        sink.apply_level(PriorityLevel::Low);
        sink.apply_level(PriorityLevel::High);
        sink.apply_level(PriorityLevel::Unknown);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![CpuRestriction::Background, CpuRestriction::Foreground]
        );
        assert_eq!(sink.current(), Some(CpuRestriction::Foreground));
    }
}
