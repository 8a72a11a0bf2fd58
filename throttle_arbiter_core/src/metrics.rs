//! Duration diagnostics.
//!
//! Each time the effective observer changes, the arbiter reports how long the
//! previous one held that position.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Prefix of every histogram key produced by `DurationHistogram`.
pub const HISTOGRAM_PREFIX: &str = "CpuRestrictionDisabled.";

pub trait DurationRecorder: Send {
    fn record(&mut self, observer_name: &str, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRecorder;

impl DurationRecorder for NoopRecorder {
    fn record(&mut self, _observer_name: &str, _duration: Duration) {}
}

/// Aggregated samples for one histogram.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationStats {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl DurationStats {
    fn add(&mut self, d: Duration) {
        if self.count == 0 || d < self.min {
            self.min = d;
        }
        if d > self.max {
            self.max = d;
        }
        self.count += 1;
        self.total += d;
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        let nanos = self.total.as_nanos() / u128::from(self.count);
        Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }
}

/// In-memory recorder. Clones share the same histograms.
#[derive(Clone, Debug, Default)]
pub struct DurationHistogram {
    inner: Arc<Mutex<BTreeMap<String, DurationStats>>>,
}

impl DurationHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn histogram_name(observer_name: &str) -> String {
        format!("{HISTOGRAM_PREFIX}{observer_name}")
    }

    /// Stats for one observer, if it ever recorded a sample.
    pub fn stats_for(&self, observer_name: &str) -> Option<DurationStats> {
        self.lock().get(&Self::histogram_name(observer_name)).copied()
    }

    /// Sorted copy of all histograms.
    pub fn snapshot(&self) -> BTreeMap<String, DurationStats> {
        self.lock().clone()
    }

    pub fn total_samples(&self) -> u64 {
        self.lock().values().map(|s| s.count).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, DurationStats>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DurationRecorder for DurationHistogram {
    fn record(&mut self, observer_name: &str, duration: Duration) {
        tracing::debug!(observer = observer_name, ?duration, "recording effective observer duration");
        self.lock()
            .entry(Self::histogram_name(observer_name))
            .or_default()
            .add(duration);
    }
}
