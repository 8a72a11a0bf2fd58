pub mod level;
pub mod observer;
pub mod sink;

pub mod metrics;
pub mod clock;
pub mod cfg;
pub mod arbiter;

pub use level::{PriorityLevel, ParseLevelError};
pub use observer::{ObserverContext, StateChangeNotifier, ThrottleObserver, SignalObserver, SignalHandle};
pub use sink::{LevelSink, CpuRestriction, CpuRestrictionSink, RecordingSink};

pub use metrics::{DurationRecorder, DurationHistogram, DurationStats, NoopRecorder};
pub use clock::{Clock, SystemClock, ManualClock};
pub use cfg::{ThrottleCfg, ConfigError};
pub use arbiter::{ThrottleService, ThrottleListener, ListenerId};
