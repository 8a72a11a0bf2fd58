//! throttle_arbiter_supervisor
//!
//! Outside-world facing orchestration layer for `throttle_arbiter_core`.
//!
//! Responsibilities:
//! - own one `ThrottleService` per session
//! - shard sessions by id (deterministic)
//! - feed activity signals to session observers via the adapter
//! - report applied levels back as `LevelChange` events
//!
//! Non-goals:
//! - no IO
//! - no async
//! - no arbitration logic (lives in core)

pub mod adapter;
pub mod supervisor;

pub use adapter::{
    SignalEvent,
    ObserverSpec,
    group_by_session,
};

pub use supervisor::{
    ThrottleSupervisor,
    SupervisorCfg,
    SupervisorError,
    SupervisorSnapshot,
    SessionSnapshot,
    RestoreStats,
    LevelChange,
};
