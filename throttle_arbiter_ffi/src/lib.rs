#![allow(clippy::missing_safety_doc)]

pub mod logging;
pub mod snapshot;

use std::ptr;

use throttle_arbiter_core::{PriorityLevel, ThrottleCfg};
use throttle_arbiter_supervisor::{
    LevelChange, ObserverSpec, SignalEvent, SupervisorCfg, SupervisorError, ThrottleSupervisor,
};

/// FFI ABI version for throttle_arbiter_ffi.
///
/// Bump this when any `#[repr(C)]` struct layout or exported function signature changes.
pub const THR_ARBITER_FFI_VERSION: u32 = 1;

pub const THR_OK: i32 = 0;
pub const THR_ERR_INVALID: i32 = -1;
pub const THR_ERR_SESSION_EXISTS: i32 = -11;
pub const THR_ERR_UNKNOWN_SESSION: i32 = -12;
pub const THR_ERR_LOGGING: i32 = -13;
pub const THR_ERR_DUPLICATE_OBSERVER: i32 = -14;

#[no_mangle]
pub extern "C" fn thr_arbiter_ffi_version() -> u32 {
    THR_ARBITER_FFI_VERSION
}

/// Opaque handle exposed over FFI.
#[repr(C)]
pub struct ThrArbiterSupervisor {
    inner: ThrottleSupervisor,
}

/// FFI string view (UTF-8 bytes).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ThrStr {
    pub ptr: *const u8,
    pub len: usize,
}

impl ThrStr {
    pub const NULL: ThrStr = ThrStr {
        ptr: ptr::null(),
        len: 0,
    };

    unsafe fn as_str<'a>(&self) -> Option<&'a str> {
        if self.ptr.is_null() {
            return None;
        }
        let bytes = std::slice::from_raw_parts(self.ptr, self.len);
        std::str::from_utf8(bytes).ok()
    }
}

/// Observer declaration for `thr_arbiter_open_session`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ThrObserverSpec {
    pub name: ThrStr,
    /// `PriorityLevel` code: 0 unknown, 1 low, 2 medium, 3 high, 4 critical.
    pub level: u8,
}

/// FFI input event.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ThrEvent {
    pub session_id: ThrStr,
    pub observer: ThrStr,
    pub active: u8,
}

/// Output level change.
/// Note: string fields point into the backing blob held by the change array.
#[repr(C)]
pub struct ThrChange {
    pub session_id: ThrStr,
    pub level: u8,
    /// Null when no observer is credited (enforced mode or nothing active).
    pub effective_observer: ThrStr,
}

/// Owned array returned over FFI.
#[repr(C)]
pub struct ThrChangeArray {
    pub changes_ptr: *mut ThrChange,
    pub changes_len: usize,

    // backing storage for strings (one blob) so pointers stay valid
    pub strings_ptr: *mut u8,
    pub strings_len: usize,
}

impl ThrChangeArray {
    pub const EMPTY: ThrChangeArray = ThrChangeArray {
        changes_ptr: ptr::null_mut(),
        changes_len: 0,
        strings_ptr: ptr::null_mut(),
        strings_len: 0,
    };
}

/// Owned byte buffer (for snapshot).
#[repr(C)]
pub struct ThrBytes {
    pub ptr: *mut u8,
    pub len: usize,
}

/// Restore result statistics (FFI-safe).
#[repr(C)]
pub struct ThrRestoreStats {
    pub applied: u32,
    pub missing: u32,
    pub rc: i32,
}

/// Supervisor cfg for FFI (keep it minimal).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ThrCfg {
    pub shards: u32,
    pub enforced_level: u8,
}

#[no_mangle]
pub extern "C" fn thr_arbiter_cfg_default() -> ThrCfg {
    let d = SupervisorCfg::default();
    ThrCfg {
        shards: d.shards as u32,
        enforced_level: d.throttle.enforced_level.as_u8(),
    }
}

fn cfg_from_ffi(c: ThrCfg) -> Option<SupervisorCfg> {
    let enforced_level = PriorityLevel::from_u8(c.enforced_level)?;
    Some(SupervisorCfg {
        shards: (c.shards as usize).max(1),
        throttle: ThrottleCfg { enforced_level },
    })
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn err_rc(e: &SupervisorError) -> i32 {
    match e {
        SupervisorError::SessionExists(_) => THR_ERR_SESSION_EXISTS,
        SupervisorError::UnknownSession(_) => THR_ERR_UNKNOWN_SESSION,
        SupervisorError::DuplicateObserver { .. } => THR_ERR_DUPLICATE_OBSERVER,
    }
}

/// Initialise `tracing` output for the host process.
///
/// `filter` uses `EnvFilter` syntax; `json != 0` selects JSON lines.
#[no_mangle]
pub unsafe extern "C" fn thr_arbiter_init_logging(filter: ThrStr, json: u8) -> i32 {
    let filter = filter.as_str().unwrap_or("info");
    match logging::init_logging(filter, json != 0) {
        Ok(()) => THR_OK,
        Err(logging::LoggingError::Filter(_)) => THR_ERR_INVALID,
        Err(logging::LoggingError::AlreadyInstalled) => THR_ERR_LOGGING,
    }
}

/// Create a new supervisor handle. Returns null if `enforced_level` is not a
/// valid level code.
///
/// This library does not spawn threads. Concurrent calls on one handle
/// serialize per shard via internal mutexes.
#[no_mangle]
pub extern "C" fn thr_arbiter_supervisor_new(cfg: ThrCfg) -> *mut ThrArbiterSupervisor {
    let Some(cfg) = cfg_from_ffi(cfg) else {
        tracing::warn!(enforced_level = cfg.enforced_level, "rejecting cfg with invalid level code");
        return ptr::null_mut();
    };
    let handle = ThrArbiterSupervisor {
        inner: ThrottleSupervisor::new(cfg),
    };
    Box::into_raw(Box::new(handle))
}

#[no_mangle]
pub unsafe extern "C" fn thr_arbiter_supervisor_free(h: *mut ThrArbiterSupervisor) {
    if !h.is_null() {
        drop(Box::from_raw(h));
    }
}

/// Open a session. On success the initial change is written to `out` (if
/// non-null; free it with `thr_arbiter_changes_free`).
#[no_mangle]
pub unsafe extern "C" fn thr_arbiter_open_session(
    h: *mut ThrArbiterSupervisor,
    session_id: ThrStr,
    specs_ptr: *const ThrObserverSpec,
    specs_len: usize,
    out: *mut ThrChangeArray,
) -> i32 {
    if h.is_null() {
        return THR_ERR_INVALID;
    }
    let Some(id) = session_id.as_str() else {
        return THR_ERR_INVALID;
    };
    let mut specs = Vec::with_capacity(specs_len);
    if !specs_ptr.is_null() && specs_len > 0 {
        for s in std::slice::from_raw_parts(specs_ptr, specs_len) {
            let (Some(name), Some(level)) = (s.name.as_str(), PriorityLevel::from_u8(s.level)) else {
                tracing::warn!(session = id, "rejecting malformed observer spec");
                return THR_ERR_INVALID;
            };
            specs.push(ObserverSpec::new(name, level));
        }
    }

    let handle = &*h;
    match handle.inner.open_session(id, &specs) {
        Ok(changes) => {
            write_changes(out, changes);
            THR_OK
        }
        Err(e) => err_rc(&e),
    }
}

/// Close a session. Returns 1 if it existed, 0 otherwise, negative on bad input.
#[no_mangle]
pub unsafe extern "C" fn thr_arbiter_close_session(h: *mut ThrArbiterSupervisor, session_id: ThrStr) -> i32 {
    if h.is_null() {
        return THR_ERR_INVALID;
    }
    let Some(id) = session_id.as_str() else {
        return THR_ERR_INVALID;
    };
    (&*h).inner.close_session(id) as i32
}

/// Current applied level code of a session, or `THR_ERR_UNKNOWN_SESSION`.
#[no_mangle]
pub unsafe extern "C" fn thr_arbiter_level(h: *mut ThrArbiterSupervisor, session_id: ThrStr) -> i32 {
    if h.is_null() {
        return THR_ERR_INVALID;
    }
    let Some(id) = session_id.as_str() else {
        return THR_ERR_INVALID;
    };
    match (&*h).inner.level(id) {
        Some(level) => level.as_u8() as i32,
        None => THR_ERR_UNKNOWN_SESSION,
    }
}

/// Set or clear (level 0) a session's override. Changes go to `out` if non-null.
#[no_mangle]
pub unsafe extern "C" fn thr_arbiter_set_enforced(
    h: *mut ThrArbiterSupervisor,
    session_id: ThrStr,
    level: u8,
    out: *mut ThrChangeArray,
) -> i32 {
    if h.is_null() {
        return THR_ERR_INVALID;
    }
    let (Some(id), Some(level)) = (session_id.as_str(), PriorityLevel::from_u8(level)) else {
        return THR_ERR_INVALID;
    };
    match (&*h).inner.set_enforced(id, level) {
        Ok(changes) => {
            write_changes(out, changes);
            THR_OK
        }
        Err(e) => err_rc(&e),
    }
}

/// Ingest events. Returns an owned change array (must be freed with `thr_arbiter_changes_free`).
#[no_mangle]
pub unsafe extern "C" fn thr_arbiter_ingest(
    h: *mut ThrArbiterSupervisor,
    events_ptr: *const ThrEvent,
    events_len: usize,
) -> ThrChangeArray {
    if h.is_null() || events_ptr.is_null() || events_len == 0 {
        return ThrChangeArray::EMPTY;
    }

    let handle = &*h;
    let events = std::slice::from_raw_parts(events_ptr, events_len);

    let mut rust_events: Vec<SignalEvent<'_>> = Vec::with_capacity(events_len);
    for e in events {
        let (Some(session_id), Some(observer)) = (e.session_id.as_str(), e.observer.as_str()) else {
            continue;
        };
        rust_events.push(SignalEvent::new(session_id, observer, e.active != 0));
    }

    build_change_array(handle.inner.ingest(&rust_events))
}

/// Drain changes queued by restores.
#[no_mangle]
pub unsafe extern "C" fn thr_arbiter_drain_changes(h: *mut ThrArbiterSupervisor) -> ThrChangeArray {
    if h.is_null() {
        return ThrChangeArray::EMPTY;
    }
    build_change_array((&*h).inner.drain_changes())
}

unsafe fn write_changes(out: *mut ThrChangeArray, changes: Vec<LevelChange>) {
    if !out.is_null() {
        out.write(build_change_array(changes));
    }
}

fn build_change_array(changes: Vec<LevelChange>) -> ThrChangeArray {
    if changes.is_empty() {
        return ThrChangeArray::EMPTY;
    }

    // Build a single backing blob for all strings.
    let mut strings: Vec<u8> = Vec::new();
    let mut out: Vec<ThrChange> = Vec::with_capacity(changes.len());
    let mut offsets: Vec<(usize, Option<usize>)> = Vec::with_capacity(changes.len());

    for c in changes {
        let sid_off = strings.len();
        strings.extend_from_slice(c.session_id.as_bytes());

        let (obs_off, obs_len) = match &c.effective_observer {
            Some(name) => {
                let off = strings.len();
                strings.extend_from_slice(name.as_bytes());
                (Some(off), name.len())
            }
            None => (None, 0),
        };
        offsets.push((sid_off, obs_off));

        out.push(ThrChange {
            // fixed up after we pin the backing string blob
            session_id: ThrStr {
                ptr: ptr::null(),
                len: c.session_id.len(),
            },
            level: c.level.as_u8(),
            effective_observer: ThrStr {
                ptr: ptr::null(),
                len: obs_len,
            },
        });
    }

    // Pin buffers and fix pointers
    let mut strings_box = strings.into_boxed_slice();
    let strings_ptr = strings_box.as_mut_ptr();
    let strings_len = strings_box.len();

    let mut out_box = out.into_boxed_slice();
    let changes_ptr = out_box.as_mut_ptr();
    let changes_len = out_box.len();

    for (ch, (sid_off, obs_off)) in out_box.iter_mut().zip(offsets) {
        // SAFETY: offsets were taken while filling `strings`, so they are in bounds.
        ch.session_id.ptr = unsafe { strings_ptr.add(sid_off) };
        if let Some(off) = obs_off {
            ch.effective_observer.ptr = unsafe { strings_ptr.add(off) };
        }
    }

    // Leak boxes to caller; freed by thr_arbiter_changes_free
    std::mem::forget(strings_box);
    std::mem::forget(out_box);

    ThrChangeArray {
        changes_ptr,
        changes_len,
        strings_ptr,
        strings_len,
    }
}

#[no_mangle]
pub unsafe extern "C" fn thr_arbiter_changes_free(arr: ThrChangeArray) {
    if !arr.changes_ptr.is_null() {
        let slice_ptr = std::ptr::slice_from_raw_parts_mut(arr.changes_ptr, arr.changes_len);
        drop(Box::from_raw(slice_ptr));
    }
    if !arr.strings_ptr.is_null() {
        let slice_ptr = std::ptr::slice_from_raw_parts_mut(arr.strings_ptr, arr.strings_len);
        drop(Box::from_raw(slice_ptr));
    }
}

/// Encode the supervisor state; see `snapshot` for the format.
#[no_mangle]
pub unsafe extern "C" fn thr_arbiter_snapshot(h: *mut ThrArbiterSupervisor) -> ThrBytes {
    if h.is_null() {
        return ThrBytes {
            ptr: ptr::null_mut(),
            len: 0,
        };
    }
    let buf = snapshot::encode(&(&*h).inner.snapshot());

    let mut boxed = buf.into_boxed_slice();
    let ptr = boxed.as_mut_ptr();
    let len = boxed.len();
    std::mem::forget(boxed);

    ThrBytes { ptr, len }
}

#[no_mangle]
pub unsafe extern "C" fn thr_arbiter_bytes_free(b: ThrBytes) {
    if !b.ptr.is_null() {
        let slice_ptr = std::ptr::slice_from_raw_parts_mut(b.ptr, b.len);
        drop(Box::from_raw(slice_ptr));
    }
}

/// Restore from snapshot bytes. `merge != 0` keeps observers the snapshot
/// does not list as active. `rc` is 0 on success, negative on decode errors.
#[no_mangle]
pub unsafe extern "C" fn thr_arbiter_restore(
    h: *mut ThrArbiterSupervisor,
    bytes: *const u8,
    len: usize,
    merge: u8,
) -> ThrRestoreStats {
    if h.is_null() || bytes.is_null() || len < snapshot::SNAP_HEADER_LEN {
        return ThrRestoreStats {
            applied: 0,
            missing: 0,
            rc: THR_ERR_INVALID,
        };
    }
    let data = std::slice::from_raw_parts(bytes, len);

    let snap = match snapshot::decode(data) {
        Ok(snap) => snap,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting snapshot");
            return ThrRestoreStats {
                applied: 0,
                missing: 0,
                rc: e.rc(),
            };
        }
    };

    let handle = &*h;
    let stats = if merge != 0 {
        handle.inner.restore_merge(snap)
    } else {
        handle.inner.restore(snap)
    };

    ThrRestoreStats {
        applied: saturating_u32(stats.applied),
        missing: saturating_u32(stats.missing),
        rc: THR_OK,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_counters_saturate() {
        assert_eq!(saturating_u32(7), 7);
        assert_eq!(saturating_u32(u32::MAX as usize), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(saturating_u32(u32::MAX as usize + 1), u32::MAX);
    }
}
