use std::sync::Arc;
use std::time::Duration;

use throttle_arbiter_core::{Clock, ManualClock, PriorityLevel};
use throttle_arbiter_supervisor::*;

fn specs() -> Vec<ObserverSpec> {
    vec![
        ObserverSpec::new("media", PriorityLevel::High),
        ObserverSpec::new("download", PriorityLevel::Medium),
        ObserverSpec::new("boot", PriorityLevel::Critical),
    ]
}

fn supervisor(shards: usize) -> ThrottleSupervisor {
    ThrottleSupervisor::new(SupervisorCfg {
        shards,
        ..SupervisorCfg::default()
    })
}

#[test]
fn open_session_applies_initial_low() {
    let sup = supervisor(1);
    let changes = sup.open_session("s1", &specs()).unwrap();
    assert_eq!(
        changes,
        vec![LevelChange {
            session_id: "s1".to_string(),
            level: PriorityLevel::Low,
            effective_observer: None,
        }]
    );
    assert_eq!(sup.level("s1"), Some(PriorityLevel::Low));
    assert_eq!(
        sup.open_session("s1", &specs()),
        Err(SupervisorError::SessionExists("s1".to_string()))
    );
}

#[test]
fn configured_override_applies_at_open() {
    let cfg = SupervisorCfg::from_toml_str(
        r#"
        shards = 2

        [throttle]
        enforced_level = "critical"
        "#,
    )
    .unwrap();
    assert_eq!(cfg.shards, 2);

    let sup = ThrottleSupervisor::new(cfg);
    let changes = sup.open_session("s1", &specs()).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].level, PriorityLevel::Critical);
    assert_eq!(sup.enforced_level("s1"), Some(PriorityLevel::Critical));
}

#[test]
fn ingest_routes_signals_and_sorts_output() {
    let sup = supervisor(4);
    sup.open_session("b", &specs()).unwrap();
    sup.open_session("a", &specs()).unwrap();

    let changes = sup.ingest(&[
        SignalEvent::activated("b", "download"),
        SignalEvent::activated("a", "media"),
        SignalEvent::activated("b", "media"),
    ]);

    assert_eq!(
        changes,
        vec![
            LevelChange {
                session_id: "a".to_string(),
                level: PriorityLevel::High,
                effective_observer: Some("media".to_string()),
            },
            LevelChange {
                session_id: "b".to_string(),
                level: PriorityLevel::High,
                effective_observer: Some("media".to_string()),
            },
        ]
    );

    // Same state again: nothing changes.
    assert!(sup.ingest(&[SignalEvent::activated("a", "media")]).is_empty());

    let changes = sup.ingest(&[SignalEvent::deactivated("b", "media")]);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].level, PriorityLevel::Medium);
    assert_eq!(sup.effective_observer("b"), Some("download".to_string()));
}

#[test]
fn unknown_sessions_and_observers_are_skipped() {
    let sup = supervisor(2);
    sup.open_session("s1", &specs()).unwrap();

    let changes = sup.ingest(&[
        SignalEvent::activated("ghost", "media"),
        SignalEvent::activated("s1", "camera"),
    ]);
    assert!(changes.is_empty());
    assert_eq!(sup.level("s1"), Some(PriorityLevel::Low));
    assert_eq!(sup.level("ghost"), None);
}

#[test]
fn set_enforced_reports_change() {
    let sup = supervisor(1);
    sup.open_session("s1", &specs()).unwrap();
    sup.ingest(&[SignalEvent::activated("s1", "media")]);

    let changes = sup.set_enforced("s1", PriorityLevel::Low).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].level, PriorityLevel::Low);
    assert_eq!(changes[0].effective_observer, None);

    assert!(sup.set_enforced("s1", PriorityLevel::Low).unwrap().is_empty());

    let changes = sup.set_enforced("s1", PriorityLevel::Unknown).unwrap();
    assert_eq!(changes[0].level, PriorityLevel::High);

    assert_eq!(
        sup.set_enforced("nope", PriorityLevel::High),
        Err(SupervisorError::UnknownSession("nope".to_string()))
    );
}

#[test]
fn close_session_forgets_state() {
    let sup = supervisor(1);
    sup.open_session("s1", &specs()).unwrap();
    assert_eq!(sup.session_ids(), vec!["s1".to_string()]);
    assert!(sup.close_session("s1"));
    assert!(!sup.close_session("s1"));
    assert!(sup.session_ids().is_empty());
    assert!(sup.open_session("s1", &specs()).is_ok());
}

#[test]
fn snapshot_restore_roundtrip_through_json() {
    let sup = supervisor(3);
    sup.open_session("s1", &specs()).unwrap();
    sup.open_session("s2", &specs()).unwrap();
    sup.ingest(&[
        SignalEvent::activated("s1", "download"),
        SignalEvent::activated("s1", "media"),
    ]);
    sup.set_enforced("s2", PriorityLevel::Medium).unwrap();

    let snap = sup.snapshot();
    assert_eq!(snap.sessions.len(), 2);
    assert_eq!(snap.sessions[0].0, "s1");
    assert_eq!(
        snap.sessions[0].1.active,
        vec!["media".to_string(), "download".to_string()]
    );
    let json = snap.to_json().unwrap();

    let fresh = supervisor(1);
    fresh.open_session("s1", &specs()).unwrap();
    fresh.open_session("s2", &specs()).unwrap();
    fresh.ingest(&[SignalEvent::activated("s1", "boot")]);

    let stats = fresh.restore(SupervisorSnapshot::from_json(&json).unwrap());
    assert_eq!(stats, RestoreStats { applied: 2, missing: 0 });
    assert_eq!(fresh.level("s1"), Some(PriorityLevel::High));
    assert_eq!(fresh.level("s2"), Some(PriorityLevel::Medium));
    assert_eq!(fresh.snapshot(), snap);

    let drained = fresh.drain_changes();
    let levels: Vec<_> = drained.iter().map(|c| (c.session_id.as_str(), c.level)).collect();
    assert_eq!(
        levels,
        vec![("s1", PriorityLevel::High), ("s2", PriorityLevel::Medium)]
    );
    assert!(fresh.drain_changes().is_empty());
}

#[test]
fn restore_merge_keeps_unlisted_activity() {
    let sup = supervisor(1);
    sup.open_session("s1", &specs()).unwrap();
    sup.ingest(&[SignalEvent::activated("s1", "boot")]);

    let snap = SupervisorSnapshot {
        sessions: vec![
            (
                "s1".to_string(),
                SessionSnapshot {
                    enforced_level: PriorityLevel::Unknown,
                    active: vec!["download".to_string()],
                },
            ),
            ("gone".to_string(), SessionSnapshot::default()),
        ],
    };

    let stats = sup.restore_merge(snap.clone());
    assert_eq!(stats, RestoreStats { applied: 1, missing: 1 });
    assert_eq!(sup.level("s1"), Some(PriorityLevel::Critical));

    sup.restore(snap);
    assert_eq!(sup.level("s1"), Some(PriorityLevel::Medium));
}

#[test]
fn queued_changes_keep_the_observer_credited_when_applied() {
    let sup = supervisor(1);
    sup.open_session("s1", &specs()).unwrap();

    let session = |enforced_level, active: &[&str]| SupervisorSnapshot {
        sessions: vec![(
            "s1".to_string(),
            SessionSnapshot {
                enforced_level,
                active: active.iter().map(|a| a.to_string()).collect(),
            },
        )],
    };
    sup.restore(session(PriorityLevel::Medium, &[]));
    sup.restore(session(PriorityLevel::Unknown, &["media"]));

    assert_eq!(
        sup.drain_changes(),
        vec![
            LevelChange {
                session_id: "s1".to_string(),
                level: PriorityLevel::Medium,
                effective_observer: None,
            },
            LevelChange {
                session_id: "s1".to_string(),
                level: PriorityLevel::High,
                effective_observer: Some("media".to_string()),
            },
        ]
    );
}

#[test]
fn duplicate_observer_names_are_rejected() {
    let sup = supervisor(1);
    let dup = [
        ObserverSpec::new("media", PriorityLevel::High),
        ObserverSpec::new("media", PriorityLevel::Low),
    ];
    assert_eq!(
        sup.open_session("s1", &dup),
        Err(SupervisorError::DuplicateObserver {
            session: "s1".to_string(),
            observer: "media".to_string(),
        })
    );
    assert!(sup.session_ids().is_empty());
}

#[test]
fn snapshot_sessions_filters_by_id() {
    let sup = supervisor(2);
    for id in ["x", "y", "z"] {
        sup.open_session(id, &specs()).unwrap();
    }
    let snap = sup.snapshot_sessions(&["z", "x"]);
    let ids: Vec<_> = snap.sessions.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["x", "z"]);
}

#[test]
fn duration_stats_track_effective_observer_changes() {
    let clock = ManualClock::new();
    let mut sup = supervisor(1);
    let shared = clock.clone();
    sup.set_clock_factory(move || Box::new(shared.clone()) as Box<dyn Clock>);
    sup.open_session("s1", &specs()).unwrap();

    sup.ingest(&[SignalEvent::activated("s1", "media")]);
    clock.advance(Duration::from_secs(30));
    sup.ingest(&[
        SignalEvent::deactivated("s1", "media"),
        SignalEvent::activated("s1", "download"),
    ]);

    let stats = sup.duration_stats("s1").unwrap();
    assert_eq!(stats.len(), 1);
    let media = stats["CpuRestrictionDisabled.media"];
    assert_eq!(media.count, 1);
    assert_eq!(media.total, Duration::from_secs(30));
}

#[test]
fn sessions_can_be_driven_from_many_threads() {
    let sup = Arc::new(supervisor(4));
    let ids: Vec<String> = (0..8).map(|i| format!("session-{i}")).collect();
    for id in &ids {
        sup.open_session(id, &specs()).unwrap();
    }

    let workers: Vec<_> = ids
        .iter()
        .cloned()
        .map(|id| {
            let sup = Arc::clone(&sup);
            std::thread::spawn(move || {
                let mut changes = Vec::new();
                for _ in 0..50 {
                    changes.extend(sup.ingest(&[SignalEvent::activated(id.as_str(), "boot")]));
                    changes.extend(sup.ingest(&[SignalEvent::deactivated(id.as_str(), "boot")]));
                }
                changes.len()
            })
        })
        .collect();

    for w in workers {
        assert_eq!(w.join().unwrap(), 100);
    }
    for id in &ids {
        assert_eq!(sup.level(id), Some(PriorityLevel::Low));
    }
}
