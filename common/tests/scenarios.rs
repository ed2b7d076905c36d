use std::{sync::Arc, thread};

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;

use coinbox_common::{
    Channel, CounterStore, FileStorage, MachineAction, MachineConfig, MachineEngine,
    MemoryStorage, PersistedState, PulseKind, ReportMode, RpcRequest, StateStorage,
    MACHINE_PIN_ON,
};

fn local(hour: u32) -> Option<DateTime<FixedOffset>> {
    Some(
        FixedOffset::west_opt(6 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 5, 14, hour, 5, 0)
            .unwrap(),
    )
}

fn engine_with<S: StateStorage>(storage: S) -> MachineEngine<S> {
    MachineEngine::new(&MachineConfig::default(), CounterStore::open(storage))
}

fn rpc(id: i64, method: &str, params: serde_json::Value) -> RpcRequest {
    RpcRequest {
        id,
        src: Some("ops-console".to_string()),
        method: method.to_string(),
        params,
    }
}

fn confirmations(actions: &[MachineAction]) -> Vec<serde_json::Value> {
    actions
        .iter()
        .filter_map(|action| match action {
            MachineAction::Publish {
                channel: Channel::Confirmation,
                payload,
            } => Some(payload.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn counters_set_changes_exactly_the_recognized_fields() {
    let storage = MemoryStorage::new();
    let mut engine = engine_with(storage.clone());
    engine.handle_request(&rpc(1, "Counters.Set", json!({"total_gift": 4, "init_bag": 10})));
    let before = engine.snapshot();

    let (response, actions) = engine.handle_request(&rpc(
        2,
        "Counters.Set",
        json!({"total_bag": 250.5, "init_gift": "x", "unexpected": true}),
    ));

    assert!(response.is_success());
    let after = engine.snapshot();
    assert_eq!(
        after,
        PersistedState {
            total_bag: 250.5,
            last_saved_at: after.last_saved_at,
            ..before
        }
    );
    assert_eq!(
        engine.counters().load().unwrap().total_bag,
        250.5,
        "change must be persisted before the confirmation"
    );
    assert_eq!(
        confirmations(&actions),
        vec![json!({
            "method": "Counters.Set",
            "total_bag": 250.5,
            "total_gift": 4.0,
            "init_bag": 10.0,
            "init_gift": 0.0,
        })]
    );
}

#[test]
fn counters_set_with_nothing_recognized_fails_without_side_effects() {
    let storage = MemoryStorage::new();
    let mut engine = engine_with(storage.clone());

    let (response, actions) =
        engine.handle_request(&rpc(5, "Counters.Set", json!({"bags": 3, "gifts": 1})));

    assert_eq!(response.error.map(|err| err.code), Some(400));
    assert!(actions.is_empty());
    assert_eq!(storage.writes(), 0);
}

#[test]
fn auto_schedule_at_ten_powers_machine_on() {
    let mut engine = engine_with(MemoryStorage::new());
    engine.handle_request(&rpc(1, "App.SetEnableAuto", json!({"enable_auto": true})));
    engine.handle_request(&rpc(2, "App.SetOnHour", json!({"on_hour": 9})));
    engine.handle_request(&rpc(3, "App.SetOffHour", json!({"off_hour": 22})));

    let actions = engine.schedule_tick(local(10));

    assert!(engine.machine_status().commanded_power);
    assert_eq!(
        actions,
        vec![
            MachineAction::DriveMachinePin(MACHINE_PIN_ON),
            MachineAction::Publish {
                channel: Channel::Status,
                payload: json!({"power_on_auto": true}),
            },
        ]
    );
}

#[test]
fn schedule_changes_wait_for_the_next_tick() {
    let mut engine = engine_with(MemoryStorage::new());
    engine.schedule_tick(local(10));
    assert!(engine.machine_status().commanded_power);

    let (_, actions) = engine.handle_request(&rpc(1, "App.SetOffHour", json!({"off_hour": 10})));

    assert!(!actions
        .iter()
        .any(|action| matches!(action, MachineAction::DriveMachinePin(_))));
    assert!(engine.machine_status().commanded_power);

    engine.schedule_tick(local(10));
    assert!(!engine.machine_status().commanded_power);
}

#[test]
fn repeated_on_hour_command_is_idempotent_but_confirmed_twice() {
    let storage = MemoryStorage::new();
    let mut engine = engine_with(storage.clone());

    let (_, first) = engine.handle_request(&rpc(1, "App.SetOnHour", json!({"on_hour": 9})));
    let state_after_first = engine.counters().load().unwrap();
    let (_, second) = engine.handle_request(&rpc(2, "App.SetOnHour", json!({"on_hour": 9})));
    let state_after_second = engine.counters().load().unwrap();

    assert_eq!(
        PersistedState {
            last_saved_at: None,
            ..state_after_first
        },
        PersistedState {
            last_saved_at: None,
            ..state_after_second
        }
    );
    let published: Vec<_> = confirmations(&first)
        .into_iter()
        .chain(confirmations(&second))
        .collect();
    assert_eq!(
        published,
        vec![
            json!({"method": "App.SetOnHour", "on_hour": 9}),
            json!({"method": "App.SetOnHour", "on_hour": 9}),
        ]
    );
}

#[test]
fn one_way_enable_auto_persists_and_confirms_only() {
    let storage = MemoryStorage::new();
    let mut engine = engine_with(storage.clone());

    let actions = engine
        .handle_one_way(br#"{"method":"App.SetEnableAuto","params":{"enable_auto":false}}"#);

    assert!(!engine.counters().load().unwrap().enable_auto);
    assert_eq!(
        actions,
        vec![MachineAction::Publish {
            channel: Channel::Confirmation,
            payload: json!({"method": "App.SetEnableAuto", "enable_auto": false}),
        }]
    );
}

#[test]
fn status_flip_publishes_exactly_once() {
    let mut engine = engine_with(MemoryStorage::new());

    assert!(engine.status_tick(false).is_empty());
    assert_eq!(
        engine.status_tick(true),
        vec![MachineAction::Publish {
            channel: Channel::Status,
            payload: json!({"machine_on": true}),
        }]
    );
    assert!(engine.status_tick(true).is_empty());
}

#[test]
fn file_backed_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("counts.json");

    let expected = {
        let mut engine = engine_with(FileStorage::new(&path));
        engine.handle_request(&rpc(1, "Counters.Set", json!({"total_bag": 77, "init_gift": 3})));
        engine.handle_one_way(br#"{"method":"App.SetOnHour","params":{"on_hour":6}}"#);
        engine.counters().increment_gift();
        engine.absorb_pulses();
        engine.snapshot()
    };

    let mut restarted = engine_with(FileStorage::new(&path));
    assert_eq!(restarted.snapshot(), expected);
    assert_eq!(restarted.snapshot().total_gift, 1.0);
}

#[test]
fn corrupt_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("counts.json");
    std::fs::write(&path, br#"{"total_bag": 12.0, "total_gi"#).unwrap();

    let mut engine = engine_with(FileStorage::new(&path));

    assert_eq!(engine.snapshot(), PersistedState::default());
}

#[test]
fn concurrent_pulses_are_never_lost() {
    let mut engine = engine_with(MemoryStorage::new());
    let pulses = engine.counters().pulse_counters();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let pulses = Arc::clone(&pulses);
            thread::spawn(move || {
                for _ in 0..5_000 {
                    pulses.record(PulseKind::Bag);
                }
            })
        })
        .collect();

    while workers.iter().any(|worker| !worker.is_finished()) {
        engine.absorb_pulses();
    }
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(engine.snapshot().total_bag, 20_000.0);
}

#[test]
fn overwrites_interleaved_with_pulses_keep_a_consistent_total() {
    let mut engine = engine_with(MemoryStorage::new());
    let pulses = engine.counters().pulse_counters();
    const PULSES: u64 = 5_000;

    let worker = {
        let pulses = Arc::clone(&pulses);
        thread::spawn(move || {
            for _ in 0..PULSES {
                pulses.record(PulseKind::Bag);
            }
        })
    };

    let mut last_set = 0.0;
    for round in 0..50 {
        last_set = 1_000_000.0 * f64::from(round + 1);
        engine.handle_one_way(
            format!(r#"{{"method":"Counters.Set","params":{{"total_bag":{last_set}}}}}"#)
                .as_bytes(),
        );
    }
    worker.join().unwrap();

    let total = engine.snapshot().total_bag;
    let after_last_set = total - last_set;
    assert!(
        (0.0..=PULSES as f64).contains(&after_last_set),
        "total {total} is not {last_set} plus the pulses recorded after it"
    );
    assert_eq!(after_last_set.fract(), 0.0);
}

#[test]
fn report_ticks_publish_on_the_report_channel() {
    let config = MachineConfig {
        report_mode: ReportMode::Always,
        ..MachineConfig::default()
    };
    let mut engine = MachineEngine::new(&config, CounterStore::open(MemoryStorage::new()));
    engine.counters().increment_bag();
    let now = Utc.with_ymd_and_hms(2026, 5, 14, 16, 0, 0).unwrap();

    let actions = engine.report_tick(now);

    let [MachineAction::Publish { channel, payload }] = actions.as_slice() else {
        panic!("expected one publish, got {actions:?}");
    };
    assert_eq!(*channel, Channel::Report);
    assert_eq!(payload["total_bag"], json!(1.0));
    assert_eq!(payload["time"], json!("2026-05-14T16:00:00Z"));
}
