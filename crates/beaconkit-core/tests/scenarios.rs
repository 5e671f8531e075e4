//! End-to-end behaviour of the beacon event pipeline.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use beaconkit_core::{
    ActionDispatcher, BeaconEvent, BeaconId, BeaconIndex, BeaconKitError, ConditionRegistry, ConfigError,
    DispatchCompletion, EngineConfig, EngineOutcome, EventType, FireDecision, Orchestrator, Proximity, RangedSample,
    Reading, ScheduleError, TriggerEngine, ZoneSet,
};
use serde_json::json;
use uuid::Uuid;

const UUID: &str = "f7826da6-4fa2-4e98-8024-bc5b71e0893e";

#[derive(Default)]
struct Recorder {
    decisions: Mutex<Vec<FireDecision>>,
}

impl Recorder {
    fn events(&self) -> Vec<(String, EventType)> {
        self.decisions
            .lock()
            .unwrap()
            .iter()
            .map(|d| (d.trigger.clone(), d.event))
            .collect()
    }
}

impl ActionDispatcher for Recorder {
    fn dispatch(&self, decision: FireDecision, completion: DispatchCompletion) {
        self.decisions.lock().unwrap().push(decision);
        completion.succeed();
    }
}

/// Drops every completion handle unanswered.
struct Forgetful;

impl ActionDispatcher for Forgetful {
    fn dispatch(&self, _decision: FireDecision, _completion: DispatchCompletion) {}
}

fn beacon() -> BeaconId {
    BeaconId::new(Uuid::parse_str(UUID).unwrap(), 1, 1)
}

fn zones(triggers: serde_json::Value) -> ZoneSet {
    let doc = json!({
        "id": "site",
        "beacons": [{ "proximity_uuid": UUID, "major": 1, "minor": 1, "triggers": triggers }]
    });
    ZoneSet::from_json_str(&doc.to_string()).unwrap()
}

fn enter_and_leave_triggers() -> serde_json::Value {
    json!([
        { "id": "T1",
          "conditions": [
            { "type": "event_type", "parameters": { "events": ["enter"] } },
            { "type": "expression", "expression": "true" }
          ],
          "action": { "id": "welcome", "type": "notification" } },
        { "id": "T2",
          "conditions": [{ "type": "event_type", "parameters": { "events": ["leave"] } }],
          "action": { "id": "goodbye", "type": "notification" } }
    ])
}

fn near() -> RangedSample {
    RangedSample {
        proximity_uuid: Uuid::parse_str(UUID).unwrap(),
        major: 1,
        minor: 1,
        proximity: Proximity::Near,
        accuracy: 1.2,
        rssi: -64,
    }
}

fn engine(zones: &ZoneSet) -> TriggerEngine {
    let index = BeaconIndex::build(zones, &ConditionRegistry::default()).unwrap();
    TriggerEngine::new(index, &EngineConfig::default()).0
}

fn enter_event() -> BeaconEvent {
    BeaconEvent::new(
        EventType::Enter,
        beacon(),
        Reading {
            proximity: Proximity::Near,
            accuracy: 1.0,
            rssi: -60,
        },
    )
}

fn pipeline(triggers: serde_json::Value) -> (Orchestrator, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let orchestrator = Orchestrator::new(
        &EngineConfig::default(),
        &zones(triggers),
        ConditionRegistry::default(),
        Arc::clone(&recorder) as Arc<dyn ActionDispatcher>,
    )
    .unwrap();
    (orchestrator, recorder)
}

async fn advance(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

#[tokio::test]
async fn test_occurrence_limit_of_two_stops_third_fire() {
    let engine = engine(&zones(json!([
        { "id": "T1",
          "conditions": [
            { "type": "max_occurrence", "parameters": { "max": 2 } },
            { "type": "expression", "expression": "true" }
          ],
          "action": { "id": "a", "type": "log" } }
    ])));

    assert!(matches!(engine.handle_event(&enter_event()).unwrap(), EngineOutcome::Fired(_)));
    assert!(matches!(engine.handle_event(&enter_event()).unwrap(), EngineOutcome::Fired(_)));
    assert_eq!(engine.occurrence_count(beacon(), "T1"), 2);
    assert_eq!(engine.handle_event(&enter_event()).unwrap(), EngineOutcome::NoMatch);
    assert_eq!(engine.occurrence_count(beacon(), "T1"), 2);
}

#[tokio::test]
async fn test_first_configured_trigger_wins() {
    let engine = engine(&zones(json!([
        { "id": "first", "action": { "id": "a", "type": "log" } },
        { "id": "second", "action": { "id": "b", "type": "log" } }
    ])));

    match engine.handle_event(&enter_event()).unwrap() {
        EngineOutcome::Fired(decision) => assert_eq!(decision.trigger, "first"),
        other => panic!("expected a fire, got {other:?}"),
    }
    assert_eq!(engine.occurrence_count(beacon(), "second"), 0);
}

#[tokio::test]
async fn test_dry_run_never_changes_counts() {
    let engine = engine(&zones(json!([
        { "id": "T1",
          "conditions": [{ "type": "max_occurrence", "parameters": { "max": 1 } }],
          "action": { "id": "a", "type": "log" } }
    ])));

    for _ in 0..25 {
        assert_eq!(engine.would_fire(beacon(), EventType::Enter).as_deref(), Some("T1"));
    }
    assert_eq!(engine.occurrence_count(beacon(), "T1"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_quick_reentry_suppresses_leave() {
    let (orchestrator, recorder) = pipeline(enter_and_leave_triggers());
    orchestrator.start().unwrap();

    // t=0 enter, flushed at t=1.
    assert!(orchestrator.on_ranged_samples(vec![near()], "lobby"));
    advance(1500).await;
    assert_eq!(recorder.events(), vec![("T1".to_string(), EventType::Enter)]);
    assert_eq!(orchestrator.occurrence_count(beacon(), "T1"), 1);

    // Region empty at t=2: leave deferred until t=7.
    orchestrator.on_ranged_samples(Vec::new(), "lobby");
    advance(1000).await;
    assert!(orchestrator.engine().has_pending_exit(beacon()));

    // Back at t=3: the pending leave is cancelled and T1 fires again.
    orchestrator.on_ranged_samples(vec![near()], "lobby");
    advance(1000).await;
    assert!(!orchestrator.engine().has_pending_exit(beacon()));

    advance(10_000).await;
    assert_eq!(
        recorder.events(),
        vec![
            ("T1".to_string(), EventType::Enter),
            ("T1".to_string(), EventType::Enter)
        ]
    );
    assert_eq!(orchestrator.occurrence_count(beacon(), "T1"), 2);
    assert_eq!(orchestrator.occurrence_count(beacon(), "T2"), 0);
    assert_eq!(orchestrator.status().dispatches.succeeded, 2);
}

#[tokio::test(start_paused = true)]
async fn test_leave_fires_after_delay() {
    let (orchestrator, recorder) = pipeline(enter_and_leave_triggers());
    orchestrator.start().unwrap();

    orchestrator.on_ranged_samples(vec![near()], "lobby");
    advance(1500).await;
    orchestrator.on_ranged_samples(Vec::new(), "lobby");
    advance(1000).await;
    assert_eq!(recorder.events().len(), 1);

    advance(4000).await;
    assert_eq!(recorder.events().len(), 1);

    advance(1000).await;
    assert_eq!(
        recorder.events().last().cloned(),
        Some(("T2".to_string(), EventType::Exit))
    );
    assert_eq!(orchestrator.occurrence_count(beacon(), "T2"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_paused_pipeline_classifies_nothing_until_resumed() {
    let (orchestrator, recorder) = pipeline(enter_and_leave_triggers());
    orchestrator.start().unwrap();
    orchestrator.pause();

    assert!(orchestrator.on_ranged_samples(vec![near()], "lobby"));
    advance(3000).await;
    assert!(recorder.events().is_empty());
    assert_eq!(orchestrator.status().pending_regions, 1);

    orchestrator.resume();
    advance(1500).await;
    assert_eq!(recorder.events(), vec![("T1".to_string(), EventType::Enter)]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_pending_leave_and_ignores_samples() {
    let (orchestrator, recorder) = pipeline(enter_and_leave_triggers());
    orchestrator.start().unwrap();

    orchestrator.on_ranged_samples(vec![near()], "lobby");
    advance(1500).await;
    orchestrator.on_ranged_samples(Vec::new(), "lobby");
    advance(1000).await;
    assert_eq!(orchestrator.status().pending_exits, 1);

    assert!(orchestrator.stop());
    assert!(!orchestrator.stop());
    assert_eq!(orchestrator.status().pending_exits, 0);
    assert!(!orchestrator.on_ranged_samples(vec![near()], "lobby"));

    advance(10_000).await;
    assert_eq!(recorder.events(), vec![("T1".to_string(), EventType::Enter)]);
}

#[tokio::test]
async fn test_force_fire_dispatches_without_counting() {
    let (orchestrator, recorder) = pipeline(enter_and_leave_triggers());

    let decision = orchestrator.force_fire(beacon(), EventType::Exit).unwrap();
    assert!(decision.forced);
    assert_eq!(decision.trigger, "T2");
    assert_eq!(recorder.events(), vec![("T2".to_string(), EventType::Exit)]);
    assert_eq!(orchestrator.occurrence_count(beacon(), "T2"), 0);

    let err = orchestrator.force_fire(beacon(), EventType::Range).unwrap_err();
    assert!(err.is_expected_state());
}

#[tokio::test]
async fn test_failed_reload_keeps_current_zones() {
    let (orchestrator, _recorder) = pipeline(enter_and_leave_triggers());
    let broken = zones(json!([
        { "id": "bad", "conditions": [{ "type": "no_such_type" }], "action": { "id": "a", "type": "log" } }
    ]));

    assert!(orchestrator.reload(&broken).is_err());
    assert_eq!(orchestrator.status().triggers, 2);

    orchestrator.reload(&ZoneSet::default()).unwrap();
    assert_eq!(orchestrator.status().beacons, 0);
}

#[tokio::test]
async fn test_dropped_completion_counts_as_abandoned() {
    let orchestrator = Orchestrator::new(
        &EngineConfig::default(),
        &zones(enter_and_leave_triggers()),
        ConditionRegistry::default(),
        Arc::new(Forgetful),
    )
    .unwrap();

    orchestrator.force_fire(beacon(), EventType::Enter).unwrap();
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }

    let counters = orchestrator.status().dispatches;
    assert_eq!(counters.dispatched, 1);
    assert_eq!(counters.abandoned, 1);
}

#[test]
fn test_start_requires_runtime() {
    let (orchestrator, _recorder) = pipeline(enter_and_leave_triggers());
    assert!(orchestrator.start().is_err());
    assert!(!orchestrator.is_running());
}

fn build_with(config: &EngineConfig) -> Result<Orchestrator, ConfigError> {
    Orchestrator::new(
        config,
        &zones(enter_and_leave_triggers()),
        ConditionRegistry::default(),
        Arc::new(Recorder::default()),
    )
}

#[test]
fn test_zero_batch_interval_is_rejected_before_start() {
    let config = EngineConfig {
        batch_interval_ms: 0,
        ..EngineConfig::default()
    };
    let err = build_with(&config).unwrap_err();
    assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "engine.batch_interval_ms"));
}

#[test]
fn test_overlong_leave_delay_is_rejected_before_start() {
    let config = EngineConfig {
        leave_delay_secs: u64::MAX,
        ..EngineConfig::default()
    };
    let err = build_with(&config).unwrap_err();
    assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "engine.leave_delay_secs"));
}

#[tokio::test]
async fn test_unschedulable_leave_is_an_error_not_a_panic() {
    let index = BeaconIndex::build(&zones(enter_and_leave_triggers()), &ConditionRegistry::default()).unwrap();
    let config = EngineConfig {
        leave_delay_secs: u64::MAX,
        ..EngineConfig::default()
    };
    let (engine, _deferred) = TriggerEngine::new(index, &config);

    assert!(matches!(engine.handle_event(&enter_event()).unwrap(), EngineOutcome::Fired(_)));
    let leave = BeaconEvent::new(EventType::Exit, beacon(), enter_event().reading);
    let err = engine.handle_event(&leave).unwrap_err();
    assert!(matches!(
        err,
        BeaconKitError::Scheduling(ScheduleError::DelayOutOfRange { .. })
    ));
    assert_eq!(err.http_status_code(), 422);
    assert!(!engine.has_pending_exit(beacon()));

    // The engine keeps working after the rejected leave.
    assert!(matches!(engine.handle_event(&enter_event()).unwrap(), EngineOutcome::Fired(_)));
}
