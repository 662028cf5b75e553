//! Cycle orchestration: FSM walk, notifications, audit trail and the
//! serialized runner.

use crate::mock_hw::{
    AuditRecorder, EventRecorder, Fixed, MockPump, MockSensor, Service, run_once, service_with, t0,
};

use apsloop::adapters::memory_store::MemoryStore;
use apsloop::adapters::time::SimClock;
use apsloop::app::commands::AppCommand;
use apsloop::app::cycle::ReasonCode;
use apsloop::app::events::AppEvent;
use apsloop::app::ports::TriggerKind;
use apsloop::app::runner::{BoundLoop, LoopRunner, RunOutcome};
use apsloop::audit::verify_chain;
use apsloop::config::{EngineConfig, LoopMode};
use apsloop::fsm::StateId;
use apsloop::strategy::{ProfileReplay, StrategyKind};
use chrono::Duration;

fn transitions(events: &EventRecorder) -> Vec<(StateId, StateId)> {
    events
        .events
        .iter()
        .filter_map(|e| match e {
            AppEvent::StateChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

// ── FSM walk ──────────────────────────────────────────────────

#[test]
fn dosed_cycle_visits_every_stage_in_order() {
    let mut svc = service_with(EngineConfig::default(), Fixed::bolus(1_000), MemoryStore::new());
    let (result, events) = run_once(&mut svc, &mut MockSensor::reading(180.0, 2), &mut MockPump::new());

    assert_eq!(result.reason, ReasonCode::Dosed);
    assert_eq!(
        transitions(&events),
        vec![
            (StateId::Idle, StateId::Gathering),
            (StateId::Gathering, StateId::Proposing),
            (StateId::Proposing, StateId::Constraining),
            (StateId::Constraining, StateId::Dispatching),
            (StateId::Dispatching, StateId::Idle),
        ]
    );
    assert_eq!(svc.state(), StateId::Idle);
}

#[test]
fn stale_cycle_skips_straight_to_dispatching() {
    let mut svc = service_with(EngineConfig::default(), Fixed::bolus(1_000), MemoryStore::new());
    let (result, events) = run_once(&mut svc, &mut MockSensor::reading(180.0, 30), &mut MockPump::new());

    assert_eq!(result.reason, ReasonCode::StaleData);
    assert_eq!(
        transitions(&events),
        vec![
            (StateId::Idle, StateId::Gathering),
            (StateId::Gathering, StateId::Dispatching),
            (StateId::Dispatching, StateId::Idle),
        ]
    );
}

#[test]
fn every_cycle_emits_exactly_one_completion() {
    let mut svc = service_with(EngineConfig::default(), Fixed::bolus(1_000), MemoryStore::new());
    for (value, age) in [(180.0, 2), (180.0, 40), (50.0, 2)] {
        let (result, events) = run_once(&mut svc, &mut MockSensor::reading(value, age), &mut MockPump::new());
        let completions: Vec<_> = events
            .events
            .iter()
            .filter(|e| matches!(e, AppEvent::CycleCompleted { .. }))
            .collect();
        assert_eq!(completions.len(), 1, "{}", result.reason);
    }
}

// ── Commands ──────────────────────────────────────────────────

#[test]
fn suspend_only_mode_vetoes_boluses() {
    let mut svc = service_with(EngineConfig::default(), Fixed::bolus(1_000), MemoryStore::new());
    svc.handle_command(AppCommand::SetLoopMode(LoopMode::LowGlucoseSuspend), t0())
        .unwrap();
    let mut pump = MockPump::new();
    let (result, _) = run_once(&mut svc, &mut MockSensor::reading(250.0, 2), &mut pump);

    assert_eq!(result.reason, ReasonCode::Vetoed(apsloop::constraints::ConstraintKind::LoopMode));
    assert!(pump.sent.is_empty());
}

#[test]
fn announced_meal_shows_up_as_carbs_on_board() {
    let mut svc = service_with(
        EngineConfig::default(),
        StrategyKind::ProfileReplay(ProfileReplay),
        MemoryStore::new(),
    );
    let trigger = svc
        .handle_command(
            AppCommand::AnnounceMeal {
                carbs_g: 60.0,
                absorption_minutes: Some(120),
            },
            t0() - Duration::minutes(60),
        )
        .unwrap();
    assert_eq!(trigger, Some(TriggerKind::Manual));

    let (result, _) = run_once(&mut svc, &mut MockSensor::reading(140.0, 2), &mut MockPump::new());
    let cob = result.inputs.cob_g.unwrap();
    assert!((29.0..=31.0).contains(&cob), "half of 60 g left after 60 of 120 min, got {cob}");
}

#[test]
fn meal_absorption_outside_the_lookback_is_rejected() {
    let mut svc = service_with(EngineConfig::default(), Fixed::bolus(1_000), MemoryStore::new());
    let announced = svc.handle_command(
        AppCommand::AnnounceMeal {
            carbs_g: 40.0,
            absorption_minutes: Some(24 * 60),
        },
        t0(),
    );
    assert!(announced.is_err());
    assert_eq!(svc.event_log().store().len(), 0);
}

// ── Audit ─────────────────────────────────────────────────────

#[test]
fn audit_records_are_buffered_while_the_sink_is_offline() {
    let mut svc: Service = service_with(EngineConfig::default(), Fixed::bolus(1_000), MemoryStore::new());
    let mut audit = AuditRecorder {
        offline: true,
        ..AuditRecorder::default()
    };
    let mut events = EventRecorder::default();

    for minute in [0, 5, 10] {
        let now = t0() + Duration::minutes(minute);
        let mut sensor = MockSensor::reading(180.0, 0);
        sensor.readings[0].timestamp = now;
        svc.run_cycle(now, TriggerKind::Cadence, &mut sensor, &mut MockPump::new(), &mut events, &mut audit);
    }
    assert!(audit.records.is_empty());
    assert_eq!(svc.audit().pending(), 3);

    audit.offline = false;
    let now = t0() + Duration::minutes(15);
    let mut sensor = MockSensor::reading(180.0, 0);
    sensor.readings[0].timestamp = now;
    svc.run_cycle(now, TriggerKind::Cadence, &mut sensor, &mut MockPump::new(), &mut events, &mut audit);

    assert_eq!(svc.audit().pending(), 0);
    assert_eq!(audit.records.len(), 4);
    let sequences: Vec<u64> = audit.records.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
    assert!(verify_chain(&audit.records));
}

#[test]
fn tampered_audit_body_breaks_the_chain() {
    let mut svc = service_with(EngineConfig::default(), Fixed::bolus(1_000), MemoryStore::new());
    let mut audit = AuditRecorder::default();
    let mut events = EventRecorder::default();
    for _ in 0..2 {
        svc.run_cycle(
            t0(),
            TriggerKind::Manual,
            &mut MockSensor::reading(180.0, 2),
            &mut MockPump::new(),
            &mut events,
            &mut audit,
        );
    }
    assert!(verify_chain(&audit.records));

    audit.records[0].body = audit.records[0].body.replace("Dosed", "NoChange");
    assert!(!verify_chain(&audit.records));
}

// ── Runner ────────────────────────────────────────────────────

#[test]
fn runner_drives_a_bound_loop() {
    let svc = service_with(EngineConfig::default(), Fixed::bolus(1_000), MemoryStore::new());
    let cancel = svc.cancel_token();
    let bound = BoundLoop::new(
        svc,
        MockSensor::reading(180.0, 2),
        MockPump::new(),
        EventRecorder::default(),
        AuditRecorder::default(),
    );
    let runner = LoopRunner::new(bound, SimClock::new(t0()), cancel);

    let RunOutcome::Ran(results) = runner.trigger(TriggerKind::FreshData) else {
        panic!("idle runner must run the cycle");
    };
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].trigger, TriggerKind::FreshData);
    assert_eq!(results[0].reason, ReasonCode::Dosed);
    assert!(!runner.is_pending());

    let bound = runner.into_inner();
    assert_eq!(bound.pump.sent.len(), 1);
    assert_eq!(bound.audit.records.len(), 1);
    assert!(matches!(bound.events.events[0], AppEvent::Started { .. }));
}

#[test]
fn repeated_trigger_at_same_instant_does_not_double_dose() {
    let svc = service_with(EngineConfig::default(), Fixed::bolus(1_000), MemoryStore::new());
    let cancel = svc.cancel_token();
    let bound = BoundLoop::new(
        svc,
        MockSensor::reading(180.0, 2),
        MockPump::new(),
        EventRecorder::default(),
        AuditRecorder::default(),
    );
    let runner = LoopRunner::new(bound, SimClock::new(t0()), cancel);

    runner.trigger(TriggerKind::Cadence);
    let RunOutcome::Ran(second) = runner.trigger(TriggerKind::Manual) else {
        panic!("idle runner must run the cycle");
    };
    // Same cycle timestamp: the bolus-interval guard refuses a second bolus.
    assert_eq!(
        second[0].reason,
        ReasonCode::Vetoed(apsloop::constraints::ConstraintKind::BolusInterval)
    );
    assert_eq!(runner.with_target(|b| b.pump.sent.len()), 1);
}
