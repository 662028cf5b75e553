//! End-to-end dosing scenarios: strategy proposal → constraints → pump.

use crate::mock_hw::{
    Fixed, MockPump, MockSensor, PumpReply, confirmed_bolus, run_at, run_once, segment, service_with,
    service_with_profile, store_with_bolus, t0,
};

use apsloop::activity::compute_iob;
use apsloop::adapters::memory_store::MemoryStore;
use apsloop::app::cycle::ReasonCode;
use apsloop::app::events::AppEvent;
use apsloop::config::EngineConfig;
use apsloop::constraints::ConstraintKind;
use apsloop::profile::{InsulinCurve, Profile};
use apsloop::types::{AckState, DoseKind};
use chrono::Duration;

fn config_with_max_bolus(max_bolus_mu: u32) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.limits.max_bolus_mu = max_bolus_mu;
    config
}

/// About 0.5 U on board at `t0`.
fn half_unit_on_board() -> MemoryStore {
    store_with_bolus(550, t0() - Duration::minutes(30))
}

// ── 2 U proposed, 0.5 U on board ──────────────────────────────

#[test]
fn bolus_within_limits_is_delivered_unchanged() {
    let mut svc = service_with(config_with_max_bolus(3_000), Fixed::bolus(2_000), half_unit_on_board());
    let mut pump = MockPump::new();
    let (result, _) = run_once(&mut svc, &mut MockSensor::reading(180.0, 2), &mut pump);

    let iob = result.inputs.iob_mu.unwrap();
    assert!((400..=600).contains(&iob), "expected ~0.5 U on board, got {iob} mU");

    assert_eq!(result.reason, ReasonCode::Dosed);
    let approved = result.approved.unwrap();
    assert_eq!(approved.amount_mu, 2_000);
    assert_eq!(approved.binding, None);
    assert_eq!(pump.sent.len(), 1);
    assert_eq!(pump.sent[0].amount_mu, 2_000);
    assert_eq!(pump.sent[0].kind, DoseKind::Bolus);
    assert_eq!(result.delivery.unwrap().ack, AckState::Confirmed);

    // The next cycle sees the new bolus on board.
    let next = run_at(&mut svc, t0() + Duration::minutes(5), 180.0, &mut pump);
    let risen = next.inputs.iob_mu.unwrap() - iob;
    assert!((1_800..=2_050).contains(&risen), "IOB rose by {risen} mU");
}

#[test]
fn bolus_above_max_is_clamped_and_binding_recorded() {
    let mut svc = service_with(config_with_max_bolus(1_000), Fixed::bolus(2_000), half_unit_on_board());
    let mut pump = MockPump::new();
    let (result, _) = run_once(&mut svc, &mut MockSensor::reading(180.0, 2), &mut pump);

    assert_eq!(result.reason, ReasonCode::Dosed);
    assert_eq!(result.approved.unwrap().amount_mu, 1_000);
    assert_eq!(result.binding_constraint(), Some(ConstraintKind::MaxBolus));
    assert_eq!(pump.sent[0].amount_mu, 1_000);

    let max_bolus = result
        .verdicts
        .iter()
        .find(|v| v.unit == ConstraintKind::MaxBolus)
        .unwrap();
    assert_eq!(max_bolus.output.max, 1_000);
}

#[test]
fn low_glucose_suspends_dosing() {
    let mut svc = service_with(config_with_max_bolus(3_000), Fixed::bolus(2_000), half_unit_on_board());
    let mut pump = MockPump::new();
    let (result, events) = run_once(&mut svc, &mut MockSensor::reading(60.0, 2), &mut pump);

    assert_eq!(result.reason, ReasonCode::Suspended);
    assert_eq!(result.reason.to_string(), "no dose, suspended");
    assert!(result.approved.is_none());
    assert!(pump.sent.is_empty());

    let last = result.verdicts.last().unwrap();
    assert_eq!(last.unit, ConstraintKind::LowGlucoseSuspend);
    assert!(last.veto.is_some());
    assert!(events.events.iter().any(|e| matches!(
        e,
        AppEvent::Notification(n) if n.reason == ReasonCode::Suspended && !n.attention_required
    )));
}

#[test]
fn low_glucose_still_allows_zero_temp_basal() {
    let mut svc = service_with(EngineConfig::default(), Fixed::temp_basal(0), MemoryStore::new());
    let mut pump = MockPump::new();
    let (result, _) = run_once(&mut svc, &mut MockSensor::reading(60.0, 2), &mut pump);

    assert_eq!(result.reason, ReasonCode::Dosed);
    assert_eq!(pump.sent.len(), 1);
    assert_eq!(pump.sent[0].kind, DoseKind::BasalRateChange);
    assert_eq!(pump.sent[0].amount_mu, 0);
}

// ── Stale data fail-safe ──────────────────────────────────────

#[test]
fn stale_reading_never_doses() {
    let mut svc = service_with(EngineConfig::default(), Fixed::bolus(2_000), MemoryStore::new());
    let mut pump = MockPump::new();
    let (result, _) = run_once(&mut svc, &mut MockSensor::reading(250.0, 13), &mut pump);

    assert_eq!(result.reason, ReasonCode::StaleData);
    assert!(result.proposal.is_none());
    assert!(pump.sent.is_empty());
}

#[test]
fn missing_readings_never_dose() {
    let mut svc = service_with(EngineConfig::default(), Fixed::bolus(2_000), MemoryStore::new());
    let mut pump = MockPump::new();
    let (result, _) = run_once(&mut svc, &mut MockSensor::empty(), &mut pump);

    assert_eq!(result.reason, ReasonCode::StaleData);
    assert!(pump.sent.is_empty());
}

#[test]
fn sensor_failure_never_doses() {
    let mut svc = service_with(EngineConfig::default(), Fixed::bolus(2_000), MemoryStore::new());
    let mut pump = MockPump::new();
    let mut sensor = MockSensor::reading(180.0, 2);
    sensor.fail = true;
    let (result, _) = run_once(&mut svc, &mut sensor, &mut pump);

    assert_eq!(result.reason, ReasonCode::SensorFault);
    assert!(pump.sent.is_empty());
}

// ── Lost acknowledgment ───────────────────────────────────────

#[test]
fn lost_ack_counts_toward_next_cycle_iob() {
    let mut config = EngineConfig::default();
    config.ack_timeout_secs = 1;
    let mut svc = service_with(config, Fixed::bolus(2_000), MemoryStore::new());

    let mut pump = MockPump::scripted([PumpReply::Hang]);
    let (first, events) = run_once(&mut svc, &mut MockSensor::reading(180.0, 2), &mut pump);
    assert_eq!(first.reason, ReasonCode::DispatchUnknown);
    assert_eq!(first.delivery.unwrap().ack, AckState::Unknown);
    assert_eq!(pump.sent.len(), 1, "an unknown outcome is never retried");
    assert!(events.events.iter().any(|e| matches!(
        e,
        AppEvent::Notification(n) if n.attention_required
    )));

    let later = t0() + Duration::minutes(5);
    let mut sensor = MockSensor::reading(180.0, 0);
    sensor.readings[0].timestamp = later;
    let mut events = crate::mock_hw::EventRecorder::default();
    let mut audit = crate::mock_hw::AuditRecorder::default();
    let second = svc.run_cycle(
        later,
        apsloop::app::ports::TriggerKind::Cadence,
        &mut sensor,
        &mut pump,
        &mut events,
        &mut audit,
    );
    assert!(second.inputs.iob_mu.unwrap() > 1_500);
}

// ── Profile and history ───────────────────────────────────────

#[test]
fn unvalidated_profile_is_a_configuration_fault() {
    let mut profile = Profile::flat("broken", segment());
    profile.insulin = InsulinCurve {
        dia_minutes: 0,
        peak_minutes: 0,
    };
    assert!(profile.validate().is_err());

    let store = store_with_bolus(5_000, t0() - Duration::minutes(30));
    let mut svc = service_with_profile(EngineConfig::default(), Fixed::bolus(2_000), profile, store);
    let mut pump = MockPump::new();
    let (result, events) = run_once(&mut svc, &mut MockSensor::reading(180.0, 2), &mut pump);

    assert_eq!(result.reason, ReasonCode::ConfigurationFault);
    assert!(result.inputs.iob_mu.is_none());
    assert!(pump.sent.is_empty());
    assert!(events.events.iter().any(|e| matches!(
        e,
        AppEvent::Notification(n) if n.reason == ReasonCode::ConfigurationFault
    )));
}

#[test]
fn profile_without_segments_faults_instead_of_panicking() {
    let mut profile = Profile::flat("empty", segment());
    profile.segments.clear();

    let mut svc = service_with_profile(EngineConfig::default(), Fixed::bolus(2_000), profile, MemoryStore::new());
    let mut pump = MockPump::new();
    let (result, _) = run_once(&mut svc, &mut MockSensor::reading(180.0, 2), &mut pump);

    assert_eq!(result.reason, ReasonCode::ConfigurationFault);
    assert!(pump.sent.is_empty());
}

#[test]
fn long_dia_reaches_past_the_configured_window() {
    let mut config = EngineConfig::default();
    config.activity_window_hours = 6;
    let mut profile = Profile::flat("long", segment());
    profile.insulin = InsulinCurve {
        dia_minutes: 600,
        peak_minutes: 75,
    };
    assert!(profile.validate().is_ok());

    let at = t0() - Duration::hours(7);
    let expected = compute_iob(t0(), &[confirmed_bolus(5_000, at)], &profile);
    assert!(expected > 0);

    let mut svc = service_with_profile(config, Fixed::bolus(1_000), profile, store_with_bolus(5_000, at));
    let (result, _) = run_once(&mut svc, &mut MockSensor::reading(180.0, 2), &mut MockPump::new());

    assert_eq!(result.inputs.iob_mu, Some(expected));
}
