//! Dispatcher behaviour against scripted pumps and constrained stores.

use core::time::Duration;

use crate::mock_hw::{MockPump, PumpReply, t0};

use apsloop::activity::log::EventLog;
use apsloop::adapters::memory_store::MemoryStore;
use apsloop::app::ports::SendOutcome;
use apsloop::constraints::ApprovedDose;
use apsloop::dispatch::Dispatcher;
use apsloop::error::DispatchError;
use apsloop::types::{AckState, DoseKind, IdempotencyToken, LogRecord};

const CLEAN_REJECT: PumpReply = PumpReply::Answer(SendOutcome::Rejected {
    delivery_ruled_out: true,
});
const DIRTY_REJECT: PumpReply = PumpReply::Answer(SendOutcome::Rejected {
    delivery_ruled_out: false,
});

fn dispatcher(store: MemoryStore) -> Dispatcher<MemoryStore> {
    let log = EventLog::open(store, t0(), chrono::Duration::hours(24)).unwrap();
    Dispatcher::new(log, Duration::from_secs(1))
}

fn bolus(amount_mu: u32) -> ApprovedDose {
    ApprovedDose {
        kind: DoseKind::Bolus,
        amount_mu,
        duration_minutes: 0,
        proposed_mu: amount_mu,
        binding: None,
    }
}

fn acks(d: &Dispatcher<MemoryStore>) -> Vec<AckState> {
    d.log()
        .store()
        .records()
        .unwrap()
        .into_iter()
        .filter_map(|r| match r {
            LogRecord::Dose(dose) => Some(dose.ack),
            LogRecord::Meal(_) => None,
        })
        .collect()
}

#[test]
fn pending_is_logged_before_the_outcome() {
    let mut d = dispatcher(MemoryStore::new());
    let mut pump = MockPump::new();
    let event = d.dispatch(&bolus(1_000), t0(), t0(), &mut pump).unwrap();

    assert_eq!(event.ack, AckState::Confirmed);
    assert_eq!(event.issued_at, Some(t0()));
    assert_eq!(acks(&d), vec![AckState::Pending, AckState::Confirmed]);
}

#[test]
fn clean_rejection_is_retried_once() {
    let mut d = dispatcher(MemoryStore::new());
    let mut pump = MockPump::scripted([CLEAN_REJECT]);
    let event = d.dispatch(&bolus(1_000), t0(), t0(), &mut pump).unwrap();

    assert_eq!(event.ack, AckState::Confirmed);
    assert_eq!(pump.sent.len(), 2);
    assert_eq!(pump.sent[0].attempt, 1);
    assert_eq!(pump.sent[1].attempt, 2);
    assert_eq!(pump.sent[0].token, pump.sent[1].token);
}

#[test]
fn second_clean_rejection_fails() {
    let mut d = dispatcher(MemoryStore::new());
    let mut pump = MockPump::scripted([CLEAN_REJECT, CLEAN_REJECT]);
    let event = d.dispatch(&bolus(1_000), t0(), t0(), &mut pump).unwrap();

    assert_eq!(event.ack, AckState::Failed);
    assert_eq!(pump.sent.len(), 2);
    assert!(!event.ack.counts_as_delivered());
}

#[test]
fn possible_delivery_is_never_retried() {
    for reply in [DIRTY_REJECT, PumpReply::Hang] {
        let mut d = dispatcher(MemoryStore::new());
        let mut pump = MockPump::scripted([reply]);
        let event = d.dispatch(&bolus(1_000), t0(), t0(), &mut pump).unwrap();

        assert_eq!(event.ack, AckState::Unknown, "{reply:?}");
        assert_eq!(pump.sent.len(), 1, "{reply:?}");
        assert!(event.ack.counts_as_delivered());
    }
}

#[test]
fn same_cycle_and_kind_is_sent_once() {
    let mut d = dispatcher(MemoryStore::new());
    let mut pump = MockPump::new();
    let first = d.dispatch(&bolus(1_000), t0(), t0(), &mut pump).unwrap();
    let again = d.dispatch(&bolus(1_000), t0(), t0(), &mut pump).unwrap();

    assert_eq!(first, again);
    assert_eq!(pump.sent.len(), 1);
    assert_eq!(acks(&d).len(), 2);
}

#[test]
fn idempotency_survives_reopening_the_log() {
    let mut d = dispatcher(MemoryStore::new());
    let mut pump = MockPump::new();
    d.dispatch(&bolus(1_000), t0(), t0(), &mut pump).unwrap();

    let store = d.log().store().clone();
    let mut reopened = dispatcher(store);
    let event = reopened.dispatch(&bolus(1_000), t0(), t0(), &mut pump).unwrap();

    assert_eq!(event.ack, AckState::Confirmed);
    assert_eq!(pump.sent.len(), 1);
    assert_eq!(
        reopened
            .log()
            .find(&IdempotencyToken::new(t0(), DoseKind::Bolus))
            .map(|e| e.amount_mu),
        Some(1_000)
    );
}

#[test]
fn zero_bolus_is_not_sent() {
    let mut d = dispatcher(MemoryStore::new());
    let mut pump = MockPump::new();
    assert_eq!(
        d.dispatch(&bolus(0), t0(), t0(), &mut pump),
        Err(DispatchError::Empty)
    );
    assert!(pump.sent.is_empty());
}

#[test]
fn full_log_blocks_the_send() {
    let mut d = dispatcher(MemoryStore::with_capacity(0));
    let mut pump = MockPump::new();
    let err = d.dispatch(&bolus(1_000), t0(), t0(), &mut pump).unwrap_err();

    assert!(matches!(err, DispatchError::LogBeforeSend(_)));
    assert!(pump.sent.is_empty());
}

#[test]
fn unrecorded_outcome_leaves_pending_counted() {
    let mut d = dispatcher(MemoryStore::with_capacity(1));
    let mut pump = MockPump::new();
    let err = d.dispatch(&bolus(1_000), t0(), t0(), &mut pump).unwrap_err();

    match err {
        DispatchError::LogAfterSend { event, .. } => assert_eq!(event.ack, AckState::Confirmed),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(pump.sent.len(), 1);
    assert_eq!(acks(&d), vec![AckState::Pending]);
    assert!(AckState::Pending.counts_as_delivered());
}
