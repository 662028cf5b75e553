//! Command dispatcher: the only writer of the event log.
//!
//! ```text
//!  ApprovedDose ──▶ token = cycle_ms + kind ──▶ already logged? ──yes──▶ return logged event
//!                                                   │ no
//!                                                   ▼
//!                                   append Pending ──▶ send (bounded) ──▶ classify
//!                                                                           │
//!        Acknowledged ─────────────────────────▶ Confirmed                  │
//!        TimedOut / Rejected(maybe delivered) ─▶ Unknown  (never retried)   │
//!        Rejected(nothing delivered) ──────────▶ Failed ─▶ retry once ──────┘
//!                                                   │
//!                                   append outcome (supersedes Pending)
//! ```
//!
//! The pump wait is bounded by racing the send future against an
//! `async_io_mini::Timer`; running out of time is classified exactly like
//! a lost acknowledgment.

use core::time::Duration;

use chrono::{DateTime, Utc};
use futures_lite::future;
use log::{error, info, warn};

use crate::activity::log::EventLog;
use crate::app::ports::{DoseCommand, PersistencePort, PumpPort, SendOutcome, StorageError};
use crate::constraints::ApprovedDose;
use crate::error::DispatchError;
use crate::types::{AckState, DoseEvent, IdempotencyToken, LogRecord, MealEvent};

/// First send plus the single retry allowed after a clean rejection.
const MAX_ATTEMPTS: u8 = 2;

pub struct Dispatcher<P: PersistencePort> {
    log: EventLog<P>,
    ack_timeout: Duration,
}

impl<P: PersistencePort> Dispatcher<P> {
    pub fn new(log: EventLog<P>, ack_timeout: Duration) -> Self {
        Self { log, ack_timeout }
    }

    /// Read-only view of the log for snapshotting.
    pub fn log(&self) -> &EventLog<P> {
        &self.log
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Turn `approved` into a pump command and record its outcome.
    ///
    /// Calling this again for the same cycle and dose kind returns the
    /// logged event without touching the pump.
    pub fn dispatch(
        &mut self,
        approved: &ApprovedDose,
        cycle_started_at: DateTime<Utc>,
        issued_at: DateTime<Utc>,
        pump: &mut impl PumpPort,
    ) -> Result<DoseEvent, DispatchError> {
        if approved.is_noop() {
            return Err(DispatchError::Empty);
        }

        let token = IdempotencyToken::new(cycle_started_at, approved.kind);
        if let Some(existing) = self.log.find(&token) {
            info!("Dispatch {token}: already logged as {:?}, not resending", existing.ack);
            return Ok(*existing);
        }

        let mut event = DoseEvent {
            token,
            kind: approved.kind,
            amount_mu: approved.amount_mu,
            duration_minutes: approved.duration_minutes,
            requested_at: cycle_started_at,
            issued_at: None,
            ack: AckState::Pending,
        };
        self.log
            .append(LogRecord::Dose(event))
            .map_err(DispatchError::LogBeforeSend)?;

        event.issued_at = Some(issued_at);
        event.ack = self.send_with_retry(&event, pump);

        match event.ack {
            AckState::Confirmed => info!("Dispatch {token}: confirmed {} mU", event.amount_mu),
            AckState::Unknown => warn!("Dispatch {token}: outcome unknown, counted as delivered"),
            AckState::Failed => error!("Dispatch {token}: rejected after {MAX_ATTEMPTS} attempts"),
            AckState::Pending => {}
        }

        self.log
            .append(LogRecord::Dose(event))
            .map_err(|error| DispatchError::LogAfterSend { event, error })?;
        Ok(event)
    }

    /// Record an announced meal.
    pub fn record_meal(&mut self, meal: MealEvent) -> Result<(), StorageError> {
        info!("Meal recorded: {:.0} g over {} min", meal.carbs_g, meal.absorption_minutes);
        self.log.append(LogRecord::Meal(meal))
    }

    fn send_with_retry(&self, event: &DoseEvent, pump: &mut impl PumpPort) -> AckState {
        let mut attempt = 1;
        loop {
            let command = DoseCommand {
                token: event.token,
                kind: event.kind,
                amount_mu: event.amount_mu,
                duration_minutes: event.duration_minutes,
                attempt,
            };
            let state = classify(send_bounded(pump, &command, self.ack_timeout));
            if state == AckState::Failed && attempt < MAX_ATTEMPTS {
                warn!("Dispatch {}: rejected before delivery, retrying", event.token);
                attempt += 1;
                continue;
            }
            return state;
        }
    }
}

/// Race the pump send against the acknowledgment timeout.
pub fn send_bounded(pump: &mut impl PumpPort, command: &DoseCommand, timeout: Duration) -> SendOutcome {
    future::block_on(future::or(pump.send(command), async {
        async_io_mini::Timer::after(timeout).await;
        SendOutcome::TimedOut
    }))
}

/// Map a pump answer to the recorded acknowledgment state.
pub const fn classify(outcome: SendOutcome) -> AckState {
    match outcome {
        SendOutcome::Acknowledged => AckState::Confirmed,
        SendOutcome::Rejected {
            delivery_ruled_out: true,
        } => AckState::Failed,
        SendOutcome::Rejected {
            delivery_ruled_out: false,
        }
        | SendOutcome::TimedOut => AckState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::MemoryStore;
    use crate::app::ports::PumpCapabilities;
    use crate::types::DoseKind;
    use chrono::TimeZone;
    use std::collections::VecDeque;

    struct ScriptedPump {
        script: VecDeque<SendOutcome>,
        sent: Vec<DoseCommand>,
        hang: bool,
    }

    impl ScriptedPump {
        fn new(script: &[SendOutcome]) -> Self {
            Self {
                script: script.iter().copied().collect(),
                sent: Vec::new(),
                hang: false,
            }
        }
    }

    impl PumpPort for ScriptedPump {
        fn capabilities(&self) -> PumpCapabilities {
            PumpCapabilities {
                min_increment_mu: 50,
                max_bolus_mu: 10_000,
                max_basal_mu_per_hour: 5000,
            }
        }

        async fn send(&mut self, command: &DoseCommand) -> SendOutcome {
            self.sent.push(*command);
            if self.hang {
                return future::pending().await;
            }
            self.script.pop_front().unwrap_or(SendOutcome::Acknowledged)
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn dispatcher() -> Dispatcher<MemoryStore> {
        let log = EventLog::open(MemoryStore::new(), t0(), chrono::Duration::hours(24)).unwrap();
        Dispatcher::new(log, Duration::from_millis(50))
    }

    fn bolus(mu: u32) -> ApprovedDose {
        ApprovedDose {
            kind: DoseKind::Bolus,
            amount_mu: mu,
            duration_minutes: 0,
            proposed_mu: mu,
            binding: None,
        }
    }

    #[test]
    fn acknowledged_is_confirmed_and_logged_twice() {
        let mut d = dispatcher();
        let mut pump = ScriptedPump::new(&[SendOutcome::Acknowledged]);
        let ev = d.dispatch(&bolus(2000), t0(), t0(), &mut pump).unwrap();
        assert_eq!(ev.ack, AckState::Confirmed);
        assert_eq!(ev.issued_at, Some(t0()));
        // Pending + outcome.
        assert_eq!(d.log().store().len(), 2);
    }

    #[test]
    fn same_token_is_never_sent_twice() {
        let mut d = dispatcher();
        let mut pump = ScriptedPump::new(&[]);
        let a = d.dispatch(&bolus(2000), t0(), t0(), &mut pump).unwrap();
        let b = d.dispatch(&bolus(2000), t0(), t0(), &mut pump).unwrap();
        assert_eq!(a, b);
        assert_eq!(pump.sent.len(), 1);
    }

    #[test]
    fn clean_rejection_is_retried_once() {
        let mut d = dispatcher();
        let rejected = SendOutcome::Rejected {
            delivery_ruled_out: true,
        };
        let mut pump = ScriptedPump::new(&[rejected, SendOutcome::Acknowledged]);
        let ev = d.dispatch(&bolus(1000), t0(), t0(), &mut pump).unwrap();
        assert_eq!(ev.ack, AckState::Confirmed);
        assert_eq!(pump.sent.len(), 2);
        assert_eq!(pump.sent[1].attempt, 2);

        let mut pump = ScriptedPump::new(&[rejected, rejected]);
        let later = t0() + chrono::Duration::minutes(5);
        let ev = d.dispatch(&bolus(1000), later, later, &mut pump).unwrap();
        assert_eq!(ev.ack, AckState::Failed);
        assert_eq!(pump.sent.len(), 2);
    }

    #[test]
    fn possible_partial_delivery_is_unknown_and_not_retried() {
        let mut d = dispatcher();
        let mut pump = ScriptedPump::new(&[SendOutcome::Rejected {
            delivery_ruled_out: false,
        }]);
        let ev = d.dispatch(&bolus(1000), t0(), t0(), &mut pump).unwrap();
        assert_eq!(ev.ack, AckState::Unknown);
        assert_eq!(pump.sent.len(), 1);
    }

    #[test]
    fn timeout_is_unknown_and_not_retried() {
        let mut d = dispatcher();
        let mut pump = ScriptedPump::new(&[]);
        pump.hang = true;
        let ev = d.dispatch(&bolus(1000), t0(), t0(), &mut pump).unwrap();
        assert_eq!(ev.ack, AckState::Unknown);
        assert_eq!(pump.sent.len(), 1);
    }

    #[test]
    fn zero_bolus_is_not_dispatched() {
        let mut d = dispatcher();
        let mut pump = ScriptedPump::new(&[]);
        assert_eq!(
            d.dispatch(&bolus(0), t0(), t0(), &mut pump),
            Err(DispatchError::Empty)
        );
        assert!(pump.sent.is_empty());
    }

    #[test]
    fn failed_log_append_prevents_send() {
        let store = MemoryStore::with_capacity(0);
        let log = EventLog::open(store, t0(), chrono::Duration::hours(24)).unwrap();
        let mut d = Dispatcher::new(log, Duration::from_millis(50));
        let mut pump = ScriptedPump::new(&[]);
        assert!(matches!(
            d.dispatch(&bolus(1000), t0(), t0(), &mut pump),
            Err(DispatchError::LogBeforeSend(StorageError::Full))
        ));
        assert!(pump.sent.is_empty());
    }
}
