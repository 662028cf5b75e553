//! Append-only dose/meal event log.
//!
//! ```text
//!   Dispatcher ──append──▶ EventLog ──▶ PersistencePort (durable)
//!                              │
//!                              └──snapshot(from, to)──▶ LogSnapshot ──▶ ActivityModel
//! ```
//!
//! The log has exactly one writer (the [`Dispatcher`](crate::dispatch::Dispatcher),
//! which owns it) and any number of readers, each of which works from an
//! immutable [`LogSnapshot`] taken at cycle start.  Records are never
//! rewritten: a status change for a dose appends a new record with the same
//! idempotency token, and readers resolve each token to its latest record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::app::ports::{PersistencePort, StorageError};
use crate::types::{DoseEvent, DoseKind, IdempotencyToken, LogRecord, MealEvent};

/// Single-writer event log over a persistence collaborator.
pub struct EventLog<P: PersistencePort> {
    store: P,
    /// Latest record per token, for idempotency checks without a store read.
    /// Holds only doses requested within `window` of the newest append.
    latest: HashMap<IdempotencyToken, DoseEvent>,
    window: chrono::Duration,
}

impl<P: PersistencePort> EventLog<P> {
    /// Open the log, rebuilding the token index from the last
    /// `window` of persisted history.
    pub fn open(
        store: P,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Result<Self, StorageError> {
        let records = store.read_log(now - window, now)?;
        let mut latest = HashMap::new();
        for rec in &records {
            if let LogRecord::Dose(d) = rec {
                latest.insert(d.token, *d);
            }
        }
        info!(
            "EventLog: opened with {} records ({} doses indexed)",
            records.len(),
            latest.len()
        );
        let mut log = Self {
            store,
            latest,
            window,
        };
        log.prune(now);
        Ok(log)
    }

    /// Append a record.  Only the dispatcher holds `&mut EventLog`.
    pub(crate) fn append(&mut self, record: LogRecord) -> Result<(), StorageError> {
        if let Err(e) = self.store.append(&record) {
            warn!("EventLog: append failed: {}", e);
            return Err(e);
        }
        if let LogRecord::Dose(d) = record {
            self.latest.insert(d.token, d);
        }
        self.prune(record.timestamp());
        Ok(())
    }

    /// Drop index entries that fell out of the window ending at `now`.
    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - self.window;
        let before = self.latest.len();
        self.latest.retain(|_, d| d.requested_at >= horizon);
        let evicted = before - self.latest.len();
        if evicted > 0 {
            debug!("EventLog: evicted {} tokens older than {}", evicted, horizon);
        }
    }

    /// Number of doses in the token index.
    pub fn indexed(&self) -> usize {
        self.latest.len()
    }

    /// Latest known state of the dose carrying `token`.
    pub fn find(&self, token: &IdempotencyToken) -> Option<&DoseEvent> {
        self.latest.get(token)
    }

    /// Immutable view of `[from, to]`, resolved to one record per token.
    pub fn snapshot(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<LogSnapshot, StorageError> {
        let records = self.store.read_log(from, to)?;
        Ok(LogSnapshot::from_records(to, &records))
    }

    /// Borrow the underlying store (read-only).
    pub fn store(&self) -> &P {
        &self.store
    }
}

/// Read-consistent view of the log at one instant.
#[derive(Debug, Clone, Default)]
pub struct LogSnapshot {
    taken_at: Option<DateTime<Utc>>,
    doses: Vec<DoseEvent>,
    meals: Vec<MealEvent>,
}

impl LogSnapshot {
    /// Resolve raw records.  Records after `taken_at` are excluded; for each
    /// token the last record wins (records must be in append order).
    pub fn from_records(taken_at: DateTime<Utc>, records: &[LogRecord]) -> Self {
        let mut order: Vec<IdempotencyToken> = Vec::new();
        let mut latest: HashMap<IdempotencyToken, DoseEvent> = HashMap::new();
        let mut meals = Vec::new();

        for rec in records.iter().filter(|r| r.timestamp() <= taken_at) {
            match rec {
                LogRecord::Dose(d) => {
                    if latest.insert(d.token, *d).is_none() {
                        order.push(d.token);
                    }
                }
                LogRecord::Meal(m) => meals.push(*m),
            }
        }

        let mut doses: Vec<DoseEvent> = order.iter().filter_map(|t| latest.remove(t)).collect();
        doses.sort_by_key(|d| d.requested_at);
        meals.sort_by_key(|m| m.timestamp);

        Self {
            taken_at: Some(taken_at),
            doses,
            meals,
        }
    }

    /// Snapshot built directly from resolved events (tests, replay).
    pub fn from_events(doses: Vec<DoseEvent>, meals: Vec<MealEvent>) -> Self {
        let mut s = Self {
            taken_at: None,
            doses,
            meals,
        };
        s.doses.sort_by_key(|d| d.requested_at);
        s.meals.sort_by_key(|m| m.timestamp);
        s
    }

    pub fn taken_at(&self) -> Option<DateTime<Utc>> {
        self.taken_at
    }

    /// Resolved doses, ordered by request time.
    pub fn doses(&self) -> &[DoseEvent] {
        &self.doses
    }

    /// Meals, ordered by timestamp.
    pub fn meals(&self) -> &[MealEvent] {
        &self.meals
    }

    /// Most recent bolus that must be assumed delivered.
    pub fn last_counted_bolus(&self) -> Option<&DoseEvent> {
        self.doses
            .iter()
            .rev()
            .find(|d| d.kind == DoseKind::Bolus && d.ack.counts_as_delivered())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::MemoryStore;
    use crate::types::AckState;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn bolus(at: DateTime<Utc>, mu: u32, ack: AckState) -> DoseEvent {
        DoseEvent {
            token: IdempotencyToken::new(at, DoseKind::Bolus),
            kind: DoseKind::Bolus,
            amount_mu: mu,
            duration_minutes: 0,
            requested_at: at,
            issued_at: Some(at),
            ack,
        }
    }

    #[test]
    fn later_record_supersedes_earlier() {
        let mut log = EventLog::open(MemoryStore::new(), t0(), Duration::hours(24)).unwrap();
        let pending = bolus(t0(), 1000, AckState::Pending);
        log.append(LogRecord::Dose(pending)).unwrap();
        log.append(LogRecord::Dose(DoseEvent {
            ack: AckState::Confirmed,
            ..pending
        }))
        .unwrap();

        let snap = log.snapshot(t0() - Duration::hours(1), t0()).unwrap();
        assert_eq!(snap.doses().len(), 1);
        assert_eq!(snap.doses()[0].ack, AckState::Confirmed);
        assert_eq!(log.find(&pending.token).unwrap().ack, AckState::Confirmed);
        // Both records remain in the store.
        assert_eq!(log.store().len(), 2);
    }

    #[test]
    fn snapshot_excludes_future_records() {
        let records = [
            LogRecord::Dose(bolus(t0(), 1000, AckState::Confirmed)),
            LogRecord::Dose(bolus(t0() + Duration::minutes(10), 500, AckState::Confirmed)),
        ];
        let snap = LogSnapshot::from_records(t0() + Duration::minutes(5), &records);
        assert_eq!(snap.doses().len(), 1);
    }

    #[test]
    fn reopen_rebuilds_token_index() {
        let mut log = EventLog::open(MemoryStore::new(), t0(), Duration::hours(24)).unwrap();
        let d = bolus(t0(), 800, AckState::Unknown);
        log.append(LogRecord::Dose(d)).unwrap();
        let store = log.store().clone();

        let reopened = EventLog::open(store, t0() + Duration::minutes(5), Duration::hours(24)).unwrap();
        assert_eq!(reopened.find(&d.token).unwrap().ack, AckState::Unknown);
    }

    #[test]
    fn token_index_stays_within_window() {
        let mut log = EventLog::open(MemoryStore::new(), t0(), Duration::hours(24)).unwrap();
        // Three days of 5-minute doses.
        for i in 0..864 {
            let at = t0() + Duration::minutes(5 * i);
            log.append(LogRecord::Dose(bolus(at, 100, AckState::Confirmed))).unwrap();
        }
        assert_eq!(log.indexed(), 289);

        let first = IdempotencyToken::new(t0(), DoseKind::Bolus);
        assert!(log.find(&first).is_none());
        let last = t0() + Duration::minutes(5 * 863);
        assert!(log.find(&IdempotencyToken::new(last, DoseKind::Bolus)).is_some());
        // The durable log keeps everything.
        assert_eq!(log.store().len(), 864);
    }

    #[test]
    fn reopen_indexes_only_the_window() {
        let mut log = EventLog::open(MemoryStore::new(), t0(), Duration::hours(48)).unwrap();
        log.append(LogRecord::Dose(bolus(t0(), 100, AckState::Confirmed))).unwrap();
        log.append(LogRecord::Dose(bolus(t0() + Duration::hours(30), 100, AckState::Confirmed)))
            .unwrap();
        let store = log.store().clone();

        let reopened = EventLog::open(store, t0() + Duration::hours(31), Duration::hours(24)).unwrap();
        assert_eq!(reopened.indexed(), 1);
    }

    #[test]
    fn last_counted_bolus_skips_failed() {
        let snap = LogSnapshot::from_events(
            vec![
                bolus(t0(), 1000, AckState::Confirmed),
                bolus(t0() + Duration::minutes(5), 1000, AckState::Failed),
            ],
            vec![],
        );
        assert_eq!(snap.last_counted_bolus().unwrap().requested_at, t0());
    }
}
