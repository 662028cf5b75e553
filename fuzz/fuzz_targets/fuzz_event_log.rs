//! Fuzz target: event log store
//!
//! Feeds arbitrary byte records into a `MemoryStore` next to valid ones
//! and verifies:
//! - No panics decoding corrupted records
//! - Corruption surfaces as `StorageError::Corrupted`, never as bogus data
//! - Snapshots of a clean log resolve one event per token
//!
//! cargo fuzz run fuzz_event_log

#![no_main]

use apsloop::activity::log::{EventLog, LogSnapshot};
use apsloop::adapters::memory_store::MemoryStore;
use apsloop::app::ports::{PersistencePort, StorageError};
use apsloop::types::{AckState, DoseEvent, DoseKind, IdempotencyToken, LogRecord};
use chrono::{Duration, TimeZone, Utc};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

    // Valid records derived from the input.
    let mut store = MemoryStore::new();
    let mut records = Vec::new();
    for (i, chunk) in data.chunks(4).take(32).enumerate() {
        let minute = i64::from(chunk[0] % 120);
        let at = now - Duration::minutes(minute);
        let ack = match chunk.get(1).copied().unwrap_or(0) % 4 {
            0 => AckState::Pending,
            1 => AckState::Confirmed,
            2 => AckState::Failed,
            _ => AckState::Unknown,
        };
        let record = LogRecord::Dose(DoseEvent {
            token: IdempotencyToken::new(at, DoseKind::Bolus),
            kind: DoseKind::Bolus,
            amount_mu: u32::from(chunk.get(2).copied().unwrap_or(0)) * 50,
            duration_minutes: 0,
            requested_at: at,
            issued_at: Some(at),
            ack,
        });
        if store.append(&record).is_ok() {
            records.push(record);
        }
    }

    let snapshot = LogSnapshot::from_records(now, &records);
    let mut tokens: Vec<_> = snapshot.doses().iter().map(|d| d.token).collect();
    tokens.sort_by_key(|t| t.cycle_ms);
    let before = tokens.len();
    tokens.dedup();
    assert_eq!(before, tokens.len(), "snapshot holds a token twice");

    let log = EventLog::open(store.clone(), now, Duration::hours(24)).unwrap();
    assert!(log.snapshot(now - Duration::hours(24), now).is_ok());

    // Raw bytes: either decode to something or report corruption.
    store.push_raw(data.to_vec());
    match store.read_log(now - Duration::hours(24), now) {
        Ok(_) | Err(StorageError::Corrupted(_)) => {}
        Err(other) => panic!("unexpected error {other:?}"),
    }
});
