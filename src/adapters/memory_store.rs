//! In-memory event-log store.
//!
//! Implements [`PersistencePort`] over a vector of postcard-encoded
//! records, the same byte layout a flash-backed log would hold.  Used by
//! the simulator and the test suites.
//!
//! Records are kept in append order; `read_log` decodes, filters by
//! timestamp and stable-sorts, so records with equal timestamps come back
//! in the order they were appended.

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::app::ports::{PersistencePort, StorageError};
use crate::types::LogRecord;

/// Default record capacity (a week of 5-minute cycles with headroom).
const DEFAULT_CAPACITY: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct MemoryStore {
    records: Vec<Vec<u8>>,
    capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A store that refuses appends beyond `capacity` records.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Decode every stored record in append order.
    pub fn records(&self) -> Result<Vec<LogRecord>, StorageError> {
        self.records
            .iter()
            .enumerate()
            .map(|(i, bytes)| postcard::from_bytes(bytes).map_err(|_| StorageError::Corrupted(i)))
            .collect()
    }

    /// Append raw bytes, bypassing encoding (corruption tests, fuzzing).
    pub fn push_raw(&mut self, bytes: Vec<u8>) {
        self.records.push(bytes);
    }
}

impl PersistencePort for MemoryStore {
    fn append(&mut self, record: &LogRecord) -> Result<(), StorageError> {
        if self.records.len() >= self.capacity {
            warn!("MemoryStore: full ({} records)", self.capacity);
            return Err(StorageError::Full);
        }
        let bytes = postcard::to_allocvec(record).map_err(|_| StorageError::IoError)?;
        debug!("MemoryStore: append {} bytes", bytes.len());
        self.records.push(bytes);
        Ok(())
    }

    fn read_log(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<LogRecord>, StorageError> {
        let mut out: Vec<LogRecord> = self
            .records()?
            .into_iter()
            .filter(|r| (from..=to).contains(&r.timestamp()))
            .collect();
        out.sort_by_key(LogRecord::timestamp);
        Ok(out)
    }
}
