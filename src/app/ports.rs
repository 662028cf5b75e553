//! Port traits: the hexagonal boundary between the dosing core and its
//! collaborators.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ LoopService (domain)
//! ```
//!
//! Sensor, pump, persistence, profile, audit and notification
//! collaborators implement these traits.  The
//! [`LoopService`](super::service::LoopService) consumes them via generics,
//! so the core never talks to a device or a database directly.
//!
//! ## Safety notes
//!
//! - **PersistencePort** implementations MUST make `append` durable before
//!   returning `Ok`; the dispatcher relies on the pending record surviving
//!   a crash between send and acknowledgment.
//! - **PumpPort::send** MUST NOT retry internally.  Retry policy belongs to
//!   the dispatcher, which alone knows whether a retry could double-deliver.
//! - All port errors are typed; callers must handle every variant explicitly.

use core::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::AuditRecord;
use crate::error::SensorError;
use crate::profile::Profile;
use crate::types::{DoseKind, GlucoseReading, IdempotencyToken, LogRecord, Milliunits};

// ───────────────────────────────────────────────────────────────
// Sensor port (collaborator → domain)
// ───────────────────────────────────────────────────────────────

/// Pull-side port for calibrated glucose readings.
pub trait SensorPort {
    /// Readings with `timestamp >= since`, oldest first.
    fn latest_readings(&mut self, since: DateTime<Utc>) -> Result<Vec<GlucoseReading>, SensorError>;
}

// ───────────────────────────────────────────────────────────────
// Pump port (domain → collaborator)
// ───────────────────────────────────────────────────────────────

/// What the pump hardware can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpCapabilities {
    /// Smallest deliverable step (mU for boluses, mU/h for basal rates).
    pub min_increment_mu: Milliunits,
    pub max_bolus_mu: Milliunits,
    pub max_basal_mu_per_hour: Milliunits,
}

/// A discrete command handed to the pump collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoseCommand {
    pub token: IdempotencyToken,
    pub kind: DoseKind,
    /// Bolus: mU.  Basal: mU/h.
    pub amount_mu: Milliunits,
    pub duration_minutes: u16,
    /// 1 for the first send, 2 for the single permitted retry.
    pub attempt: u8,
}

/// Pump collaborator's answer to a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendOutcome {
    /// Delivery acknowledged.
    Acknowledged,
    /// The pump refused the command.  `delivery_ruled_out` is true only
    /// when the pump confirms nothing was delivered.
    Rejected { delivery_ruled_out: bool },
    /// The collaborator gave up waiting for the pump.
    TimedOut,
}

/// Command/acknowledgment interface to the insulin pump.
pub trait PumpPort {
    fn capabilities(&self) -> PumpCapabilities;

    /// Send a command.  May suspend pending acknowledgment; the dispatcher
    /// bounds the wait.
    fn send(&mut self, command: &DoseCommand) -> impl Future<Output = SendOutcome>;
}

// ───────────────────────────────────────────────────────────────
// Persistence port (domain ↔ durable event log)
// ───────────────────────────────────────────────────────────────

/// Durable append-only storage for dose and meal records.
pub trait PersistencePort {
    /// Append one record durably.
    fn append(&mut self, record: &LogRecord) -> Result<(), StorageError>;

    /// Records with timestamp in `[from, to]`, ordered by timestamp, with
    /// records of equal timestamp in append order.
    fn read_log(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<LogRecord>, StorageError>;
}

// ───────────────────────────────────────────────────────────────
// Profile port (configuration collaborator → domain)
// ───────────────────────────────────────────────────────────────

/// Resolves the profile version active at an instant.
pub trait ProfilePort {
    fn active_profile(&self, at: DateTime<Utc>) -> Result<Arc<Profile>, ConfigError>;
}

// ───────────────────────────────────────────────────────────────
// Audit / notification ports (domain → observability)
// ───────────────────────────────────────────────────────────────

/// Receives one structured record per completed cycle.
pub trait AuditSink {
    fn record(&mut self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// The domain emits structured [`AppEvent`](super::events::AppEvent)s
/// through this port.  Adapters decide where they go (log, UI, push).
pub trait EventSink {
    fn emit(&mut self, event: &super::events::AppEvent);
}

// ───────────────────────────────────────────────────────────────
// Clock
// ───────────────────────────────────────────────────────────────

/// Wall-clock source for the runner and scheduler.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

// ───────────────────────────────────────────────────────────────
// Trigger delegate (decouples scheduler from the runner)
// ───────────────────────────────────────────────────────────────

/// Callback the [`CycleScheduler`](crate::scheduler::CycleScheduler)
/// invokes when a cycle should start.  The scheduler knows nothing about
/// runners, locks or pumps.
pub trait TriggerDelegate {
    fn on_trigger(&mut self, kind: TriggerKind, at: DateTime<Utc>);
}

/// Why a cycle was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerKind {
    /// The fixed cadence elapsed.
    Cadence,
    /// A new glucose reading arrived.
    FreshData,
    /// Explicit request (e.g. after a meal announcement).
    Manual,
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from configuration and profile lookups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// No profile/config is active.
    #[error("config not found")]
    NotFound,
    /// Stored config failed integrity / deserialization check.
    #[error("config corrupted")]
    Corrupted,
    /// A field failed range validation.
    /// The `&'static str` describes which field and why.
    #[error("validation failed: {0}")]
    ValidationFailed(&'static str),
}

/// Errors from [`PersistencePort`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Storage is full.
    #[error("storage full")]
    Full,
    /// Generic I/O error.
    #[error("I/O error")]
    IoError,
    /// A stored record failed to decode.
    #[error("corrupted record at index {0}")]
    Corrupted(usize),
}

/// Errors from [`AuditSink`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditError {
    /// The observability collaborator is not accepting records.
    #[error("audit sink unavailable")]
    Unavailable,
    /// The record could not be serialised, so none was built.
    #[error("audit encode failed: {0}")]
    Encode(String),
}

impl AuditError {
    /// Whether the record behind this error is still held for replay.
    pub const fn is_buffered(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}
