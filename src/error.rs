//! Unified error types for the dosing engine.
//!
//! A single [`Error`] enum that every subsystem converts into, keeping the
//! orchestrator's error handling uniform.  Port-level errors
//! ([`ConfigError`], [`StorageError`], [`AuditError`]) live next to the
//! port traits in [`crate::app::ports`].
//!
//! [`FaultKind`] is the cycle-level taxonomy: it classifies *why* a cycle
//! produced no dose (or an ambiguous one) and whether the outcome needs
//! someone's attention.

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::ports::{AuditError, ConfigError, StorageError};
use crate::constraints::ConstraintKind;
use crate::types::DoseEvent;

// ---------------------------------------------------------------------------
// Top-level engine error
// ---------------------------------------------------------------------------

/// Every fallible operation in the engine funnels into this type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("sensor: {0}")]
    Sensor(#[from] SensorError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("strategy: {0}")]
    Strategy(#[from] StrategyError),
    #[error("constraint pipeline: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("dispatch: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("audit: {0}")]
    Audit(#[from] AuditError),
}

/// Engine-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

// ---------------------------------------------------------------------------
// Sensor errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorError {
    /// The sensor collaborator could not be reached.
    #[error("sensor unavailable")]
    Unavailable,
    /// Readings were returned out of timestamp order.
    #[error("readings out of order")]
    OutOfOrder,
    /// A reading is outside the physically plausible range.
    #[error("reading out of range")]
    OutOfRange,
}

// ---------------------------------------------------------------------------
// Strategy errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StrategyError {
    /// A computed quantity was NaN or infinite.
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),
    /// The profile segment cannot drive this strategy (e.g. zero ISF).
    #[error("unusable profile: {0}")]
    UnusableProfile(&'static str),
    /// The strategy panicked; message captured at the orchestrator boundary.
    #[error("strategy panicked: {0}")]
    Panicked(String),
    /// Any other internal strategy failure.
    #[error("{0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// Constraint pipeline errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// A unit returned a range disjoint from what it received.
    #[error("{0} produced an empty dose range")]
    EmptyRange(ConstraintKind),
    /// The pump reported a zero minimum increment.
    #[error("pump minimum increment is zero")]
    ZeroIncrement,
    /// Rounding down to the pump increment fell below a unit's minimum.
    #[error("no deliverable amount ≥ {min} in steps of {increment}")]
    Undeliverable { min: u32, increment: u32 },
    /// More units than the verdict buffer holds.
    #[error("too many constraint units")]
    TooManyUnits,
}

// ---------------------------------------------------------------------------
// Dispatch errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The event log refused the pending record; nothing was sent.
    #[error("event log append failed before send: {0}")]
    LogBeforeSend(StorageError),
    /// The pump outcome could not be recorded.  `event` carries the real
    /// outcome; the log still holds the Pending record, which counts as
    /// delivered.
    #[error("event log append failed after send ({}): {error}", event.token)]
    LogAfterSend {
        event: DoseEvent,
        error: StorageError,
    },
    /// Nothing to dispatch (zero-amount bolus).
    #[error("nothing to dispatch")]
    Empty,
}

// ---------------------------------------------------------------------------
// Cycle fault taxonomy
// ---------------------------------------------------------------------------

/// Classification of non-nominal cycle outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// Sensor data older than the staleness threshold.
    StaleInput,
    /// The dosing strategy failed.
    StrategyFault,
    /// A constraint vetoed the proposal (expected, non-exceptional).
    ConstraintVeto,
    /// The constraint pipeline itself failed.
    ConstraintFault,
    /// Delivery outcome is ambiguous; counted as delivered, never retried.
    DispatchUnknown,
    /// Pump refused the command (after the single permitted retry).
    DispatchRejected,
    /// Profile or configuration missing or invalid.
    ConfigurationFault,
    /// The event log refused a write.
    StorageFault,
}

impl FaultKind {
    /// Faults that need user/clinician attention rather than simply waiting
    /// for the next cycle.
    pub const fn requires_attention(self) -> bool {
        matches!(
            self,
            Self::DispatchRejected
                | Self::DispatchUnknown
                | Self::ConfigurationFault
                | Self::StorageFault
        )
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaleInput => write!(f, "stale input"),
            Self::StrategyFault => write!(f, "strategy fault"),
            Self::ConstraintVeto => write!(f, "constraint veto"),
            Self::ConstraintFault => write!(f, "constraint fault"),
            Self::DispatchUnknown => write!(f, "dispatch outcome unknown"),
            Self::DispatchRejected => write!(f, "dispatch rejected"),
            Self::ConfigurationFault => write!(f, "configuration fault"),
            Self::StorageFault => write!(f, "storage fault"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attention_required_only_for_hard_faults() {
        assert!(FaultKind::DispatchRejected.requires_attention());
        assert!(FaultKind::ConfigurationFault.requires_attention());
        assert!(!FaultKind::StaleInput.requires_attention());
        assert!(!FaultKind::ConstraintVeto.requires_attention());
    }

    #[test]
    fn umbrella_conversion_keeps_message() {
        let e: Error = SensorError::Unavailable.into();
        assert_eq!(e.to_string(), "sensor: sensor unavailable");
        let e: Error = PipelineError::EmptyRange(ConstraintKind::MaxBolus).into();
        assert_eq!(e.to_string(), "constraint pipeline: max-bolus produced an empty dose range");
    }
}
