//! Loop cycle result types.
//!
//! A [`LoopCycleResult`] is the immutable record of one cycle: what the
//! loop saw, what the strategy asked for, how each constraint bounded it,
//! what (if anything) went to the pump, and why.

use core::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::app::ports::TriggerKind;
use crate::config::LoopMode;
use crate::constraints::{ApprovedDose, ConstraintKind, VerdictChain};
use crate::error::FaultKind;
use crate::strategy::Proposal;
use crate::types::{DoseEvent, Milliunits, Trend};

/// Why a cycle ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReasonCode {
    /// Dose dispatched and confirmed.
    Dosed,
    /// Open loop: approved dose surfaced, not sent.
    Suggested,
    /// Strategy proposed no deviation.
    NoChange,
    /// Newest reading missing or older than the staleness threshold.
    StaleData,
    /// Sensor collaborator failed or returned implausible data.
    SensorFault,
    /// Low-glucose-suspend veto.
    Suspended,
    /// Any other constraint veto.
    Vetoed(ConstraintKind),
    /// Constraints narrowed the bolus to nothing.
    ClampedToZero,
    StrategyFault,
    PipelineFault,
    ConfigurationFault,
    DispatchUnknown,
    DispatchRejected,
    /// The event log could not record the dose.
    StorageFault,
    /// Cancelled before dispatch.
    Cancelled,
}

impl ReasonCode {
    /// Fault classification, `None` for nominal outcomes.
    pub const fn fault(self) -> Option<FaultKind> {
        match self {
            Self::Dosed | Self::Suggested | Self::NoChange | Self::Cancelled => None,
            Self::StaleData | Self::SensorFault => Some(FaultKind::StaleInput),
            Self::Suspended | Self::Vetoed(_) | Self::ClampedToZero => Some(FaultKind::ConstraintVeto),
            Self::StrategyFault => Some(FaultKind::StrategyFault),
            Self::PipelineFault => Some(FaultKind::ConstraintFault),
            Self::ConfigurationFault => Some(FaultKind::ConfigurationFault),
            Self::DispatchUnknown => Some(FaultKind::DispatchUnknown),
            Self::DispatchRejected => Some(FaultKind::DispatchRejected),
            Self::StorageFault => Some(FaultKind::StorageFault),
        }
    }

    /// Nominal outcomes need no notification.
    pub const fn is_nominal(self) -> bool {
        self.fault().is_none() && !matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dosed => write!(f, "dosed"),
            Self::Suggested => write!(f, "suggested"),
            Self::NoChange => write!(f, "no change"),
            Self::StaleData => write!(f, "no dose, stale data"),
            Self::SensorFault => write!(f, "no dose, sensor fault"),
            Self::Suspended => write!(f, "no dose, suspended"),
            Self::Vetoed(kind) => write!(f, "no dose, vetoed by {kind}"),
            Self::ClampedToZero => write!(f, "no dose, constrained to zero"),
            Self::StrategyFault => write!(f, "no dose, strategy fault"),
            Self::PipelineFault => write!(f, "no dose, constraint pipeline fault"),
            Self::ConfigurationFault => write!(f, "no dose, configuration fault"),
            Self::DispatchUnknown => write!(f, "delivery unknown"),
            Self::DispatchRejected => write!(f, "delivery rejected"),
            Self::StorageFault => write!(f, "event log fault"),
            Self::Cancelled => write!(f, "no dose, cancelled"),
        }
    }
}

/// What the cycle gathered.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct InputSummary {
    pub reading_count: usize,
    pub newest_glucose_mg_dl: Option<f64>,
    pub newest_reading_at: Option<DateTime<Utc>>,
    pub trend: Option<Trend>,
    pub iob_mu: Option<Milliunits>,
    pub cob_g: Option<f64>,
    pub profile_name: Option<String>,
    pub scheduled_basal_mu_per_hour: Option<Milliunits>,
}

/// Immutable outcome of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopCycleResult {
    pub cycle_id: u64,
    pub started_at: DateTime<Utc>,
    pub trigger: TriggerKind,
    pub loop_mode: LoopMode,
    pub strategy: &'static str,
    pub inputs: InputSummary,
    pub proposal: Option<Proposal>,
    pub verdicts: VerdictChain,
    pub approved: Option<ApprovedDose>,
    pub delivery: Option<DoseEvent>,
    pub reason: ReasonCode,
    pub detail: String,
}

impl LoopCycleResult {
    pub fn fault(&self) -> Option<FaultKind> {
        self.reason.fault()
    }

    /// Whether the outcome needs user/clinician attention.
    pub fn requires_attention(&self) -> bool {
        self.fault().is_some_and(FaultKind::requires_attention)
    }

    /// Unit that set the approved amount's ceiling, if any.
    pub fn binding_constraint(&self) -> Option<ConstraintKind> {
        self.approved.and_then(|a| a.binding)
    }
}
