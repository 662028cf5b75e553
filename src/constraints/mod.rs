//! Constraint pipeline.
//!
//! An ordered chain of independent safety units.  Each unit sees the range
//! narrowed by everything before it plus the full cycle context, and
//! answers with a range or a veto:
//!
//! ```text
//!   proposal ─▶ [0, ∞) ─▶ LoopMode ─▶ LowGlucoseSuspend ─▶ MaxBolus ─▶ … ─▶ Hardware
//!                  │          │              │                │               │
//!                  └──────────┴── verdict ───┴── verdict ─────┴── verdict ────┘
//!                                                                            │
//!                                 clamp(proposal, range) ─▶ round down ─▶ ApprovedDose
//! ```
//!
//! ## Invariants
//!
//! - Every returned range is intersected with its input, so a unit can
//!   only narrow.  An empty intersection is a pipeline fault, never a dose.
//! - A veto short-circuits: later units do not run and the verdict chain
//!   ends at the vetoing unit.
//! - Rounding to the pump increment happens once, after all narrowing.

mod guards;
mod limits;

use core::fmt;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::{ConfigError, PumpCapabilities};
use crate::config::{EngineConfig, LoopMode, SafetyLimits};
use crate::error::PipelineError;
use crate::profile::Profile;
use crate::strategy::ProposedDose;
use crate::types::{DoseKind, Milliunits};

pub use guards::{BolusIntervalUnit, LoopModeUnit, LowGlucoseSuspendUnit};
pub use limits::{HardwareUnit, MaxBasalUnit, MaxBolusUnit, MaxIobUnit};

/// Upper bound on pipeline length (sizes the verdict buffer).
pub const MAX_UNITS: usize = 8;

// ---------------------------------------------------------------------------
// Ranges
// ---------------------------------------------------------------------------

/// Closed interval of permitted amounts.  Bolus: mU.  Basal: mU/h.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoseRange {
    pub min: Milliunits,
    pub max: Milliunits,
}

impl DoseRange {
    /// The unconstrained starting range.
    pub const FULL: Self = Self {
        min: 0,
        max: Milliunits::MAX,
    };

    pub const fn new(min: Milliunits, max: Milliunits) -> Self {
        Self { min, max }
    }

    /// `[0, max]`.
    pub const fn up_to(max: Milliunits) -> Self {
        Self { min: 0, max }
    }

    pub const fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub const fn contains(&self, amount: Milliunits) -> bool {
        amount >= self.min && amount <= self.max
    }

    /// Set intersection; `None` when disjoint.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let r = Self {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        };
        (!r.is_empty()).then_some(r)
    }

    pub fn clamp(&self, amount: Milliunits) -> Milliunits {
        amount.clamp(self.min, self.max)
    }
}

impl fmt::Display for DoseRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.max == Milliunits::MAX {
            write!(f, "[{}, ∞)", self.min)
        } else {
            write!(f, "[{}, {}]", self.min, self.max)
        }
    }
}

// ---------------------------------------------------------------------------
// Unit identity
// ---------------------------------------------------------------------------

/// Every constraint unit the pipeline knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintKind {
    LoopMode,
    LowGlucoseSuspend,
    MaxBolus,
    MaxBasal,
    MaxIob,
    BolusInterval,
    Hardware,
}

impl ConstraintKind {
    /// Evaluation order used when the configuration does not override it.
    pub const DEFAULT_ORDER: [Self; 7] = [
        Self::LoopMode,
        Self::LowGlucoseSuspend,
        Self::MaxBolus,
        Self::MaxBasal,
        Self::MaxIob,
        Self::BolusInterval,
        Self::Hardware,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::LoopMode => "loop-mode",
            Self::LowGlucoseSuspend => "low-glucose-suspend",
            Self::MaxBolus => "max-bolus",
            Self::MaxBasal => "max-basal",
            Self::MaxIob => "max-iob",
            Self::BolusInterval => "bolus-interval",
            Self::Hardware => "hardware",
        }
    }

    fn build(self) -> Box<dyn ConstraintUnit> {
        match self {
            Self::LoopMode => Box::new(LoopModeUnit),
            Self::LowGlucoseSuspend => Box::new(LowGlucoseSuspendUnit),
            Self::MaxBolus => Box::new(MaxBolusUnit),
            Self::MaxBasal => Box::new(MaxBasalUnit),
            Self::MaxIob => Box::new(MaxIobUnit),
            Self::BolusInterval => Box::new(BolusIntervalUnit),
            Self::Hardware => Box::new(HardwareUnit),
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a unit may consult.  Built once per cycle.
#[derive(Debug, Clone, Copy)]
pub struct ConstraintContext<'a> {
    pub now: DateTime<Utc>,
    /// Newest glucose reading (mg/dL).
    pub glucose_mg_dl: f64,
    pub iob_mu: Milliunits,
    pub profile: &'a Profile,
    pub limits: &'a SafetyLimits,
    pub loop_mode: LoopMode,
    pub capabilities: PumpCapabilities,
    /// Request time of the most recent bolus that counts as delivered.
    pub last_bolus_at: Option<DateTime<Utc>>,
}

impl ConstraintContext<'_> {
    /// Scheduled basal at `now` (mU/h).
    pub fn scheduled_basal(&self) -> Milliunits {
        self.profile.basal_at(self.now)
    }
}

// ---------------------------------------------------------------------------
// Unit trait
// ---------------------------------------------------------------------------

/// Answer from a single unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitDecision {
    /// Permitted range (intersected with the input by the pipeline).
    Range(DoseRange),
    /// Hard stop with a human-readable reason.
    Veto(String),
}

/// One independently-owned safety rule.
pub trait ConstraintUnit: Send + Sync {
    fn kind(&self) -> ConstraintKind;

    fn evaluate(
        &self,
        dose: &ProposedDose,
        range: DoseRange,
        ctx: &ConstraintContext<'_>,
    ) -> UnitDecision;
}

/// Record of one unit's evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConstraintVerdict {
    pub unit: ConstraintKind,
    pub input: DoseRange,
    /// Equal to `input` for a veto.
    pub output: DoseRange,
    pub veto: Option<String>,
}

pub type VerdictChain = heapless::Vec<ConstraintVerdict, MAX_UNITS>;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// A dose that has passed every unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ApprovedDose {
    pub kind: DoseKind,
    /// Final amount after clamping and rounding (mU or mU/h).
    pub amount_mu: Milliunits,
    /// Basal duration (0 for boluses).
    pub duration_minutes: u16,
    /// What the strategy asked for.
    pub proposed_mu: Milliunits,
    /// First unit that set the final upper bound, when it cut the proposal.
    pub binding: Option<ConstraintKind>,
}

impl ApprovedDose {
    /// A zero bolus has no effect and is not dispatched.  A zero basal
    /// rate is a real command (suspend).
    pub fn is_noop(&self) -> bool {
        self.kind == DoseKind::Bolus && self.amount_mu == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PipelineDecision {
    Approved(ApprovedDose),
    Vetoed { by: ConstraintKind, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineOutcome {
    pub verdicts: VerdictChain,
    /// Range left after the last evaluated unit.
    pub final_range: DoseRange,
    pub decision: PipelineDecision,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Ordered chain of constraint units.
pub struct ConstraintPipeline {
    units: Vec<Box<dyn ConstraintUnit>>,
}

impl ConstraintPipeline {
    /// Build the units named by `config.pipeline`, in that order.
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        Self::from_kinds(&config.pipeline)
    }

    pub fn from_kinds(kinds: &[ConstraintKind]) -> Result<Self, ConfigError> {
        Self::with_units(kinds.iter().map(|k| k.build()).collect())
    }

    /// Build from arbitrary units (embedders, tests).
    pub fn with_units(units: Vec<Box<dyn ConstraintUnit>>) -> Result<Self, ConfigError> {
        if units.is_empty() {
            return Err(ConfigError::ValidationFailed("pipeline must not be empty"));
        }
        if units.len() > MAX_UNITS {
            return Err(ConfigError::ValidationFailed("pipeline has too many units"));
        }
        info!(
            "Constraint pipeline: {}",
            units
                .iter()
                .map(|u| u.kind().name())
                .collect::<Vec<_>>()
                .join(" → ")
        );
        Ok(Self { units })
    }

    pub fn order(&self) -> Vec<ConstraintKind> {
        self.units.iter().map(|u| u.kind()).collect()
    }

    /// Run `dose` through every unit.
    pub fn apply(
        &self,
        dose: &ProposedDose,
        ctx: &ConstraintContext<'_>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let increment = ctx.capabilities.min_increment_mu;
        if increment == 0 {
            return Err(PipelineError::ZeroIncrement);
        }

        let mut verdicts = VerdictChain::new();
        let mut range = DoseRange::FULL;

        for unit in &self.units {
            let kind = unit.kind();
            match unit.evaluate(dose, range, ctx) {
                UnitDecision::Veto(reason) => {
                    warn!("Constraint {kind} vetoed {} {}: {reason}", dose.kind.tag(), dose.amount_mu);
                    push(
                        &mut verdicts,
                        ConstraintVerdict {
                            unit: kind,
                            input: range,
                            output: range,
                            veto: Some(reason.clone()),
                        },
                    )?;
                    return Ok(PipelineOutcome {
                        verdicts,
                        final_range: range,
                        decision: PipelineDecision::Vetoed { by: kind, reason },
                    });
                }
                UnitDecision::Range(returned) => {
                    let narrowed = range
                        .intersect(&returned)
                        .ok_or(PipelineError::EmptyRange(kind))?;
                    push(
                        &mut verdicts,
                        ConstraintVerdict {
                            unit: kind,
                            input: range,
                            output: narrowed,
                            veto: None,
                        },
                    )?;
                    range = narrowed;
                }
            }
        }

        let clamped = range.clamp(dose.amount_mu);
        let amount = round_down(clamped, increment);
        if amount < range.min {
            return Err(PipelineError::Undeliverable {
                min: range.min,
                increment,
            });
        }

        let binding = (dose.amount_mu > range.max)
            .then(|| binding_constraint(&verdicts, range.max))
            .flatten();

        Ok(PipelineOutcome {
            verdicts,
            final_range: range,
            decision: PipelineDecision::Approved(ApprovedDose {
                kind: dose.kind,
                amount_mu: amount,
                duration_minutes: dose.duration_minutes,
                proposed_mu: dose.amount_mu,
                binding,
            }),
        })
    }
}

fn push(chain: &mut VerdictChain, verdict: ConstraintVerdict) -> Result<(), PipelineError> {
    chain.push(verdict).map_err(|_| PipelineError::TooManyUnits)
}

/// First unit whose narrowing produced `final_max`.
pub fn binding_constraint(verdicts: &[ConstraintVerdict], final_max: Milliunits) -> Option<ConstraintKind> {
    verdicts
        .iter()
        .find(|v| v.output.max == final_max && v.input.max > final_max)
        .map(|v| v.unit)
}

/// Largest multiple of `increment` not above `amount`.
pub fn round_down(amount: Milliunits, increment: Milliunits) -> Milliunits {
    if increment == 0 {
        return amount;
    }
    amount - amount % increment
}
