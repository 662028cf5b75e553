//! Dosing strategies.
//!
//! A strategy turns a read-only snapshot of the cycle's inputs into an
//! unconstrained [`Proposal`].  It has no access to the pump or the event
//! log; everything it proposes still goes through the constraint pipeline.
//!
//! ```text
//!  StrategyInput ──▶ DosingStrategy::propose ──▶ insulin need (U)
//!                                                    │
//!                                need_to_dose ◀──────┘
//!                                    │
//!          need > 0, above target ───┼──▶ Bolus(need × bolus_fraction)
//!          need < 0 ─────────────────┼──▶ TempBasal(scheduled − need/duration, floor 0)
//!          otherwise ────────────────┴──▶ NoChange
//! ```
//!
//! The built-in set is closed ([`StrategyKind`]) and chosen once at startup
//! from [`StrategyConfig`]; embedders can plug their own through
//! [`StrategyKind::Custom`].

pub mod pid;
pub mod predictive;
pub mod replay;

use core::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::StrategyConfig;
use crate::error::StrategyError;
use crate::profile::ProfileSegment;
use crate::types::{ActivityState, DoseKind, GlucoseReading, Milliunits, mu_to_units, units_to_mu};

pub use pid::PidStrategy;
pub use predictive::PredictiveStrategy;
pub use replay::ProfileReplay;

// ---------------------------------------------------------------------------
// Proposal
// ---------------------------------------------------------------------------

/// A dose the strategy would like to issue, before any constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProposedDose {
    pub kind: DoseKind,
    /// Bolus: mU.  Basal: mU/h.
    pub amount_mu: Milliunits,
    /// Temp basal duration (0 for boluses).
    pub duration_minutes: u16,
}

impl ProposedDose {
    pub const fn bolus(amount_mu: Milliunits) -> Self {
        Self {
            kind: DoseKind::Bolus,
            amount_mu,
            duration_minutes: 0,
        }
    }

    pub const fn temp_basal(rate_mu_per_hour: Milliunits, duration_minutes: u16) -> Self {
        Self {
            kind: DoseKind::BasalRateChange,
            amount_mu: rate_mu_per_hour,
            duration_minutes,
        }
    }
}

/// Why a strategy declined to propose a dose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoChangeReason {
    NoData,
    StaleData,
    LowConfidence,
    WithinTarget,
    ProfileReplay,
}

impl fmt::Display for NoChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoData => "no glucose data",
            Self::StaleData => "newest reading is stale",
            Self::LowConfidence => "newest reading is low-confidence",
            Self::WithinTarget => "no correction needed",
            Self::ProfileReplay => "profile replay",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Proposal {
    NoChange(NoChangeReason),
    Dose(ProposedDose),
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Immutable snapshot handed to [`DosingStrategy::propose`].
#[derive(Debug, Clone, Copy)]
pub struct StrategyInput<'a> {
    pub now: DateTime<Utc>,
    /// Oldest first.
    pub glucose: &'a [GlucoseReading],
    pub activity: ActivityState,
    /// Profile segment active at `now` (carries the target range).
    pub segment: &'a ProfileSegment,
    pub scheduled_basal_mu_per_hour: Milliunits,
    pub stale_after: Duration,
    pub bolus_fraction: f64,
    pub temp_basal_minutes: u16,
}

impl StrategyInput<'_> {
    /// Newest reading, if it is present, fresh and confident.
    pub fn usable_newest(&self) -> Result<&GlucoseReading, NoChangeReason> {
        let newest = self.glucose.last().ok_or(NoChangeReason::NoData)?;
        if newest.age(self.now) > self.stale_after {
            return Err(NoChangeReason::StaleData);
        }
        if !newest.confident {
            return Err(NoChangeReason::LowConfidence);
        }
        Ok(newest)
    }

    /// ISF of the active segment, rejected when unusable.
    pub fn isf(&self) -> Result<f64, StrategyError> {
        let isf = self.segment.isf_mg_dl_per_u;
        if !isf.is_finite() || isf <= 0.0 {
            return Err(StrategyError::UnusableProfile("ISF must be positive"));
        }
        Ok(isf)
    }

    /// Carb ratio of the active segment, rejected when unusable.
    pub fn carb_ratio(&self) -> Result<f64, StrategyError> {
        let cr = self.segment.carb_ratio_g_per_u;
        if !cr.is_finite() || cr <= 0.0 {
            return Err(StrategyError::UnusableProfile("carb ratio must be positive"));
        }
        Ok(cr)
    }

    /// Least-squares glucose slope (mg/dL/min) over the last
    /// `window_minutes`, falling back to the trend arrow when fewer than
    /// two readings are available.
    pub fn slope(&self, window_minutes: i64) -> f64 {
        let from = self.now - Duration::minutes(window_minutes);
        let recent: Vec<&GlucoseReading> =
            self.glucose.iter().filter(|r| r.timestamp >= from).collect();
        match least_squares_slope(&recent) {
            Some(s) => s,
            None => self
                .glucose
                .last()
                .and_then(|r| r.trend.nominal_rate())
                .unwrap_or(0.0),
        }
    }
}

fn least_squares_slope(readings: &[&GlucoseReading]) -> Option<f64> {
    if readings.len() < 2 {
        return None;
    }
    let t0 = readings[0].timestamp;
    let xs: Vec<f64> = readings
        .iter()
        .map(|r| (r.timestamp - t0).num_seconds() as f64 / 60.0)
        .collect();
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = readings.iter().map(|r| r.value_mg_dl).sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (x, r) in xs.iter().zip(readings) {
        num += (x - mean_x) * (r.value_mg_dl - mean_y);
        den += (x - mean_x) * (x - mean_x);
    }
    (den > 0.0).then(|| num / den)
}

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

/// The single capability every dosing algorithm provides.
pub trait DosingStrategy {
    fn name(&self) -> &'static str;

    /// Must be a pure function of `input`.
    fn propose(&self, input: &StrategyInput<'_>) -> Result<Proposal, StrategyError>;
}

/// Strategy selected at startup.
pub enum StrategyKind {
    Pid(PidStrategy),
    Predictive(PredictiveStrategy),
    ProfileReplay(ProfileReplay),
    Custom(Box<dyn DosingStrategy + Send>),
}

impl StrategyKind {
    pub fn from_config(config: &StrategyConfig) -> Self {
        match *config {
            StrategyConfig::Pid {
                kp,
                ki,
                kd,
                integral_window_minutes,
            } => Self::Pid(PidStrategy::new(kp, ki, kd, integral_window_minutes)),
            StrategyConfig::Predictive { horizon_minutes } => {
                Self::Predictive(PredictiveStrategy::new(horizon_minutes))
            }
            StrategyConfig::ProfileReplay => Self::ProfileReplay(ProfileReplay),
        }
    }

    fn inner(&self) -> &dyn DosingStrategy {
        match self {
            Self::Pid(s) => s,
            Self::Predictive(s) => s,
            Self::ProfileReplay(s) => s,
            Self::Custom(s) => s.as_ref(),
        }
    }
}

impl DosingStrategy for StrategyKind {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn propose(&self, input: &StrategyInput<'_>) -> Result<Proposal, StrategyError> {
        self.inner().propose(input)
    }
}

impl fmt::Debug for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StrategyKind({})", self.name())
    }
}

// ---------------------------------------------------------------------------
// Need → dose
// ---------------------------------------------------------------------------

/// Map an insulin need (units, positive = more insulin) to a proposal.
pub fn need_to_dose(
    need_units: f64,
    glucose_mg_dl: f64,
    input: &StrategyInput<'_>,
) -> Result<Proposal, StrategyError> {
    if !need_units.is_finite() {
        return Err(StrategyError::NonFinite("insulin need"));
    }

    if need_units > 0.0 && glucose_mg_dl > input.segment.target_high {
        let bolus = units_to_mu(need_units * input.bolus_fraction);
        if bolus == 0 {
            return Ok(Proposal::NoChange(NoChangeReason::WithinTarget));
        }
        return Ok(Proposal::Dose(ProposedDose::bolus(bolus)));
    }

    if need_units < 0.0 {
        let minutes = f64::from(input.temp_basal_minutes.max(1));
        let reduction_u_per_hour = -need_units * 60.0 / minutes;
        let scheduled_u = mu_to_units(input.scheduled_basal_mu_per_hour);
        let rate = units_to_mu((scheduled_u - reduction_u_per_hour).max(0.0));
        if rate < input.scheduled_basal_mu_per_hour {
            return Ok(Proposal::Dose(ProposedDose::temp_basal(
                rate,
                input.temp_basal_minutes,
            )));
        }
    }

    Ok(Proposal::NoChange(NoChangeReason::WithinTarget))
}
