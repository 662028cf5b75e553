//! Core data model shared by every component of the loop.
//!
//! Insulin amounts are integer **milliunits** (1 U = 1000 mU) so that
//! limits, ranges and pump increments compose without floating-point
//! drift.  Basal rates are milliunits per hour.  Glucose is mg/dL.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Insulin amount in milliunits.
pub type Milliunits = u32;

/// Milliunits per unit of insulin.
pub const MU_PER_UNIT: u32 = 1000;

/// Convert whole/fractional units to milliunits (rounded to nearest).
pub fn units_to_mu(units: f64) -> Milliunits {
    if units <= 0.0 {
        return 0;
    }
    (units * f64::from(MU_PER_UNIT)).round() as Milliunits
}

/// Convert milliunits to units.
pub fn mu_to_units(mu: Milliunits) -> f64 {
    f64::from(mu) / f64::from(MU_PER_UNIT)
}

// ---------------------------------------------------------------------------
// Glucose
// ---------------------------------------------------------------------------

/// CGM direction arrow as reported by the sensor collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Trend {
    DoubleUp,
    SingleUp,
    FortyFiveUp,
    Flat,
    FortyFiveDown,
    SingleDown,
    DoubleDown,
    #[default]
    Unknown,
}

impl Trend {
    /// Nominal rate of change for the arrow, in mg/dL per minute.
    /// `None` when the sensor did not report a direction.
    pub fn nominal_rate(self) -> Option<f64> {
        match self {
            Self::DoubleUp => Some(3.5),
            Self::SingleUp => Some(2.5),
            Self::FortyFiveUp => Some(1.5),
            Self::Flat => Some(0.0),
            Self::FortyFiveDown => Some(-1.5),
            Self::SingleDown => Some(-2.5),
            Self::DoubleDown => Some(-3.5),
            Self::Unknown => None,
        }
    }
}

/// One calibrated glucose measurement.  Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlucoseReading {
    pub timestamp: DateTime<Utc>,
    pub value_mg_dl: f64,
    pub trend: Trend,
    /// Sensor collaborator's confidence flag (false during warm-up,
    /// compression lows, calibration requests).
    pub confident: bool,
}

impl GlucoseReading {
    pub fn new(timestamp: DateTime<Utc>, value_mg_dl: f64, trend: Trend) -> Self {
        Self {
            timestamp,
            value_mg_dl,
            trend,
            confident: true,
        }
    }

    /// Age of the reading relative to `now` (zero if from the future).
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).max(Duration::zero())
    }
}

// ---------------------------------------------------------------------------
// Doses
// ---------------------------------------------------------------------------

/// What a dose command does to the pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DoseKind {
    /// Temporary basal rate; amount is milliunits per hour.
    BasalRateChange,
    /// Immediate bolus; amount is milliunits.
    Bolus,
}

impl DoseKind {
    pub const fn tag(self) -> &'static str {
        match self {
            Self::BasalRateChange => "basal",
            Self::Bolus => "bolus",
        }
    }
}

/// Delivery acknowledgment state of a dose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckState {
    /// Recorded, command not yet answered.
    Pending,
    /// Pump confirmed delivery.
    Confirmed,
    /// Pump refused before any delivery.
    Failed,
    /// Outcome unknown (acknowledgment lost or partial delivery possible).
    Unknown,
}

impl AckState {
    /// Whether insulin from this dose must be assumed to be on board.
    ///
    /// Everything except a confirmed refusal counts.
    pub const fn counts_as_delivered(self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// Idempotency token: cycle timestamp (ms since epoch) + dose kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyToken {
    pub cycle_ms: i64,
    pub kind: DoseKind,
}

impl IdempotencyToken {
    pub fn new(cycle_started_at: DateTime<Utc>, kind: DoseKind) -> Self {
        Self {
            cycle_ms: cycle_started_at.timestamp_millis(),
            kind,
        }
    }
}

impl core::fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}-{}", self.kind.tag(), self.cycle_ms)
    }
}

/// A dose as recorded in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoseEvent {
    pub token: IdempotencyToken,
    pub kind: DoseKind,
    /// Bolus: milliunits.  Basal change: milliunits per hour.
    pub amount_mu: Milliunits,
    /// Basal change duration in minutes (0 for boluses).
    pub duration_minutes: u16,
    pub requested_at: DateTime<Utc>,
    pub issued_at: Option<DateTime<Utc>>,
    pub ack: AckState,
}

impl DoseEvent {
    /// Nominal end of a basal change (equal to `requested_at` for boluses).
    pub fn nominal_end(&self) -> DateTime<Utc> {
        self.requested_at + Duration::minutes(i64::from(self.duration_minutes))
    }
}

/// An announced meal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MealEvent {
    pub timestamp: DateTime<Utc>,
    pub carbs_g: f64,
    /// Time over which the carbs are expected to absorb.
    pub absorption_minutes: u16,
}

/// One entry of the append-only event log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    Dose(DoseEvent),
    Meal(MealEvent),
}

impl LogRecord {
    /// Timestamp used to order and window the log.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Dose(d) => d.requested_at,
            Self::Meal(m) => m.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Derived activity
// ---------------------------------------------------------------------------

/// Insulin and carbohydrate activity at an instant.  Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivityState {
    pub at: DateTime<Utc>,
    pub iob_mu: Milliunits,
    pub cob_g: f64,
    /// Current insulin action, milliunits per minute.
    pub insulin_activity_mu_per_min: f64,
}

impl ActivityState {
    pub fn zero(at: DateTime<Utc>) -> Self {
        Self {
            at,
            iob_mu: 0,
            cob_g: 0.0,
            insulin_activity_mu_per_min: 0.0,
        }
    }
}
