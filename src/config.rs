//! Engine configuration parameters.
//!
//! All tunable parameters of the loop.  Loaded once at startup (JSON in the
//! simulator) and validated before use.  Out-of-range values are rejected,
//! never clamped.

use serde::{Deserialize, Serialize};

use crate::app::ports::ConfigError;
use crate::constraints::ConstraintKind;
use crate::profile::InsulinCurve;
use crate::types::Milliunits;

/// Longest carb absorption a meal may declare.
pub const MAX_ABSORPTION_MINUTES: u16 = 720;

/// How the loop treats an approved dose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LoopMode {
    /// Approved doses are dispatched to the pump.
    #[default]
    Closed,
    /// Approved doses are surfaced as suggestions only.
    Open,
    /// Only insulin reductions are allowed (no bolus, no basal above
    /// the scheduled rate).
    LowGlucoseSuspend,
}

/// What starts a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TriggerMode {
    /// Fixed cadence only.
    Cadence,
    /// Every fresh glucose reading.
    FreshData,
    /// Whichever comes first.
    #[default]
    Both,
}

/// Dosing strategy selected at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StrategyConfig {
    Pid {
        /// Proportional gain (dimensionless, scales mg/dL error).
        kp: f64,
        /// Integral gain, per hour of accumulated error.
        ki: f64,
        /// Derivative gain, minutes of slope look-ahead.
        kd: f64,
        /// Minutes of history integrated by the I term.
        integral_window_minutes: u16,
    },
    Predictive {
        /// Minutes of glucose slope projected forward.
        horizon_minutes: u16,
    },
    ProfileReplay,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::Pid {
            kp: 1.0,
            ki: 0.25,
            kd: 20.0,
            integral_window_minutes: 30,
        }
    }
}

/// Safety limits consumed by the constraint pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Largest single bolus the loop may issue.
    pub max_bolus_mu: Milliunits,
    /// Absolute ceiling for any temporary basal rate (mU/h).
    pub max_basal_mu_per_hour: Milliunits,
    /// Insulin-on-board ceiling.
    pub max_iob_mu: Milliunits,
    /// Glucose below which every positive dose is vetoed (mg/dL).
    pub low_glucose_suspend_mg_dl: f64,
    /// Temp basal may not exceed this multiple of the current scheduled basal.
    pub current_basal_multiplier: f64,
    /// Temp basal may not exceed this multiple of the highest scheduled basal.
    pub max_daily_basal_multiplier: f64,
    /// Minimum minutes between loop-issued boluses.
    pub min_bolus_interval_minutes: u16,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_bolus_mu: 3000,
            max_basal_mu_per_hour: 4000,
            max_iob_mu: 6000,
            low_glucose_suspend_mg_dl: 70.0,
            current_basal_multiplier: 4.0,
            max_daily_basal_multiplier: 3.0,
            min_bolus_interval_minutes: 3,
        }
    }
}

/// Core engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    // --- Loop ---
    pub loop_mode: LoopMode,
    pub trigger_mode: TriggerMode,
    /// Cadence between cycles (seconds).
    pub cycle_interval_secs: u32,

    // --- Freshness / timeouts ---
    /// Newest reading older than this ⇒ "no dose, stale data".
    pub stale_after_secs: u32,
    /// Bounded wait for the pump acknowledgment.
    pub ack_timeout_secs: u32,

    // --- Inputs ---
    /// Minutes of glucose history pulled at the start of each cycle.
    pub glucose_history_minutes: u16,
    /// Hours of event log read for IOB/COB.  Widened per cycle to the
    /// insulin DIA and the longest absorption.
    pub activity_window_hours: u16,
    /// Default absorption time for announced meals.
    pub default_absorption_minutes: u16,

    // --- Strategy ---
    pub strategy: StrategyConfig,
    /// Fraction of the computed insulin need issued as a bolus.
    pub bolus_fraction: f64,
    /// Duration of loop-issued temporary basal rates.
    pub temp_basal_minutes: u16,

    // --- Safety ---
    pub limits: SafetyLimits,
    /// Constraint evaluation order.
    pub pipeline: Vec<ConstraintKind>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            loop_mode: LoopMode::Closed,
            trigger_mode: TriggerMode::Both,
            cycle_interval_secs: 300, // 5 min

            stale_after_secs: 720,  // 12 min: one missed CGM reading tolerated
            ack_timeout_secs: 30,

            glucose_history_minutes: 60,
            activity_window_hours: 24,
            default_absorption_minutes: 180,

            strategy: StrategyConfig::default(),
            bolus_fraction: 0.5,
            temp_basal_minutes: 30,

            limits: SafetyLimits::default(),
            pipeline: ConstraintKind::DEFAULT_ORDER.to_vec(),
        }
    }
}

impl EngineConfig {
    /// Range-check every field.  Returns the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(60..=3600).contains(&self.cycle_interval_secs) {
            return Err(ConfigError::ValidationFailed(
                "cycle_interval_secs must be 60–3600",
            ));
        }
        if !(60..=3600).contains(&self.stale_after_secs) {
            return Err(ConfigError::ValidationFailed(
                "stale_after_secs must be 60–3600",
            ));
        }
        if !(1..=120).contains(&self.ack_timeout_secs) {
            return Err(ConfigError::ValidationFailed(
                "ack_timeout_secs must be 1–120",
            ));
        }
        if self.ack_timeout_secs >= self.cycle_interval_secs {
            return Err(ConfigError::ValidationFailed(
                "ack_timeout_secs must be shorter than the cycle interval",
            ));
        }
        if !(15..=360).contains(&self.glucose_history_minutes) {
            return Err(ConfigError::ValidationFailed(
                "glucose_history_minutes must be 15–360",
            ));
        }
        if !(6..=48).contains(&self.activity_window_hours) {
            return Err(ConfigError::ValidationFailed(
                "activity_window_hours must be 6–48",
            ));
        }
        if !(15..=MAX_ABSORPTION_MINUTES).contains(&self.default_absorption_minutes) {
            return Err(ConfigError::ValidationFailed(
                "default_absorption_minutes must be 15–720",
            ));
        }
        if !(self.bolus_fraction > 0.0 && self.bolus_fraction <= 1.0) {
            return Err(ConfigError::ValidationFailed(
                "bolus_fraction must be in (0, 1]",
            ));
        }
        if !(5..=120).contains(&self.temp_basal_minutes) {
            return Err(ConfigError::ValidationFailed(
                "temp_basal_minutes must be 5–120",
            ));
        }
        self.validate_strategy()?;
        self.validate_limits()?;
        self.validate_pipeline()
    }

    fn validate_strategy(&self) -> Result<(), ConfigError> {
        match &self.strategy {
            StrategyConfig::Pid {
                kp,
                ki,
                kd,
                integral_window_minutes,
            } => {
                let gains_ok = [*kp, *ki, *kd]
                    .iter()
                    .all(|g| g.is_finite() && *g >= 0.0);
                if !gains_ok {
                    return Err(ConfigError::ValidationFailed(
                        "PID gains must be finite and non-negative",
                    ));
                }
                if *integral_window_minutes == 0
                    || *integral_window_minutes > self.glucose_history_minutes
                {
                    return Err(ConfigError::ValidationFailed(
                        "integral_window_minutes must be 1–glucose_history_minutes",
                    ));
                }
            }
            StrategyConfig::Predictive { horizon_minutes } => {
                if !(5..=120).contains(horizon_minutes) {
                    return Err(ConfigError::ValidationFailed(
                        "horizon_minutes must be 5–120",
                    ));
                }
            }
            StrategyConfig::ProfileReplay => {}
        }
        Ok(())
    }

    fn validate_limits(&self) -> Result<(), ConfigError> {
        let l = &self.limits;
        if l.max_bolus_mu > 25_000 {
            return Err(ConfigError::ValidationFailed("max_bolus_mu must be ≤ 25000"));
        }
        if l.max_basal_mu_per_hour > 35_000 {
            return Err(ConfigError::ValidationFailed(
                "max_basal_mu_per_hour must be ≤ 35000",
            ));
        }
        if l.max_iob_mu > 50_000 {
            return Err(ConfigError::ValidationFailed("max_iob_mu must be ≤ 50000"));
        }
        if !(40.0..=120.0).contains(&l.low_glucose_suspend_mg_dl) {
            return Err(ConfigError::ValidationFailed(
                "low_glucose_suspend_mg_dl must be 40–120",
            ));
        }
        if !(1.0..=10.0).contains(&l.current_basal_multiplier) {
            return Err(ConfigError::ValidationFailed(
                "current_basal_multiplier must be 1–10",
            ));
        }
        if !(1.0..=10.0).contains(&l.max_daily_basal_multiplier) {
            return Err(ConfigError::ValidationFailed(
                "max_daily_basal_multiplier must be 1–10",
            ));
        }
        if l.min_bolus_interval_minutes > 60 {
            return Err(ConfigError::ValidationFailed(
                "min_bolus_interval_minutes must be ≤ 60",
            ));
        }
        Ok(())
    }

    fn validate_pipeline(&self) -> Result<(), ConfigError> {
        if self.pipeline.is_empty() {
            return Err(ConfigError::ValidationFailed("pipeline must not be empty"));
        }
        if self.pipeline.len() > crate::constraints::MAX_UNITS {
            return Err(ConfigError::ValidationFailed("pipeline has too many units"));
        }
        for (i, kind) in self.pipeline.iter().enumerate() {
            if self.pipeline[..i].contains(kind) {
                return Err(ConfigError::ValidationFailed(
                    "pipeline lists a constraint twice",
                ));
            }
        }
        // Removing a safety unit must be an explicit code change, not a config edit.
        for required in [
            ConstraintKind::LowGlucoseSuspend,
            ConstraintKind::MaxBolus,
            ConstraintKind::MaxBasal,
            ConstraintKind::MaxIob,
            ConstraintKind::Hardware,
        ] {
            if !self.pipeline.contains(&required) {
                return Err(ConfigError::ValidationFailed(
                    "pipeline is missing a mandatory safety constraint",
                ));
            }
        }
        Ok(())
    }

    /// Event-log lookback for a cycle: never shorter than `insulin`'s DIA
    /// or the longest meal absorption.
    pub fn activity_lookback(&self, insulin: &InsulinCurve) -> chrono::Duration {
        let minutes = (u32::from(self.activity_window_hours) * 60)
            .max(u32::from(insulin.dia_minutes))
            .max(u32::from(MAX_ABSORPTION_MINUTES));
        chrono::Duration::minutes(i64::from(minutes))
    }

    /// Staleness threshold as a chrono duration.
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::from(self.stale_after_secs))
    }

    /// Acknowledgment timeout as a std duration.
    pub fn ack_timeout(&self) -> core::time::Duration {
        core::time::Duration::from_secs(u64::from(self.ack_timeout_secs))
    }
}
