//! PID-style dosing controller.
//!
//! Proportional-integral-derivative controller over the glucose error
//! `e(t) = glucose(t) − target_mid`, recomputed from history on every call
//! so that `propose` stays a pure function of its input.
//!
//! ```text
//! correction = kp·e(now) + ki·∫e dt (mg/dL·h over the window) + kd·slope
//! need (U)   = correction / ISF + COB / CR − IOB
//! ```

use chrono::Duration;

use super::{DosingStrategy, Proposal, StrategyInput, need_to_dose};
use crate::error::StrategyError;
use crate::types::mu_to_units;

/// Correction output limits (mg/dL), the anti-windup clamp.
const OUTPUT_LIMIT_MG_DL: f64 = 400.0;

/// PID strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct PidStrategy {
    kp: f64,
    ki: f64,
    kd: f64,
    window_minutes: u16,
    output_min: f64,
    output_max: f64,
}

impl PidStrategy {
    pub fn new(kp: f64, ki: f64, kd: f64, window_minutes: u16) -> Self {
        Self {
            kp,
            ki,
            kd,
            window_minutes,
            output_min: -OUTPUT_LIMIT_MG_DL,
            output_max: OUTPUT_LIMIT_MG_DL,
        }
    }

    /// Set correction limits (mg/dL).
    pub fn set_limits(&mut self, min: f64, max: f64) {
        self.output_min = min;
        self.output_max = max;
    }

    /// Trapezoidal integral of the error over the window (mg/dL·h).
    fn integral(&self, input: &StrategyInput<'_>, target: f64) -> f64 {
        let from = input.now - Duration::minutes(i64::from(self.window_minutes));
        let window: Vec<_> = input.glucose.iter().filter(|r| r.timestamp >= from).collect();
        window
            .windows(2)
            .map(|w| {
                let dt_h = (w[1].timestamp - w[0].timestamp).num_seconds() as f64 / 3600.0;
                let e0 = w[0].value_mg_dl - target;
                let e1 = w[1].value_mg_dl - target;
                (e0 + e1) / 2.0 * dt_h
            })
            .sum()
    }

    /// Correction in mg/dL before conversion to insulin.
    pub fn correction(&self, input: &StrategyInput<'_>, glucose: f64) -> f64 {
        let target = input.segment.target_mid();
        let error = glucose - target;

        let p = self.kp * error;
        let i = self.ki * self.integral(input, target);
        let d = self.kd * input.slope(i64::from(self.window_minutes));

        (p + i + d).clamp(self.output_min, self.output_max)
    }
}

impl DosingStrategy for PidStrategy {
    fn name(&self) -> &'static str {
        "pid"
    }

    fn propose(&self, input: &StrategyInput<'_>) -> Result<Proposal, StrategyError> {
        let newest = match input.usable_newest() {
            Ok(r) => r,
            Err(reason) => return Ok(Proposal::NoChange(reason)),
        };
        let glucose = newest.value_mg_dl;
        if !glucose.is_finite() {
            return Err(StrategyError::NonFinite("glucose"));
        }

        let isf = input.isf()?;
        let cr = input.carb_ratio()?;
        let correction = self.correction(input, glucose);
        if !correction.is_finite() {
            return Err(StrategyError::NonFinite("PID correction"));
        }

        let need = correction / isf + input.activity.cob_g / cr - mu_to_units(input.activity.iob_mu);
        log::debug!(
            "PID: bg={:.0} correction={:.1} mg/dL need={:.2} U",
            glucose,
            correction,
            need
        );
        need_to_dose(need, glucose, input)
    }
}
