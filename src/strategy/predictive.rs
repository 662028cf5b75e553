//! Eventual-glucose predictor.
//!
//! ```text
//! eventual = bg + slope·horizon − IOB·ISF + COB·ISF/CR
//! need     = (eventual − target_mid) / ISF
//! ```

use super::{DosingStrategy, Proposal, StrategyInput, need_to_dose};
use crate::error::StrategyError;
use crate::types::mu_to_units;

/// Minutes of history used for the slope estimate.
const SLOPE_WINDOW_MINUTES: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictiveStrategy {
    horizon_minutes: u16,
}

impl PredictiveStrategy {
    pub fn new(horizon_minutes: u16) -> Self {
        Self { horizon_minutes }
    }

    /// Projected glucose at the end of insulin and carb action.
    pub fn eventual_glucose(&self, input: &StrategyInput<'_>, bg: f64) -> Result<f64, StrategyError> {
        let isf = input.isf()?;
        let cr = input.carb_ratio()?;
        let momentum = input.slope(SLOPE_WINDOW_MINUTES) * f64::from(self.horizon_minutes);
        let insulin_drop = mu_to_units(input.activity.iob_mu) * isf;
        let carb_rise = input.activity.cob_g * isf / cr;
        let eventual = bg + momentum - insulin_drop + carb_rise;
        if eventual.is_finite() {
            Ok(eventual)
        } else {
            Err(StrategyError::NonFinite("eventual glucose"))
        }
    }
}

impl DosingStrategy for PredictiveStrategy {
    fn name(&self) -> &'static str {
        "predictive"
    }

    fn propose(&self, input: &StrategyInput<'_>) -> Result<Proposal, StrategyError> {
        let bg = match input.usable_newest() {
            Ok(r) => r.value_mg_dl,
            Err(reason) => return Ok(Proposal::NoChange(reason)),
        };
        let eventual = self.eventual_glucose(input, bg)?;
        let need = (eventual - input.segment.target_mid()) / input.isf()?;
        log::debug!("Predictive: bg={bg:.0} eventual={eventual:.0} need={need:.2} U");
        need_to_dose(need, bg, input)
    }
}
