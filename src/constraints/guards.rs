//! Situational guards: loop mode, low glucose and bolus spacing.

use chrono::Duration;

use super::{ConstraintContext, ConstraintKind, ConstraintUnit, DoseRange, UnitDecision};
use crate::config::LoopMode;
use crate::strategy::ProposedDose;
use crate::types::DoseKind;

/// In suspend-only mode: no bolus, no basal above schedule.
pub struct LoopModeUnit;

impl ConstraintUnit for LoopModeUnit {
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::LoopMode
    }

    fn evaluate(&self, dose: &ProposedDose, range: DoseRange, ctx: &ConstraintContext<'_>) -> UnitDecision {
        if ctx.loop_mode != LoopMode::LowGlucoseSuspend {
            return UnitDecision::Range(range);
        }
        match dose.kind {
            DoseKind::Bolus => UnitDecision::Veto("loop is in low-glucose-suspend-only mode".into()),
            DoseKind::BasalRateChange => UnitDecision::Range(DoseRange::up_to(ctx.scheduled_basal())),
        }
    }
}

/// Any positive amount is vetoed while glucose is under the threshold.
pub struct LowGlucoseSuspendUnit;

impl ConstraintUnit for LowGlucoseSuspendUnit {
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::LowGlucoseSuspend
    }

    fn evaluate(&self, dose: &ProposedDose, range: DoseRange, ctx: &ConstraintContext<'_>) -> UnitDecision {
        let threshold = ctx.limits.low_glucose_suspend_mg_dl;
        // A NaN reading is treated as low.
        let low = ctx.glucose_mg_dl.is_nan() || ctx.glucose_mg_dl < threshold;
        if low && dose.amount_mu > 0 {
            return UnitDecision::Veto(format!(
                "suspended: glucose {:.0} mg/dL below {:.0}",
                ctx.glucose_mg_dl, threshold
            ));
        }
        UnitDecision::Range(range)
    }
}

/// Minimum spacing between loop boluses.
pub struct BolusIntervalUnit;

impl ConstraintUnit for BolusIntervalUnit {
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::BolusInterval
    }

    fn evaluate(&self, dose: &ProposedDose, range: DoseRange, ctx: &ConstraintContext<'_>) -> UnitDecision {
        if dose.kind != DoseKind::Bolus {
            return UnitDecision::Range(range);
        }
        let interval = Duration::minutes(i64::from(ctx.limits.min_bolus_interval_minutes));
        match ctx.last_bolus_at {
            Some(last) if ctx.now - last < interval => UnitDecision::Veto(format!(
                "last bolus {} s ago, minimum interval {} min",
                (ctx.now - last).num_seconds(),
                ctx.limits.min_bolus_interval_minutes
            )),
            _ => UnitDecision::Range(range),
        }
    }
}
