//! Amount ceilings: configured limits, IOB headroom and pump hardware.

use super::{ConstraintContext, ConstraintKind, ConstraintUnit, DoseRange, UnitDecision};
use crate::strategy::ProposedDose;
use crate::types::{DoseKind, Milliunits};

/// Bolus ≤ configured maximum.
pub struct MaxBolusUnit;

impl ConstraintUnit for MaxBolusUnit {
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::MaxBolus
    }

    fn evaluate(&self, dose: &ProposedDose, range: DoseRange, ctx: &ConstraintContext<'_>) -> UnitDecision {
        match dose.kind {
            DoseKind::Bolus => UnitDecision::Range(DoseRange::up_to(ctx.limits.max_bolus_mu)),
            DoseKind::BasalRateChange => UnitDecision::Range(range),
        }
    }
}

/// Temp basal ≤ min(configured max, current scheduled × multiplier,
/// highest scheduled × multiplier).
pub struct MaxBasalUnit;

impl MaxBasalUnit {
    fn ceiling(ctx: &ConstraintContext<'_>) -> Milliunits {
        let l = ctx.limits;
        let by_current = scale(ctx.scheduled_basal(), l.current_basal_multiplier);
        let by_daily = scale(ctx.profile.max_daily_basal(), l.max_daily_basal_multiplier);
        l.max_basal_mu_per_hour.min(by_current).min(by_daily)
    }
}

impl ConstraintUnit for MaxBasalUnit {
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::MaxBasal
    }

    fn evaluate(&self, dose: &ProposedDose, range: DoseRange, ctx: &ConstraintContext<'_>) -> UnitDecision {
        match dose.kind {
            DoseKind::BasalRateChange => UnitDecision::Range(DoseRange::up_to(Self::ceiling(ctx))),
            DoseKind::Bolus => UnitDecision::Range(range),
        }
    }
}

/// Bolus ≤ headroom under the IOB ceiling; once at the ceiling, basal is
/// held at the scheduled rate.
pub struct MaxIobUnit;

impl ConstraintUnit for MaxIobUnit {
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::MaxIob
    }

    fn evaluate(&self, dose: &ProposedDose, range: DoseRange, ctx: &ConstraintContext<'_>) -> UnitDecision {
        let max_iob = ctx.limits.max_iob_mu;
        match dose.kind {
            DoseKind::Bolus => UnitDecision::Range(DoseRange::up_to(max_iob.saturating_sub(ctx.iob_mu))),
            DoseKind::BasalRateChange if ctx.iob_mu >= max_iob => {
                UnitDecision::Range(DoseRange::up_to(ctx.scheduled_basal()))
            }
            DoseKind::BasalRateChange => UnitDecision::Range(range),
        }
    }
}

/// Pump capability ceilings.
pub struct HardwareUnit;

impl ConstraintUnit for HardwareUnit {
    fn kind(&self) -> ConstraintKind {
        ConstraintKind::Hardware
    }

    fn evaluate(&self, dose: &ProposedDose, _range: DoseRange, ctx: &ConstraintContext<'_>) -> UnitDecision {
        let caps = ctx.capabilities;
        let max = match dose.kind {
            DoseKind::Bolus => caps.max_bolus_mu,
            DoseKind::BasalRateChange => caps.max_basal_mu_per_hour,
        };
        UnitDecision::Range(DoseRange::up_to(max))
    }
}

fn scale(rate: Milliunits, multiplier: f64) -> Milliunits {
    let scaled = f64::from(rate) * multiplier;
    if scaled.is_finite() && scaled > 0.0 {
        scaled.min(f64::from(Milliunits::MAX)).floor() as Milliunits
    } else {
        0
    }
}
