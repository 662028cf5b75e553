//! Insulin/carb activity model.
//!
//! Pure functions over the event log: nothing here holds state between
//! calls, so replaying the same log at the same instant always yields the
//! same [`ActivityState`].
//!
//! ```text
//!  LogSnapshot ──▶ deposits() ──▶ Σ amount · iob_fraction(age)   = IOB
//!                             └─▶ Σ amount · activity(age)       = activity
//!  meals       ──▶ Σ remaining_carbs()                           = COB
//! ```
//!
//! Every dose that is not a confirmed refusal counts toward IOB.  Temporary
//! basal rates contribute only the insulin delivered above the scheduled
//! profile basal, integrated in 5-minute slices.

pub mod carbs;
pub mod insulin;
pub mod log;

use chrono::{DateTime, Duration, Utc};

use crate::profile::Profile;
use crate::types::{ActivityState, DoseEvent, DoseKind, MealEvent, Milliunits};

use self::carbs::remaining_carbs;
use self::insulin::ExponentialCurve;
use self::log::LogSnapshot;

/// Width of one integration slice for temporary basal rates.
const BASAL_SLICE_MINUTES: i64 = 5;

/// Insulin on board at `at` (mU).  Events after `at` are ignored.
pub fn compute_iob(at: DateTime<Utc>, doses: &[DoseEvent], profile: &Profile) -> Milliunits {
    let curve = ExponentialCurve::new(profile.insulin);
    let total: f64 = deposits(at, doses, profile)
        .iter()
        .map(|(t, mu)| mu * curve.iob_fraction(minutes_between(*t, at)))
        .sum();
    if total.is_finite() && total > 0.0 {
        total.round() as Milliunits
    } else {
        0
    }
}

/// Current insulin action at `at` (mU/min).
pub fn insulin_activity(at: DateTime<Utc>, doses: &[DoseEvent], profile: &Profile) -> f64 {
    let curve = ExponentialCurve::new(profile.insulin);
    deposits(at, doses, profile)
        .iter()
        .map(|(t, mu)| mu * curve.activity(minutes_between(*t, at)))
        .sum::<f64>()
        .max(0.0)
}

/// Carbohydrates on board at `at` (g).
pub fn compute_cob(at: DateTime<Utc>, meals: &[MealEvent]) -> f64 {
    meals.iter().map(|m| remaining_carbs(m, at)).sum()
}

/// Assembles a full [`ActivityState`] from a log snapshot.
pub struct ActivityModel;

impl ActivityModel {
    pub fn state(at: DateTime<Utc>, snapshot: &LogSnapshot, profile: &Profile) -> ActivityState {
        ActivityState {
            at,
            iob_mu: compute_iob(at, snapshot.doses(), profile),
            cob_g: compute_cob(at, snapshot.meals()),
            insulin_activity_mu_per_min: insulin_activity(at, snapshot.doses(), profile),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal
// ---------------------------------------------------------------------------

fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 60_000.0
}

/// Flatten counted doses into `(time, milliunits)` insulin deposits, each
/// decayed independently by the curve.
fn deposits(at: DateTime<Utc>, doses: &[DoseEvent], profile: &Profile) -> Vec<(DateTime<Utc>, f64)> {
    let counted: Vec<&DoseEvent> = doses
        .iter()
        .filter(|d| d.requested_at <= at && d.ack.counts_as_delivered())
        .collect();

    let mut out = Vec::new();

    for d in counted.iter().filter(|d| d.kind == DoseKind::Bolus) {
        out.push((d.requested_at, f64::from(d.amount_mu)));
    }

    let mut basals: Vec<&DoseEvent> = counted
        .iter()
        .copied()
        .filter(|d| d.kind == DoseKind::BasalRateChange)
        .collect();
    basals.sort_by_key(|d| d.requested_at);

    for (i, d) in basals.iter().enumerate() {
        let superseded_at = basals.get(i + 1).map(|n| n.requested_at);
        let end = [Some(d.nominal_end()), superseded_at, Some(at)]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(at);
        push_basal_excess(&mut out, d, end, profile);
    }

    out
}

fn push_basal_excess(
    out: &mut Vec<(DateTime<Utc>, f64)>,
    dose: &DoseEvent,
    end: DateTime<Utc>,
    profile: &Profile,
) {
    let slice = Duration::minutes(BASAL_SLICE_MINUTES);
    let mut t = dose.requested_at;
    while t < end {
        let slice_end = (t + slice).min(end);
        let scheduled = profile.basal_at(t);
        let excess_per_hour = f64::from(dose.amount_mu.saturating_sub(scheduled));
        if excess_per_hour > 0.0 {
            let minutes = minutes_between(t, slice_end);
            let mid = t + (slice_end - t) / 2;
            out.push((mid, excess_per_hour * minutes / 60.0));
        }
        t = slice_end;
    }
}
