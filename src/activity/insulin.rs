//! Exponential insulin action curve (oref model).
//!
//! For duration of action `td` and peak time `tp` (minutes):
//!
//! ```text
//! τ = tp·(1 − tp/td) / (1 − 2·tp/td)
//! a = 2τ / td
//! S = 1 / (1 − a + (1 + a)·e^(−td/τ))
//!
//! activity(t)     = (S / τ²) · t · (1 − t/td) · e^(−t/τ)
//! iob_fraction(t) = 1 − S·(1 − a)·((t²/(τ·td·(1 − a)) − t/τ − 1)·e^(−t/τ) + 1)
//! ```
//!
//! `iob_fraction` starts at 1, is non-increasing on `[0, td]` (its
//! derivative is `−activity`), and is 0 from `td` onward.

use crate::profile::InsulinCurve;

/// Precomputed curve constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialCurve {
    td: f64,
    tau: f64,
    a: f64,
    s: f64,
}

impl ExponentialCurve {
    /// Build from profile parameters.  Callers validate `peak < dia / 2`
    /// (see [`Profile::validate`](crate::profile::Profile::validate)).
    pub fn new(curve: InsulinCurve) -> Self {
        let td = f64::from(curve.dia_minutes);
        let tp = f64::from(curve.peak_minutes);
        let tau = tp * (1.0 - tp / td) / (1.0 - 2.0 * tp / td);
        let a = 2.0 * tau / td;
        let s = 1.0 / (1.0 - a + (1.0 + a) * (-td / tau).exp());
        Self { td, tau, a, s }
    }

    /// Duration of action in minutes.
    pub fn dia_minutes(&self) -> f64 {
        self.td
    }

    /// Fraction of a dose still on board `minutes` after delivery.
    pub fn iob_fraction(&self, minutes: f64) -> f64 {
        if minutes <= 0.0 {
            return 1.0;
        }
        if minutes >= self.td {
            return 0.0;
        }
        let t = minutes;
        let Self { td, tau, a, s } = *self;
        let inner = (t * t / (tau * td * (1.0 - a)) - t / tau - 1.0) * (-t / tau).exp() + 1.0;
        (1.0 - s * (1.0 - a) * inner).clamp(0.0, 1.0)
    }

    /// Fraction of a dose acting per minute, `minutes` after delivery.
    pub fn activity(&self, minutes: f64) -> f64 {
        if minutes <= 0.0 || minutes >= self.td {
            return 0.0;
        }
        let t = minutes;
        let Self { td, tau, s, .. } = *self;
        ((s / (tau * tau)) * t * (1.0 - t / td) * (-t / tau).exp()).max(0.0)
    }
}
