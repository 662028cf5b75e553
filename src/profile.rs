//! Profile store: versioned, immutable basal/sensitivity/target schedules.
//!
//! A [`Profile`] is a day split into time-of-day segments.  Edits never
//! mutate a published profile; [`ProfileStore::publish`] appends a new
//! version with an effective-from timestamp, and lookups resolve "the
//! version active at T" followed by "the segment active at T's local
//! minute-of-day".

use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use crate::app::ports::{ConfigError, ProfilePort};
use crate::types::Milliunits;

const MINUTES_PER_DAY: u16 = 24 * 60;

/// One time-of-day segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileSegment {
    /// Local minute-of-day at which the segment starts (0–1439).
    pub start_minute: u16,
    /// Scheduled basal rate (mU/h).
    pub basal_mu_per_hour: Milliunits,
    /// Insulin sensitivity factor: mg/dL drop per unit.
    pub isf_mg_dl_per_u: f64,
    /// Grams of carbohydrate covered by one unit.
    pub carb_ratio_g_per_u: f64,
    /// Target range (mg/dL).
    pub target_low: f64,
    pub target_high: f64,
}

impl ProfileSegment {
    /// Midpoint of the target range.
    pub fn target_mid(&self) -> f64 {
        (self.target_low + self.target_high) / 2.0
    }
}

/// Insulin pharmacokinetics used by the activity model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InsulinCurve {
    /// Duration of insulin action (minutes).
    pub dia_minutes: u16,
    /// Time to peak activity (minutes).
    pub peak_minutes: u16,
}

impl Default for InsulinCurve {
    fn default() -> Self {
        // Rapid-acting analogue, oref defaults.
        Self {
            dia_minutes: 300,
            peak_minutes: 75,
        }
    }
}

/// An immutable profile snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    /// Fixed offset of the wearer's local time from UTC (minutes).
    pub utc_offset_minutes: i16,
    pub insulin: InsulinCurve,
    /// Ordered by `start_minute`; the first starts at 0.
    pub segments: Vec<ProfileSegment>,
}

impl Profile {
    /// Single-segment profile, handy for simulation and tests.
    pub fn flat(name: &str, segment: ProfileSegment) -> Self {
        Self {
            name: name.to_string(),
            utc_offset_minutes: 0,
            insulin: InsulinCurve::default(),
            segments: vec![ProfileSegment {
                start_minute: 0,
                ..segment
            }],
        }
    }

    /// Structural and range validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Some(first) = self.segments.first() else {
            return Err(ConfigError::ValidationFailed("profile has no segments"));
        };
        if first.start_minute != 0 {
            return Err(ConfigError::ValidationFailed(
                "first profile segment must start at midnight",
            ));
        }
        if self
            .segments
            .windows(2)
            .any(|w| w[1].start_minute <= w[0].start_minute)
        {
            return Err(ConfigError::ValidationFailed(
                "profile segments must be strictly ordered",
            ));
        }
        for seg in &self.segments {
            if seg.start_minute >= MINUTES_PER_DAY {
                return Err(ConfigError::ValidationFailed(
                    "segment start_minute must be < 1440",
                ));
            }
            if seg.basal_mu_per_hour > 35_000 {
                return Err(ConfigError::ValidationFailed("basal rate must be ≤ 35 U/h"));
            }
            if !(5.0..=500.0).contains(&seg.isf_mg_dl_per_u) {
                return Err(ConfigError::ValidationFailed("ISF must be 5–500 mg/dL/U"));
            }
            if !(1.0..=150.0).contains(&seg.carb_ratio_g_per_u) {
                return Err(ConfigError::ValidationFailed("carb ratio must be 1–150 g/U"));
            }
            if !(70.0..=200.0).contains(&seg.target_low)
                || !(70.0..=200.0).contains(&seg.target_high)
                || seg.target_low > seg.target_high
            {
                return Err(ConfigError::ValidationFailed(
                    "target range must be 70–200 mg/dL with low ≤ high",
                ));
            }
        }
        let InsulinCurve {
            dia_minutes,
            peak_minutes,
        } = self.insulin;
        if !(180..=600).contains(&dia_minutes) {
            return Err(ConfigError::ValidationFailed("DIA must be 3–10 h"));
        }
        if peak_minutes < 30 || u32::from(peak_minutes) * 2 >= u32::from(dia_minutes) {
            return Err(ConfigError::ValidationFailed(
                "insulin peak must be ≥ 30 min and below half the DIA",
            ));
        }
        if !(-720..=840).contains(&self.utc_offset_minutes) {
            return Err(ConfigError::ValidationFailed("utc offset out of range"));
        }
        Ok(())
    }

    /// Local minute-of-day for `at`.
    pub fn local_minute(&self, at: DateTime<Utc>) -> u16 {
        let local = at + Duration::minutes(i64::from(self.utc_offset_minutes));
        (local.hour() * 60 + local.minute()) as u16
    }

    /// Segment active at `at`.
    pub fn segment_at(&self, at: DateTime<Utc>) -> &ProfileSegment {
        let minute = self.local_minute(at);
        // Validated profiles start at minute 0, so a match always exists.
        let idx = self
            .segments
            .partition_point(|s| s.start_minute <= minute)
            .saturating_sub(1);
        &self.segments[idx]
    }

    /// Scheduled basal at `at` (mU/h).
    pub fn basal_at(&self, at: DateTime<Utc>) -> Milliunits {
        self.segment_at(at).basal_mu_per_hour
    }

    /// Highest scheduled basal of the day (mU/h).
    pub fn max_daily_basal(&self) -> Milliunits {
        self.segments
            .iter()
            .map(|s| s.basal_mu_per_hour)
            .max()
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Versioned store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ProfileVersion {
    effective_from: DateTime<Utc>,
    version: u32,
    profile: Arc<Profile>,
}

/// Append-only, versioned profile store.
#[derive(Debug, Default)]
pub struct ProfileStore {
    versions: Vec<ProfileVersion>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and publish a new version.  Versions must be published in
    /// non-decreasing `effective_from` order.  Returns the version number.
    pub fn publish(
        &mut self,
        profile: Profile,
        effective_from: DateTime<Utc>,
    ) -> Result<u32, ConfigError> {
        profile.validate()?;
        if self
            .versions
            .last()
            .is_some_and(|v| v.effective_from > effective_from)
        {
            return Err(ConfigError::ValidationFailed(
                "profile versions must be published in effective order",
            ));
        }
        let version = self.versions.last().map_or(1, |v| v.version + 1);
        info!(
            "Profile '{}' published as v{} effective {}",
            profile.name, version, effective_from
        );
        self.versions.push(ProfileVersion {
            effective_from,
            version,
            profile: Arc::new(profile),
        });
        Ok(version)
    }

    /// Version number active at `at`, if any.
    pub fn version_at(&self, at: DateTime<Utc>) -> Option<u32> {
        self.lookup(at).map(|v| v.version)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    fn lookup(&self, at: DateTime<Utc>) -> Option<&ProfileVersion> {
        self.versions.iter().rev().find(|v| v.effective_from <= at)
    }
}

impl ProfilePort for ProfileStore {
    fn active_profile(&self, at: DateTime<Utc>) -> Result<Arc<Profile>, ConfigError> {
        self.lookup(at)
            .map(|v| Arc::clone(&v.profile))
            .ok_or(ConfigError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn seg(start: u16, basal: u32) -> ProfileSegment {
        ProfileSegment {
            start_minute: start,
            basal_mu_per_hour: basal,
            isf_mg_dl_per_u: 40.0,
            carb_ratio_g_per_u: 10.0,
            target_low: 100.0,
            target_high: 120.0,
        }
    }

    fn day_profile() -> Profile {
        Profile {
            name: "weekday".into(),
            utc_offset_minutes: 60,
            insulin: InsulinCurve::default(),
            segments: vec![seg(0, 800), seg(6 * 60, 1200), seg(22 * 60, 900)],
        }
    }

    #[test]
    fn segment_lookup_uses_local_time() {
        let p = day_profile();
        // 05:30 UTC = 06:30 local (+60)
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 5, 30, 0).unwrap();
        assert_eq!(p.basal_at(t), 1200);
        // 04:59 UTC = 05:59 local
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 4, 59, 0).unwrap();
        assert_eq!(p.basal_at(t), 800);
        // 23:30 UTC = 00:30 local next day
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 23, 30, 0).unwrap();
        assert_eq!(p.basal_at(t), 800);
        assert_eq!(p.max_daily_basal(), 1200);
    }

    #[test]
    fn validation_rejects_bad_profiles() {
        let mut p = day_profile();
        p.segments[0].start_minute = 10;
        assert!(p.validate().is_err());

        let mut p = day_profile();
        p.segments.swap(1, 2);
        assert!(p.validate().is_err());

        let mut p = day_profile();
        p.insulin.peak_minutes = 200;
        assert!(p.validate().is_err());

        let mut p = day_profile();
        p.segments.clear();
        assert!(p.validate().is_err());
    }

    #[test]
    fn store_resolves_version_by_effective_time() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let mut store = ProfileStore::new();
        assert!(matches!(store.active_profile(t0), Err(ConfigError::NotFound)));

        store.publish(day_profile(), t0).unwrap();
        let mut edited = day_profile();
        edited.name = "edited".into();
        let t1 = t0 + Duration::hours(12);
        store.publish(edited, t1).unwrap();

        assert_eq!(store.active_profile(t0 + Duration::hours(1)).unwrap().name, "weekday");
        assert_eq!(store.active_profile(t1).unwrap().name, "edited");
        assert_eq!(store.version_at(t1), Some(2));
        assert!(store.active_profile(t0 - Duration::seconds(1)).is_err());
    }

    #[test]
    fn store_rejects_out_of_order_versions() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let mut store = ProfileStore::new();
        store.publish(day_profile(), t0).unwrap();
        assert!(store.publish(day_profile(), t0 - Duration::hours(1)).is_err());
        assert_eq!(store.len(), 1);
    }
}
