//! Fuzz target: constraint pipeline
//!
//! Drives arbitrary proposals, limits and contexts through the default
//! pipeline and checks:
//! - No panics
//! - An approved amount never exceeds the proposal or any unit's output
//! - An approved amount is a multiple of the pump increment
//!
//! cargo fuzz run fuzz_pipeline

#![no_main]

use apsloop::app::ports::PumpCapabilities;
use apsloop::config::{LoopMode, SafetyLimits};
use apsloop::constraints::{ConstraintContext, ConstraintKind, ConstraintPipeline, PipelineDecision};
use apsloop::profile::{Profile, ProfileSegment};
use apsloop::strategy::ProposedDose;
use chrono::{Duration, TimeZone, Utc};
use libfuzzer_sys::fuzz_target;

fn u32_at(data: &[u8], at: usize) -> u32 {
    data.get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or(0)
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 32 {
        return;
    }

    let dose = if data[0] & 1 == 0 {
        ProposedDose::bolus(u32_at(data, 1) % 50_000)
    } else {
        ProposedDose::temp_basal(u32_at(data, 1) % 50_000, 30)
    };
    let limits = SafetyLimits {
        max_bolus_mu: u32_at(data, 5) % 30_000,
        max_basal_mu_per_hour: u32_at(data, 9) % 40_000,
        max_iob_mu: u32_at(data, 13) % 60_000,
        low_glucose_suspend_mg_dl: 40.0 + f64::from(data[17] % 81),
        current_basal_multiplier: 1.0 + f64::from(data[18] % 10),
        max_daily_basal_multiplier: 1.0 + f64::from(data[19] % 10),
        min_bolus_interval_minutes: u16::from(data[20] % 61),
    };
    let loop_mode = match data[21] % 3 {
        0 => LoopMode::Closed,
        1 => LoopMode::Open,
        _ => LoopMode::LowGlucoseSuspend,
    };
    let increment = [1, 10, 25, 50, 100][usize::from(data[22] % 5)];
    let glucose = f64::from(u32_at(data, 23) % 700);

    let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let profile = Profile::flat(
        "fuzz",
        ProfileSegment {
            start_minute: 0,
            basal_mu_per_hour: u32_at(data, 27) % 5_000,
            isf_mg_dl_per_u: 50.0,
            carb_ratio_g_per_u: 10.0,
            target_low: 100.0,
            target_high: 120.0,
        },
    );
    let ctx = ConstraintContext {
        now,
        glucose_mg_dl: glucose,
        iob_mu: u32_at(data, 28) % 60_000,
        profile: &profile,
        limits: &limits,
        loop_mode,
        capabilities: PumpCapabilities {
            min_increment_mu: increment,
            max_bolus_mu: 25_000,
            max_basal_mu_per_hour: 35_000,
        },
        last_bolus_at: (data[31] & 1 == 1).then(|| now - Duration::minutes(i64::from(data[31] >> 1))),
    };

    let pipeline = ConstraintPipeline::from_kinds(&ConstraintKind::DEFAULT_ORDER).unwrap();
    let Ok(outcome) = pipeline.apply(&dose, &ctx) else {
        return;
    };
    if let PipelineDecision::Approved(approved) = outcome.decision {
        assert!(approved.amount_mu <= dose.amount_mu);
        assert_eq!(approved.amount_mu % increment, 0);
        for v in &outcome.verdicts {
            assert!(v.output.contains(approved.amount_mu), "{v:?} excludes {}", approved.amount_mu);
        }
    }
});
