//! Simulated sensor and pump collaborators.
//!
//! A crude patient model drives both: glucose drifts at a
//! fixed rate, announced carbs raise it, and insulin delivered by the
//! simulated pump lowers it through the patient's sensitivity as it
//! absorbs.  Not a physiological model.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use log::debug;

use crate::adapters::time::SimClock;
use crate::app::ports::{Clock, DoseCommand, PumpCapabilities, PumpPort, SendOutcome, SensorPort};
use crate::error::SensorError;
use crate::types::{DoseKind, GlucoseReading, Milliunits, Trend, mu_to_units};

/// Fraction of on-board insulin absorbed per minute.
const ABSORPTION_PER_MIN: f64 = 0.02;
/// Fraction of on-board carbs absorbed per minute.
const CARB_ABSORPTION_PER_MIN: f64 = 0.015;

/// Simulated wearer.
#[derive(Debug, Clone)]
pub struct Patient {
    pub glucose_mg_dl: f64,
    pub isf_mg_dl_per_u: f64,
    /// mg/dL per gram of carbohydrate.
    pub carb_sensitivity: f64,
    /// Underlying drift (mg/dL per minute) with scheduled basal running.
    pub drift_mg_dl_per_min: f64,
    /// Scheduled basal the drift already accounts for (mU/h).
    pub scheduled_basal_mu_per_hour: Milliunits,
    /// Basal rate the pump is currently running (mU/h).
    pub running_basal_mu_per_hour: Milliunits,
    active_insulin_u: f64,
    active_carbs_g: f64,
}

impl Patient {
    pub fn new(glucose_mg_dl: f64, drift_mg_dl_per_min: f64, scheduled_basal_mu_per_hour: Milliunits) -> Self {
        Self {
            glucose_mg_dl,
            isf_mg_dl_per_u: 50.0,
            carb_sensitivity: 4.0,
            drift_mg_dl_per_min,
            scheduled_basal_mu_per_hour,
            running_basal_mu_per_hour: scheduled_basal_mu_per_hour,
            active_insulin_u: 0.0,
            active_carbs_g: 0.0,
        }
    }

    pub fn eat(&mut self, carbs_g: f64) {
        self.active_carbs_g += carbs_g;
    }

    /// Step the model forward by whole minutes.
    pub fn advance(&mut self, minutes: i64) {
        for _ in 0..minutes.max(0) {
            let basal_delta_u = (f64::from(self.running_basal_mu_per_hour)
                - f64::from(self.scheduled_basal_mu_per_hour))
                / 1000.0
                / 60.0;
            self.active_insulin_u += basal_delta_u;

            let insulin = self.active_insulin_u * ABSORPTION_PER_MIN;
            let carbs = self.active_carbs_g * CARB_ABSORPTION_PER_MIN;
            self.active_insulin_u -= insulin;
            self.active_carbs_g -= carbs;

            self.glucose_mg_dl += self.drift_mg_dl_per_min - insulin * self.isf_mg_dl_per_u
                + carbs * self.carb_sensitivity;
            self.glucose_mg_dl = self.glucose_mg_dl.clamp(40.0, 400.0);
        }
    }
}

pub type SharedPatient = Arc<Mutex<Patient>>;

fn lock(patient: &SharedPatient) -> std::sync::MutexGuard<'_, Patient> {
    patient.lock().unwrap_or_else(PoisonError::into_inner)
}

// ───────────────────────────────────────────────────────────────
// Sensor
// ───────────────────────────────────────────────────────────────

/// CGM producing one reading per `interval` of simulated time.
pub struct SimSensor {
    patient: SharedPatient,
    clock: SimClock,
    interval: Duration,
    history: Vec<GlucoseReading>,
    /// Simulated signal loss: readings stop until cleared.
    pub dropout: bool,
}

impl SimSensor {
    pub fn new(patient: SharedPatient, clock: SimClock) -> Self {
        Self {
            patient,
            clock,
            interval: Duration::minutes(5),
            history: Vec::new(),
            dropout: false,
        }
    }

    /// Timestamp of the newest reading, sampling first if one is due.
    pub fn newest_reading_at(&mut self) -> Option<DateTime<Utc>> {
        self.sample();
        self.history.last().map(|r| r.timestamp)
    }

    fn sample(&mut self) {
        if self.dropout {
            return;
        }
        let now = self.clock.now();
        let last = self.history.last().map(|r| r.timestamp);
        if last.is_some_and(|t| now - t < self.interval) {
            return;
        }
        let value = lock(&self.patient).glucose_mg_dl;
        let trend = match self.history.last() {
            Some(prev) => {
                let minutes = (now - prev.timestamp).num_seconds() as f64 / 60.0;
                trend_from_rate((value - prev.value_mg_dl) / minutes.max(1.0))
            }
            None => Trend::Flat,
        };
        debug!("SimSensor: {value:.0} mg/dL {trend:?}");
        self.history.push(GlucoseReading::new(now, value.round(), trend));
    }
}

fn trend_from_rate(mg_dl_per_min: f64) -> Trend {
    match mg_dl_per_min {
        r if r <= -3.0 => Trend::DoubleDown,
        r if r <= -2.0 => Trend::SingleDown,
        r if r <= -1.0 => Trend::FortyFiveDown,
        r if r < 1.0 => Trend::Flat,
        r if r < 2.0 => Trend::FortyFiveUp,
        r if r < 3.0 => Trend::SingleUp,
        _ => Trend::DoubleUp,
    }
}

impl SensorPort for SimSensor {
    fn latest_readings(&mut self, since: DateTime<Utc>) -> Result<Vec<GlucoseReading>, SensorError> {
        self.sample();
        Ok(self
            .history
            .iter()
            .filter(|r| r.timestamp >= since)
            .copied()
            .collect())
    }
}

// ───────────────────────────────────────────────────────────────
// Pump
// ───────────────────────────────────────────────────────────────

/// Pump that delivers into the patient model.
pub struct SimPump {
    patient: SharedPatient,
    capabilities: PumpCapabilities,
    /// Every n-th command goes unacknowledged (but is delivered).
    pub lose_ack_every: Option<u32>,
    sent: u32,
}

impl SimPump {
    pub fn new(patient: SharedPatient) -> Self {
        Self {
            patient,
            capabilities: PumpCapabilities {
                min_increment_mu: 50,
                max_bolus_mu: 10_000,
                max_basal_mu_per_hour: 5_000,
            },
            lose_ack_every: None,
            sent: 0,
        }
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }
}

impl PumpPort for SimPump {
    fn capabilities(&self) -> PumpCapabilities {
        self.capabilities
    }

    async fn send(&mut self, command: &DoseCommand) -> SendOutcome {
        self.sent += 1;
        {
            let mut p = lock(&self.patient);
            match command.kind {
                DoseKind::Bolus => p.active_insulin_u += mu_to_units(command.amount_mu),
                DoseKind::BasalRateChange => p.running_basal_mu_per_hour = command.amount_mu,
            }
        }
        if self.lose_ack_every.is_some_and(|n| n > 0 && self.sent % n == 0) {
            return SendOutcome::TimedOut;
        }
        SendOutcome::Acknowledged
    }
}
