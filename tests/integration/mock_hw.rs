//! Mock collaborators for integration tests.
//!
//! Every pump command and every emitted event is recorded so tests can
//! assert on the full history of a cycle without a device.

use std::collections::VecDeque;
use std::sync::Arc;

use apsloop::activity::log::EventLog;
use apsloop::adapters::memory_store::MemoryStore;
use apsloop::app::events::AppEvent;
use apsloop::app::cycle::LoopCycleResult;
use apsloop::app::ports::{
    AuditError, AuditSink, ConfigError, DoseCommand, EventSink, PersistencePort, ProfilePort,
    PumpCapabilities, PumpPort, SendOutcome, SensorPort, TriggerKind,
};
use apsloop::app::service::LoopService;
use apsloop::audit::AuditRecord;
use apsloop::config::EngineConfig;
use apsloop::error::{SensorError, StrategyError};
use apsloop::profile::{Profile, ProfileSegment, ProfileStore};
use apsloop::strategy::{DosingStrategy, Proposal, ProposedDose, StrategyInput, StrategyKind};
use apsloop::types::{AckState, DoseEvent, DoseKind, GlucoseReading, IdempotencyToken, LogRecord, Trend};
use chrono::{DateTime, Duration, TimeZone, Utc};

pub type Service = LoopService<MemoryStore, ProfileStore>;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn segment() -> ProfileSegment {
    ProfileSegment {
        start_minute: 0,
        basal_mu_per_hour: 1_000,
        isf_mg_dl_per_u: 50.0,
        carb_ratio_g_per_u: 10.0,
        target_low: 100.0,
        target_high: 120.0,
    }
}

pub fn profiles() -> ProfileStore {
    let mut store = ProfileStore::new();
    store
        .publish(Profile::flat("integration", segment()), t0() - Duration::days(1))
        .unwrap();
    store
}

pub fn confirmed_bolus(amount_mu: u32, at: DateTime<Utc>) -> DoseEvent {
    DoseEvent {
        token: IdempotencyToken::new(at, DoseKind::Bolus),
        kind: DoseKind::Bolus,
        amount_mu,
        duration_minutes: 0,
        requested_at: at,
        issued_at: Some(at),
        ack: AckState::Confirmed,
    }
}

/// Store seeded with a confirmed bolus of `amount_mu` at `at`.
pub fn store_with_bolus(amount_mu: u32, at: DateTime<Utc>) -> MemoryStore {
    let mut store = MemoryStore::new();
    store
        .append(&LogRecord::Dose(confirmed_bolus(amount_mu, at)))
        .unwrap();
    store
}

pub fn service_with(config: EngineConfig, strategy: StrategyKind, store: MemoryStore) -> Service {
    let window = Duration::hours(i64::from(config.activity_window_hours));
    let log = EventLog::open(store, t0(), window).unwrap();
    LoopService::new(config, strategy, profiles(), log).unwrap()
}

/// Hands out one profile as-is, without the versioned store's publish checks.
pub struct UncheckedProfile(pub Arc<Profile>);

impl ProfilePort for UncheckedProfile {
    fn active_profile(&self, _at: DateTime<Utc>) -> Result<Arc<Profile>, ConfigError> {
        Ok(Arc::clone(&self.0))
    }
}

#[allow(dead_code)]
pub fn service_with_profile(
    config: EngineConfig,
    strategy: StrategyKind,
    profile: Profile,
    store: MemoryStore,
) -> LoopService<MemoryStore, UncheckedProfile> {
    let window = Duration::hours(i64::from(config.activity_window_hours));
    let log = EventLog::open(store, t0(), window).unwrap();
    LoopService::new(config, strategy, UncheckedProfile(Arc::new(profile)), log).unwrap()
}

// ── Strategies ────────────────────────────────────────────────

/// Always proposes the same thing.
pub struct Fixed(pub Proposal);

impl Fixed {
    pub fn bolus(amount_mu: u32) -> StrategyKind {
        StrategyKind::Custom(Box::new(Self(Proposal::Dose(ProposedDose::bolus(amount_mu)))))
    }

    pub fn temp_basal(rate: u32) -> StrategyKind {
        StrategyKind::Custom(Box::new(Self(Proposal::Dose(ProposedDose::temp_basal(rate, 30)))))
    }
}

impl DosingStrategy for Fixed {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn propose(&self, _input: &StrategyInput<'_>) -> Result<Proposal, StrategyError> {
        Ok(self.0)
    }
}

// ── Sensor ────────────────────────────────────────────────────

pub struct MockSensor {
    pub readings: Vec<GlucoseReading>,
    pub fail: bool,
}

#[allow(dead_code)]
impl MockSensor {
    /// One reading `age_minutes` old relative to [`t0`].
    pub fn reading(value: f64, age_minutes: i64) -> Self {
        Self {
            readings: vec![GlucoseReading::new(
                t0() - Duration::minutes(age_minutes),
                value,
                Trend::Flat,
            )],
            fail: false,
        }
    }

    pub fn empty() -> Self {
        Self {
            readings: Vec::new(),
            fail: false,
        }
    }
}

impl SensorPort for MockSensor {
    fn latest_readings(&mut self, since: DateTime<Utc>) -> Result<Vec<GlucoseReading>, SensorError> {
        if self.fail {
            return Err(SensorError::Unavailable);
        }
        Ok(self
            .readings
            .iter()
            .filter(|r| r.timestamp >= since)
            .copied()
            .collect())
    }
}

// ── Pump ──────────────────────────────────────────────────────

/// Scripted pump answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpReply {
    Answer(SendOutcome),
    /// Never answers; the dispatcher's timeout must fire.
    Hang,
}

pub struct MockPump {
    pub sent: Vec<DoseCommand>,
    pub script: VecDeque<PumpReply>,
    pub capabilities: PumpCapabilities,
}

#[allow(dead_code)]
impl MockPump {
    pub fn new() -> Self {
        Self {
            sent: Vec::new(),
            script: VecDeque::new(),
            capabilities: PumpCapabilities {
                min_increment_mu: 50,
                max_bolus_mu: 25_000,
                max_basal_mu_per_hour: 35_000,
            },
        }
    }

    pub fn scripted(replies: impl IntoIterator<Item = PumpReply>) -> Self {
        Self {
            script: replies.into_iter().collect(),
            ..Self::new()
        }
    }
}

impl Default for MockPump {
    fn default() -> Self {
        Self::new()
    }
}

impl PumpPort for MockPump {
    fn capabilities(&self) -> PumpCapabilities {
        self.capabilities
    }

    async fn send(&mut self, command: &DoseCommand) -> SendOutcome {
        self.sent.push(*command);
        match self
            .script
            .pop_front()
            .unwrap_or(PumpReply::Answer(SendOutcome::Acknowledged))
        {
            PumpReply::Answer(outcome) => outcome,
            PumpReply::Hang => futures_lite::future::pending().await,
        }
    }
}

// ── Sinks ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct EventRecorder {
    pub events: Vec<AppEvent>,
}

impl EventSink for EventRecorder {
    fn emit(&mut self, event: &AppEvent) {
        self.events.push(event.clone());
    }
}

#[derive(Default)]
pub struct AuditRecorder {
    pub records: Vec<AuditRecord>,
    /// Refuse records while set.
    pub offline: bool,
}

impl AuditSink for AuditRecorder {
    fn record(&mut self, record: &AuditRecord) -> Result<(), AuditError> {
        if self.offline {
            return Err(AuditError::Unavailable);
        }
        self.records.push(record.clone());
        Ok(())
    }
}

/// Run one cycle at [`t0`] against fresh sinks.
#[allow(dead_code)]
pub fn run_once<R: ProfilePort>(
    svc: &mut LoopService<MemoryStore, R>,
    sensor: &mut MockSensor,
    pump: &mut MockPump,
) -> (LoopCycleResult, EventRecorder) {
    let mut events = EventRecorder::default();
    let mut audit = AuditRecorder::default();
    let result = svc.run_cycle(t0(), TriggerKind::Cadence, sensor, pump, &mut events, &mut audit);
    (result, events)
}

/// Run one cycle at `at` with a fresh reading of `glucose`.
#[allow(dead_code)]
pub fn run_at<R: ProfilePort>(
    svc: &mut LoopService<MemoryStore, R>,
    at: DateTime<Utc>,
    glucose: f64,
    pump: &mut MockPump,
) -> LoopCycleResult {
    let mut sensor = MockSensor {
        readings: vec![GlucoseReading::new(at, glucose, Trend::Flat)],
        fail: false,
    };
    let mut events = EventRecorder::default();
    let mut audit = AuditRecorder::default();
    svc.run_cycle(at, TriggerKind::Cadence, &mut sensor, pump, &mut events, &mut audit)
}
