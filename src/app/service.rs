//! Loop service, the hexagonal core.
//!
//! [`LoopService`] owns the cycle FSM, the dosing strategy, the constraint
//! pipeline, the dispatcher (and through it the event log) and the audit
//! trail.  All I/O flows through port traits passed in at call sites, so
//! the whole service runs against mock collaborators in tests.
//!
//! ```text
//!   SensorPort ──▶ ┌──────────────────────────────────┐ ──▶ EventSink
//!  ProfilePort ──▶ │           LoopService            │ ──▶ AuditSink
//!                  │ FSM · Strategy · Pipeline · Log  │
//!     PumpPort ◀── └──────────────────────────────────┘
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};

use crate::activity::ActivityModel;
use crate::activity::log::EventLog;
use crate::audit::AuditTrail;
use crate::config::{EngineConfig, LoopMode, MAX_ABSORPTION_MINUTES};
use crate::constraints::{ConstraintContext, ConstraintKind, ConstraintPipeline, PipelineDecision};
use crate::dispatch::Dispatcher;
use crate::error::{DispatchError, Error, SensorError, StrategyError};
use crate::fsm::context::{CancelToken, CycleContext, GatheredInputs};
use crate::fsm::states::build_state_table;
use crate::fsm::{Fsm, StateId};
use crate::strategy::{DosingStrategy, NoChangeReason, Proposal, StrategyInput, StrategyKind};
use crate::types::{AckState, GlucoseReading, MealEvent};

use super::commands::AppCommand;
use super::cycle::{InputSummary, LoopCycleResult, ReasonCode};
use super::events::{AppEvent, Notification};
use super::ports::{
    AuditSink, ConfigError, EventSink, PersistencePort, ProfilePort, PumpPort, SensorPort,
    TriggerKind,
};

/// Plausible sensor range (mg/dL).
const MIN_PLAUSIBLE_MG_DL: f64 = 20.0;
const MAX_PLAUSIBLE_MG_DL: f64 = 600.0;

// ───────────────────────────────────────────────────────────────
// LoopService
// ───────────────────────────────────────────────────────────────

/// Orchestrates one dosing cycle at a time.
pub struct LoopService<S: PersistencePort, R: ProfilePort> {
    fsm: Fsm,
    ctx: CycleContext,
    config: EngineConfig,
    strategy: StrategyKind,
    pipeline: ConstraintPipeline,
    dispatcher: Dispatcher<S>,
    profiles: R,
    audit: AuditTrail,
    cycle_count: u64,
}

impl<S: PersistencePort, R: ProfilePort> LoopService<S, R> {
    /// Validate `config` and assemble the service around an opened log.
    pub fn new(
        config: EngineConfig,
        strategy: StrategyKind,
        profiles: R,
        log: EventLog<S>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let pipeline = ConstraintPipeline::from_config(&config)?;
        let dispatcher = Dispatcher::new(log, config.ack_timeout());
        let ctx = CycleContext::new(CancelToken::new());
        let fsm = Fsm::new(build_state_table(), StateId::Idle);

        Ok(Self {
            fsm,
            ctx,
            config,
            strategy,
            pipeline,
            dispatcher,
            profiles,
            audit: AuditTrail::new(),
            cycle_count: 0,
        })
    }

    /// Replace the configured pipeline (custom units).
    pub fn with_pipeline(mut self, pipeline: ConstraintPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Replace the audit trail (custom backlog bound).
    pub fn with_audit(mut self, audit: AuditTrail) -> Self {
        self.audit = audit;
        self
    }

    // ── Lifecycle ─────────────────────────────────────────────

    pub fn start(&mut self, sink: &mut impl EventSink) {
        self.fsm.start(&mut self.ctx);
        sink.emit(&AppEvent::Started {
            strategy: self.strategy.name(),
            loop_mode: self.config.loop_mode,
        });
        info!(
            "LoopService started: strategy={} mode={:?} pipeline=[{}]",
            self.strategy.name(),
            self.config.loop_mode,
            self.pipeline
                .order()
                .iter()
                .map(|k| k.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    // ── Per-cycle orchestration ───────────────────────────────

    /// Run one full cycle: gather → propose → constrain → dispatch.
    ///
    /// Always produces a result; failures become a "no dose" reason.
    pub fn run_cycle(
        &mut self,
        now: DateTime<Utc>,
        trigger: TriggerKind,
        sensor: &mut impl SensorPort,
        pump: &mut impl PumpPort,
        events: &mut impl EventSink,
        audit_sink: &mut impl AuditSink,
    ) -> LoopCycleResult {
        self.cycle_count += 1;
        let started = Instant::now();
        self.ctx.begin(self.cycle_count, now, trigger);
        info!("Cycle {} started ({trigger:?})", self.cycle_count);

        // Idle plus four stages, each ticked once.
        for _ in 0..=StateId::COUNT {
            match self.fsm.current_state() {
                StateId::Idle => {}
                StateId::Gathering => self.gather(sensor, pump),
                StateId::Proposing => self.propose(),
                StateId::Constraining => self.constrain(),
                StateId::Dispatching => self.dispatch(pump, started, events),
            }
            match self.fsm.tick(&mut self.ctx) {
                Some((from, to)) => {
                    events.emit(&AppEvent::StateChanged { from, to });
                    if to == StateId::Idle {
                        break;
                    }
                }
                None => break,
            }
        }

        let result = self.finish();
        self.report(&result, events, audit_sink);
        result
    }

    // ── Command handling ──────────────────────────────────────

    /// Process an external command.  Returns the trigger to run when the
    /// command asks for a cycle.
    pub fn handle_command(
        &mut self,
        cmd: AppCommand,
        now: DateTime<Utc>,
    ) -> Result<Option<TriggerKind>, Error> {
        match cmd {
            AppCommand::TriggerCycle(kind) => Ok(Some(kind)),
            AppCommand::AnnounceMeal {
                carbs_g,
                absorption_minutes,
            } => {
                if !carbs_g.is_finite() || carbs_g <= 0.0 {
                    return Err(ConfigError::ValidationFailed("meal carbs must be positive").into());
                }
                if absorption_minutes.is_some_and(|m| !(15..=MAX_ABSORPTION_MINUTES).contains(&m)) {
                    return Err(ConfigError::ValidationFailed("meal absorption must be 15–720 min").into());
                }
                self.dispatcher.record_meal(MealEvent {
                    timestamp: now,
                    carbs_g,
                    absorption_minutes: absorption_minutes
                        .unwrap_or(self.config.default_absorption_minutes),
                })?;
                Ok(Some(TriggerKind::Manual))
            }
            AppCommand::SetLoopMode(mode) => {
                info!("Loop mode {:?} -> {:?}", self.config.loop_mode, mode);
                self.config.loop_mode = mode;
                Ok(None)
            }
            AppCommand::Cancel => {
                self.ctx.cancel.cancel();
                Ok(None)
            }
        }
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn state(&self) -> StateId {
        self.fsm.current_state()
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.config.loop_mode
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Shared handle that cancels the cycle in flight.
    pub fn cancel_token(&self) -> CancelToken {
        self.ctx.cancel.clone()
    }

    pub fn event_log(&self) -> &EventLog<S> {
        self.dispatcher.log()
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn profiles(&self) -> &R {
        &self.profiles
    }

    /// Publishing a new profile version goes through here.
    pub fn profiles_mut(&mut self) -> &mut R {
        &mut self.profiles
    }

    // ── Stages ────────────────────────────────────────────────

    fn gather(&mut self, sensor: &mut impl SensorPort, pump: &mut impl PumpPort) {
        let now = self.ctx.started_at;

        let profile = match self
            .profiles
            .active_profile(now)
            .and_then(|p| p.validate().map(|()| p))
        {
            Ok(p) => p,
            Err(e) => {
                error!("Cycle {}: no usable profile: {e}", self.ctx.cycle_id);
                self.ctx.conclude(ReasonCode::ConfigurationFault, e.to_string());
                return;
            }
        };

        let since = now - Duration::minutes(i64::from(self.config.glucose_history_minutes));
        let readings = match sensor
            .latest_readings(since)
            .and_then(|r| validate_readings(&r).map(|()| r))
        {
            Ok(r) => r,
            Err(e) => {
                warn!("Cycle {}: sensor: {e}", self.ctx.cycle_id);
                self.ctx.conclude(ReasonCode::SensorFault, e.to_string());
                return;
            }
        };

        // Read-consistent view of the log as of cycle start.
        let window = self.config.activity_lookback(&profile.insulin);
        let snapshot = match self.dispatcher.log().snapshot(now - window, now) {
            Ok(s) => s,
            Err(e) => {
                error!("Cycle {}: event log unreadable: {e}", self.ctx.cycle_id);
                self.ctx.conclude(ReasonCode::StorageFault, e.to_string());
                return;
            }
        };
        let activity = ActivityModel::state(now, &snapshot, &profile);

        let stale = match readings.last() {
            None => Some("no readings".to_string()),
            Some(r) if r.age(now) > self.config.stale_after() => Some(format!(
                "newest reading is {} s old",
                r.age(now).num_seconds()
            )),
            Some(_) => None,
        };

        self.ctx.inputs = Some(GatheredInputs {
            readings,
            profile,
            activity,
            capabilities: pump.capabilities(),
            last_bolus_at: snapshot.last_counted_bolus().map(|d| d.requested_at),
        });

        if let Some(detail) = stale {
            warn!("Cycle {}: stale data ({detail})", self.ctx.cycle_id);
            self.ctx.conclude(ReasonCode::StaleData, detail);
        }
    }

    fn propose(&mut self) {
        let Some(inputs) = self.ctx.inputs.as_ref() else {
            return;
        };
        let now = self.ctx.started_at;
        let segment = *inputs.profile.segment_at(now);
        let input = StrategyInput {
            now,
            glucose: &inputs.readings,
            activity: inputs.activity,
            segment: &segment,
            scheduled_basal_mu_per_hour: inputs.profile.basal_at(now),
            stale_after: self.config.stale_after(),
            bolus_fraction: self.config.bolus_fraction,
            temp_basal_minutes: self.config.temp_basal_minutes,
        };

        let strategy = &self.strategy;
        let outcome = catch_unwind(AssertUnwindSafe(|| strategy.propose(&input)))
            .unwrap_or_else(|payload| Err(StrategyError::Panicked(panic_message(&*payload))));

        match outcome {
            Ok(proposal) => {
                self.ctx.proposal = Some(proposal);
                if let Proposal::NoChange(why) = proposal {
                    let reason = match why {
                        NoChangeReason::NoData | NoChangeReason::StaleData => ReasonCode::StaleData,
                        _ => ReasonCode::NoChange,
                    };
                    self.ctx.conclude(reason, why.to_string());
                }
            }
            Err(e) => {
                error!("Cycle {}: strategy {} failed: {e}", self.ctx.cycle_id, self.strategy.name());
                self.ctx.conclude(ReasonCode::StrategyFault, e.to_string());
            }
        }
    }

    fn constrain(&mut self) {
        let (Some(inputs), Some(Proposal::Dose(dose))) = (self.ctx.inputs.as_ref(), self.ctx.proposal)
        else {
            return;
        };
        let cctx = ConstraintContext {
            now: self.ctx.started_at,
            glucose_mg_dl: inputs.newest().map_or(f64::NAN, |r| r.value_mg_dl),
            iob_mu: inputs.activity.iob_mu,
            profile: &inputs.profile,
            limits: &self.config.limits,
            loop_mode: self.config.loop_mode,
            capabilities: inputs.capabilities,
            last_bolus_at: inputs.last_bolus_at,
        };

        match self.pipeline.apply(&dose, &cctx) {
            Ok(outcome) => {
                match &outcome.decision {
                    PipelineDecision::Approved(approved) if approved.is_noop() => {
                        self.ctx
                            .conclude(ReasonCode::ClampedToZero, "bolus constrained to zero");
                    }
                    PipelineDecision::Approved(approved) => {
                        if let Some(kind) = approved.binding {
                            info!(
                                "Cycle {}: {} {} mU limited to {} mU by {kind}",
                                self.ctx.cycle_id,
                                approved.kind.tag(),
                                approved.proposed_mu,
                                approved.amount_mu
                            );
                        }
                        self.ctx.approved = Some(*approved);
                    }
                    PipelineDecision::Vetoed { by, reason } => {
                        let code = match by {
                            ConstraintKind::LowGlucoseSuspend => ReasonCode::Suspended,
                            other => ReasonCode::Vetoed(*other),
                        };
                        self.ctx.conclude(code, reason.clone());
                    }
                }
                self.ctx.outcome = Some(outcome);
            }
            Err(e) => {
                error!("Cycle {}: constraint pipeline failed: {e}", self.ctx.cycle_id);
                self.ctx.conclude(ReasonCode::PipelineFault, e.to_string());
            }
        }
    }

    fn dispatch(&mut self, pump: &mut impl PumpPort, started: Instant, events: &mut impl EventSink) {
        if self.ctx.is_concluded() {
            return;
        }
        let Some(approved) = self.ctx.approved else {
            self.ctx.conclude(ReasonCode::NoChange, "nothing approved");
            return;
        };

        if self.config.loop_mode == LoopMode::Open {
            events.emit(&AppEvent::Suggestion {
                at: self.ctx.started_at,
                dose: approved,
            });
            self.ctx
                .conclude(ReasonCode::Suggested, "open loop, dose not sent");
            return;
        }

        let elapsed = Duration::from_std(started.elapsed()).unwrap_or_else(|_| Duration::zero());
        let issued_at = self.ctx.started_at + elapsed;
        match self
            .dispatcher
            .dispatch(&approved, self.ctx.started_at, issued_at, pump)
        {
            Ok(event) => {
                self.ctx.delivery = Some(event);
                let (code, detail) = match event.ack {
                    AckState::Confirmed => (ReasonCode::Dosed, ""),
                    AckState::Failed => (ReasonCode::DispatchRejected, "pump rejected the command twice"),
                    AckState::Unknown | AckState::Pending => {
                        (ReasonCode::DispatchUnknown, "no acknowledgment, counted as delivered")
                    }
                };
                self.ctx.conclude(code, detail);
            }
            Err(DispatchError::LogAfterSend { event, error }) => {
                self.ctx.delivery = Some(event);
                self.ctx
                    .conclude(ReasonCode::StorageFault, format!("outcome not recorded: {error}"));
            }
            Err(DispatchError::Empty) => {
                self.ctx
                    .conclude(ReasonCode::ClampedToZero, "bolus constrained to zero");
            }
            Err(e) => {
                self.ctx.conclude(ReasonCode::StorageFault, e.to_string());
            }
        }
    }

    // ── Result / reporting ────────────────────────────────────

    fn finish(&mut self) -> LoopCycleResult {
        let ctx = &mut self.ctx;
        let inputs = ctx.inputs.as_ref().map(|i| {
            let newest = i.newest();
            InputSummary {
                reading_count: i.readings.len(),
                newest_glucose_mg_dl: newest.map(|r| r.value_mg_dl),
                newest_reading_at: newest.map(|r| r.timestamp),
                trend: newest.map(|r| r.trend),
                iob_mu: Some(i.activity.iob_mu),
                cob_g: Some(i.activity.cob_g),
                profile_name: Some(i.profile.name.clone()),
                scheduled_basal_mu_per_hour: Some(i.profile.basal_at(ctx.started_at)),
            }
        });

        LoopCycleResult {
            cycle_id: ctx.cycle_id,
            started_at: ctx.started_at,
            trigger: ctx.trigger.unwrap_or(TriggerKind::Manual),
            loop_mode: self.config.loop_mode,
            strategy: self.strategy.name(),
            inputs: inputs.unwrap_or_default(),
            proposal: ctx.proposal,
            verdicts: ctx
                .outcome
                .as_ref()
                .map(|o| o.verdicts.clone())
                .unwrap_or_default(),
            approved: ctx.approved,
            delivery: ctx.delivery,
            reason: ctx.reason.unwrap_or(ReasonCode::NoChange),
            detail: core::mem::take(&mut ctx.detail),
        }
    }

    fn report(
        &mut self,
        result: &LoopCycleResult,
        events: &mut impl EventSink,
        audit_sink: &mut impl AuditSink,
    ) {
        if result.requires_attention() {
            error!("Cycle {}: {} ({})", result.cycle_id, result.reason, result.detail);
        } else {
            info!("Cycle {}: {}", result.cycle_id, result.reason);
        }

        events.emit(&AppEvent::CycleCompleted {
            cycle_id: result.cycle_id,
            reason: result.reason,
            approved: result.approved,
        });

        if !result.reason.is_nominal() {
            let message = if result.detail.is_empty() {
                result.reason.to_string()
            } else {
                format!("{}: {}", result.reason, result.detail)
            };
            events.emit(&AppEvent::Notification(Notification {
                at: result.started_at,
                cycle_id: result.cycle_id,
                reason: result.reason,
                fault: result.fault(),
                message,
                attention_required: result.requires_attention(),
            }));
        }

        match self.audit.record(result, audit_sink) {
            Ok(()) => {}
            Err(e) if e.is_buffered() => {
                warn!("Cycle {}: audit record buffered ({} pending)", result.cycle_id, self.audit.pending());
            }
            Err(e) => error!("Cycle {}: audit record lost: {e}", result.cycle_id),
        }
    }
}

/// Reject unordered or physically implausible readings.
fn validate_readings(readings: &[GlucoseReading]) -> Result<(), SensorError> {
    if readings.windows(2).any(|w| w[1].timestamp < w[0].timestamp) {
        return Err(SensorError::OutOfOrder);
    }
    if readings.iter().any(|r| {
        !r.value_mg_dl.is_finite() || !(MIN_PLAUSIBLE_MG_DL..=MAX_PLAUSIBLE_MG_DL).contains(&r.value_mg_dl)
    }) {
        return Err(SensorError::OutOfRange);
    }
    Ok(())
}

fn panic_message(payload: &(dyn core::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
