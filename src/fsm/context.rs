//! Per-cycle blackboard threaded through every FSM handler.
//!
//! The [`LoopService`](crate::app::service::LoopService) does each stage's
//! I/O and writes the results here; the state handlers read them to decide
//! where the cycle goes next.  A `reason` set by any stage means the cycle
//! ends without a dose and skips straight to `Dispatching`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::app::cycle::ReasonCode;
use crate::app::ports::{PumpCapabilities, TriggerKind};
use crate::constraints::{ApprovedDose, PipelineOutcome};
use crate::profile::Profile;
use crate::strategy::Proposal;
use crate::types::{ActivityState, DoseEvent, GlucoseReading};

/// Shared cancellation flag for the cycle in flight.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.  Honoured up to `Constraining`.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Inputs collected during `Gathering`.
#[derive(Debug, Clone)]
pub struct GatheredInputs {
    /// Oldest first.
    pub readings: Vec<GlucoseReading>,
    pub profile: Arc<Profile>,
    pub activity: ActivityState,
    pub capabilities: PumpCapabilities,
    pub last_bolus_at: Option<DateTime<Utc>>,
}

impl GatheredInputs {
    pub fn newest(&self) -> Option<&GlucoseReading> {
        self.readings.last()
    }
}

/// Blackboard for one cycle.
#[derive(Debug)]
pub struct CycleContext {
    pub cycle_id: u64,
    pub started_at: DateTime<Utc>,
    pub trigger: Option<TriggerKind>,
    pub cancel: CancelToken,
    /// Set on entering `Dispatching`; cancellation is ignored from then on.
    pub committed: bool,

    pub inputs: Option<GatheredInputs>,
    pub proposal: Option<Proposal>,
    pub outcome: Option<PipelineOutcome>,
    pub approved: Option<ApprovedDose>,
    pub delivery: Option<DoseEvent>,

    /// Terminal reason; `None` while the cycle can still produce a dose.
    pub reason: Option<ReasonCode>,
    pub detail: String,
}

impl CycleContext {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cycle_id: 0,
            started_at: DateTime::<Utc>::MIN_UTC,
            trigger: None,
            cancel,
            committed: false,
            inputs: None,
            proposal: None,
            outcome: None,
            approved: None,
            delivery: None,
            reason: None,
            detail: String::new(),
        }
    }

    /// Clear per-cycle state and arm the trigger.
    pub fn begin(&mut self, cycle_id: u64, started_at: DateTime<Utc>, trigger: TriggerKind) {
        self.cycle_id = cycle_id;
        self.started_at = started_at;
        self.trigger = Some(trigger);
        self.cancel.reset();
        self.committed = false;
        self.inputs = None;
        self.proposal = None;
        self.outcome = None;
        self.approved = None;
        self.delivery = None;
        self.reason = None;
        self.detail.clear();
    }

    /// End the cycle without a dose.  The first reason wins.
    pub fn conclude(&mut self, reason: ReasonCode, detail: impl Into<String>) {
        if self.reason.is_none() {
            self.reason = Some(reason);
            self.detail = detail.into();
        }
    }

    pub fn is_concluded(&self) -> bool {
        self.reason.is_some()
    }

    /// Cancellation that still takes effect in the current stage.
    pub fn cancel_pending(&self) -> bool {
        !self.committed && self.cancel.is_cancelled()
    }
}
