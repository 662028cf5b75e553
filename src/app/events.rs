//! Outbound application events.
//!
//! The [`LoopService`](super::service::LoopService) emits these through the
//! [`EventSink`](super::ports::EventSink) port.  Adapters on the other
//! side decide what to do with them: log them, push them to a phone,
//! raise an alarm.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::app::cycle::ReasonCode;
use crate::config::LoopMode;
use crate::constraints::ApprovedDose;
use crate::error::FaultKind;
use crate::fsm::StateId;

/// Structured events emitted by the dosing core.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AppEvent {
    /// The service has started.
    Started {
        strategy: &'static str,
        loop_mode: LoopMode,
    },

    /// The cycle FSM moved between stages.
    StateChanged { from: StateId, to: StateId },

    /// A cycle finished (nominal or not).
    CycleCompleted {
        cycle_id: u64,
        reason: ReasonCode,
        approved: Option<ApprovedDose>,
    },

    /// A non-nominal outcome the wearer should see.
    Notification(Notification),

    /// Open loop: a dose the wearer may choose to deliver by hand.
    Suggestion {
        at: DateTime<Utc>,
        dose: ApprovedDose,
    },
}

/// Timestamped notice for a non-nominal cycle outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub at: DateTime<Utc>,
    pub cycle_id: u64,
    pub reason: ReasonCode,
    pub fault: Option<FaultKind>,
    pub message: String,
    pub attention_required: bool,
}
