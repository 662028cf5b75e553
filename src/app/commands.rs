//! Inbound commands to the loop service.
//!
//! Actions requested by the outside world (UI, scheduler, companion app)
//! that the [`LoopService`](super::service::LoopService) interprets.

use serde::{Deserialize, Serialize};

use crate::app::ports::TriggerKind;
use crate::config::LoopMode;

/// Commands that adapters can send into the dosing core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AppCommand {
    /// Request a cycle now.
    TriggerCycle(TriggerKind),

    /// Record a meal at the current time.  Absorption falls back to the
    /// configured default.
    AnnounceMeal {
        carbs_g: f64,
        absorption_minutes: Option<u16>,
    },

    /// Switch between closed loop, open loop and low-glucose-suspend only.
    SetLoopMode(LoopMode),

    /// Cancel the cycle in flight, if it has not reached dispatch.
    Cancel,
}
