//! Concrete state handler functions and table builder.
//!
//! Each state is defined by plain `fn` pointers: no closures, no dynamic
//! dispatch.  Handlers only decide transitions from what the service wrote
//! into the [`CycleContext`]; they never do I/O.
//!
//! ```text
//!  IDLE ──[trigger]──▶ GATHERING ──▶ PROPOSING ──▶ CONSTRAINING ──▶ DISPATCHING ──▶ IDLE
//!                          │             │              │                ▲
//!                          └─[stale / config fault / cancelled]──────────┤
//!                                        └─[no change / strategy fault]──┤
//!                                                       └─[cancelled]────┘
//! ```

use super::context::CycleContext;
use super::{StateDescriptor, StateId};
use crate::app::cycle::ReasonCode;
use log::{debug, info};

// ═══════════════════════════════════════════════════════════════════════════
//  Table builder
// ═══════════════════════════════════════════════════════════════════════════

/// Build the static state table.  Called once at startup.
pub fn build_state_table() -> [StateDescriptor; StateId::COUNT] {
    [
        // Index 0: Idle
        StateDescriptor {
            id: StateId::Idle,
            name: "Idle",
            on_enter: Some(idle_enter),
            on_exit: None,
            on_update: idle_update,
        },
        // Index 1: Gathering
        StateDescriptor {
            id: StateId::Gathering,
            name: "Gathering",
            on_enter: None,
            on_exit: None,
            on_update: gathering_update,
        },
        // Index 2: Proposing
        StateDescriptor {
            id: StateId::Proposing,
            name: "Proposing",
            on_enter: None,
            on_exit: None,
            on_update: proposing_update,
        },
        // Index 3: Constraining
        StateDescriptor {
            id: StateId::Constraining,
            name: "Constraining",
            on_enter: None,
            on_exit: None,
            on_update: constraining_update,
        },
        // Index 4: Dispatching
        StateDescriptor {
            id: StateId::Dispatching,
            name: "Dispatching",
            on_enter: Some(dispatching_enter),
            on_exit: None,
            on_update: dispatching_update,
        },
    ]
}

/// Shared guard for the cancellable stages.
fn bail_out(ctx: &mut CycleContext) -> Option<StateId> {
    if ctx.cancel_pending() {
        ctx.conclude(ReasonCode::Cancelled, "cancelled before dispatch");
        return Some(StateId::Dispatching);
    }
    ctx.is_concluded().then_some(StateId::Dispatching)
}

// ═══════════════════════════════════════════════════════════════════════════
//  IDLE
// ═══════════════════════════════════════════════════════════════════════════

fn idle_enter(ctx: &mut CycleContext) {
    ctx.trigger = None;
    ctx.cancel.reset();
    debug!("IDLE: waiting for trigger");
}

fn idle_update(ctx: &mut CycleContext) -> Option<StateId> {
    ctx.trigger.map(|_| StateId::Gathering)
}

// ═══════════════════════════════════════════════════════════════════════════
//  GATHERING / PROPOSING / CONSTRAINING
// ═══════════════════════════════════════════════════════════════════════════

fn gathering_update(ctx: &mut CycleContext) -> Option<StateId> {
    if let Some(next) = bail_out(ctx) {
        return Some(next);
    }
    if ctx.inputs.is_none() {
        ctx.conclude(ReasonCode::StaleData, "no inputs gathered");
        return Some(StateId::Dispatching);
    }
    Some(StateId::Proposing)
}

fn proposing_update(ctx: &mut CycleContext) -> Option<StateId> {
    if let Some(next) = bail_out(ctx) {
        return Some(next);
    }
    Some(StateId::Constraining)
}

fn constraining_update(ctx: &mut CycleContext) -> Option<StateId> {
    if ctx.cancel_pending() {
        ctx.approved = None;
    }
    bail_out(ctx).or(Some(StateId::Dispatching))
}

// ═══════════════════════════════════════════════════════════════════════════
//  DISPATCHING
// ═══════════════════════════════════════════════════════════════════════════

fn dispatching_enter(ctx: &mut CycleContext) {
    ctx.committed = true;
    match ctx.reason {
        Some(reason) => info!("DISPATCHING: cycle {} ends without dose ({reason})", ctx.cycle_id),
        None => debug!("DISPATCHING: cycle {} committed", ctx.cycle_id),
    }
}

fn dispatching_update(_ctx: &mut CycleContext) -> Option<StateId> {
    Some(StateId::Idle)
}
