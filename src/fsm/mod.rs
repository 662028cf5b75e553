//! Function-pointer finite state machine driving one loop cycle.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │  StateTable                                                   │
//! │  ┌──────────────┬───────────┬──────────┬───────────────────┐  │
//! │  │ StateId      │ on_enter  │ on_exit  │ on_update         │  │
//! │  ├──────────────┼───────────┼──────────┼───────────────────┤  │
//! │  │ Idle         │ fn(ctx)   │ -        │ fn(ctx)->Option<> │  │
//! │  │ Gathering    │ -         │ -        │ fn(ctx)->Option<> │  │
//! │  │ Proposing    │ -         │ -        │ fn(ctx)->Option<> │  │
//! │  │ Constraining │ -         │ -        │ fn(ctx)->Option<> │  │
//! │  │ Dispatching  │ fn(ctx)   │ -        │ fn(ctx)->Option<> │  │
//! │  └──────────────┴───────────┴──────────┴───────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The service performs the work of a stage, then calls [`Fsm::tick`];
//! `on_update` for the current state inspects the [`CycleContext`] and
//! returns the next state.  On a transition the engine runs `on_exit` for
//! the current state, then `on_enter` for the next.

pub mod context;
pub mod states;

use context::CycleContext;
use log::info;

// ---------------------------------------------------------------------------
// State identity
// ---------------------------------------------------------------------------

/// Stages of a cycle.
/// Must stay in sync with the table built in [`states::build_state_table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[repr(u8)]
pub enum StateId {
    Idle = 0,
    Gathering = 1,
    Proposing = 2,
    Constraining = 3,
    Dispatching = 4,
}

impl StateId {
    /// Total number of states, sizes the table array.
    pub const COUNT: usize = 5;

    /// Convert an index back to `StateId`.  Asserts in debug builds;
    /// falls back to `Idle` in release.
    pub fn from_index(idx: usize) -> Self {
        match idx {
            0 => Self::Idle,
            1 => Self::Gathering,
            2 => Self::Proposing,
            3 => Self::Constraining,
            4 => Self::Dispatching,
            _ => {
                debug_assert!(false, "invalid state index: {idx}");
                Self::Idle
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Function-pointer type aliases
// ---------------------------------------------------------------------------

/// Signature for `on_enter` and `on_exit` actions.
pub type StateActionFn = fn(&mut CycleContext);

/// Per-tick update handler.  `Some(next)` triggers a transition.
pub type StateUpdateFn = fn(&mut CycleContext) -> Option<StateId>;

// ---------------------------------------------------------------------------
// State descriptor (one row in the table)
// ---------------------------------------------------------------------------

/// Static descriptor for a single FSM state.
pub struct StateDescriptor {
    pub id: StateId,
    pub name: &'static str,
    pub on_enter: Option<StateActionFn>,
    pub on_exit: Option<StateActionFn>,
    pub on_update: StateUpdateFn,
}

// ---------------------------------------------------------------------------
// FSM engine
// ---------------------------------------------------------------------------

/// The cycle state machine.
pub struct Fsm {
    /// Fixed-size table indexed by `StateId as usize`.
    table: [StateDescriptor; StateId::COUNT],
    current: usize,
    tick_count: u64,
    state_entry_tick: u64,
}

impl Fsm {
    pub fn new(table: [StateDescriptor; StateId::COUNT], initial: StateId) -> Self {
        Self {
            table,
            current: initial as usize,
            tick_count: 0,
            state_entry_tick: 0,
        }
    }

    /// Run the initial `on_enter`.  Call once before the first `tick()`.
    pub fn start(&mut self, ctx: &mut CycleContext) {
        info!("FSM starting in state: {}", self.table[self.current].name);
        if let Some(enter) = self.table[self.current].on_enter {
            enter(ctx);
        }
    }

    /// Advance by one tick.  Returns the `(from, to)` pair when a
    /// transition happened.
    pub fn tick(&mut self, ctx: &mut CycleContext) -> Option<(StateId, StateId)> {
        self.tick_count += 1;
        let from = self.current_state();
        let next = (self.table[self.current].on_update)(ctx)?;
        if next == from {
            return None;
        }
        self.transition(next, ctx);
        Some((from, next))
    }

    /// Jump to `next` regardless of what `on_update` would return.
    pub fn force_transition(&mut self, next: StateId, ctx: &mut CycleContext) {
        if next as usize != self.current {
            self.transition(next, ctx);
        }
    }

    pub fn current_state(&self) -> StateId {
        StateId::from_index(self.current)
    }

    pub fn ticks_in_current_state(&self) -> u64 {
        self.tick_count - self.state_entry_tick
    }

    fn transition(&mut self, next_id: StateId, ctx: &mut CycleContext) {
        let next_idx = next_id as usize;

        info!(
            "FSM transition: {} -> {}",
            self.table[self.current].name, self.table[next_idx].name
        );

        if let Some(exit) = self.table[self.current].on_exit {
            exit(ctx);
        }

        self.current = next_idx;
        self.state_entry_tick = self.tick_count;

        if let Some(enter) = self.table[self.current].on_enter {
            enter(ctx);
        }
    }
}
