//! Cycle serialization.
//!
//! At most one cycle runs at a time.  A trigger that arrives while a cycle
//! is in flight does not start a second one: it sets a pending flag, and
//! the thread that owns the in-flight cycle runs one more cycle as soon as
//! it finishes.  Any number of triggers during one cycle coalesce into a
//! single rerun.
//!
//! ```text
//!  trigger ──▶ pending = kind ──▶ try_lock ──busy──▶ Queued
//!                                    │ acquired
//!                                    ▼
//!                     while pending.take(): run cycle
//!                                    │
//!                     unlock; pending set meanwhile? ──yes──▶ retry lock
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, TryLockError};

use chrono::{DateTime, Utc};
use log::{debug, warn};

use super::cycle::LoopCycleResult;
use super::ports::{
    AuditSink, Clock, EventSink, PersistencePort, ProfilePort, PumpPort, SensorPort,
    TriggerDelegate, TriggerKind,
};
use super::service::LoopService;
pub use crate::fsm::context::CancelToken;

/// Something that can run one cycle to completion.
pub trait CycleTarget {
    fn run_cycle(&mut self, now: DateTime<Utc>, trigger: TriggerKind) -> LoopCycleResult;
}

/// What a call to [`LoopRunner::trigger`] did.
#[derive(Debug)]
pub enum RunOutcome {
    /// This caller ran the cycles (the requested one plus any coalesced
    /// reruns).
    Ran(Vec<LoopCycleResult>),
    /// A cycle was in flight; its owner will run one more.
    Queued,
}

const NO_TRIGGER: u8 = 0;

const fn encode(kind: TriggerKind) -> u8 {
    match kind {
        TriggerKind::Cadence => 1,
        TriggerKind::FreshData => 2,
        TriggerKind::Manual => 3,
    }
}

const fn decode(code: u8) -> Option<TriggerKind> {
    match code {
        1 => Some(TriggerKind::Cadence),
        2 => Some(TriggerKind::FreshData),
        3 => Some(TriggerKind::Manual),
        _ => None,
    }
}

/// Serializes cycles over a shared target.  `Sync` when `T: Send`.
pub struct LoopRunner<T: CycleTarget, C: Clock> {
    target: Mutex<T>,
    /// Latest pending trigger, `NO_TRIGGER` when none.
    pending: AtomicU8,
    clock: C,
    cancel: CancelToken,
}

impl<T: CycleTarget, C: Clock> LoopRunner<T, C> {
    pub fn new(target: T, clock: C, cancel: CancelToken) -> Self {
        Self {
            target: Mutex::new(target),
            pending: AtomicU8::new(NO_TRIGGER),
            clock,
            cancel,
        }
    }

    /// Request a cycle.  Runs it on the calling thread unless another
    /// thread is already running one.
    pub fn trigger(&self, kind: TriggerKind) -> RunOutcome {
        self.pending.store(encode(kind), Ordering::SeqCst);
        let mut results = Vec::new();

        loop {
            let mut guard = match self.target.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => {
                    debug!("Cycle in flight, {kind:?} trigger coalesced");
                    return if results.is_empty() {
                        RunOutcome::Queued
                    } else {
                        RunOutcome::Ran(results)
                    };
                }
                Err(TryLockError::Poisoned(poisoned)) => {
                    warn!("Previous cycle panicked; continuing with recovered state");
                    poisoned.into_inner()
                }
            };

            while let Some(next) = decode(self.pending.swap(NO_TRIGGER, Ordering::SeqCst)) {
                results.push(guard.run_cycle(self.clock.now(), next));
            }
            drop(guard);

            // A trigger may have landed between the last swap and the unlock.
            if self.pending.load(Ordering::SeqCst) == NO_TRIGGER {
                return RunOutcome::Ran(results);
            }
        }
    }

    /// Cancel the cycle in flight (effective up to constraint evaluation).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst) != NO_TRIGGER
    }

    /// Run `f` with exclusive access to the target, waiting for any
    /// cycle in flight to finish.
    pub fn with_target<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.target.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    /// Consume the runner and return the target.
    pub fn into_inner(self) -> T {
        self.target
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<T: CycleTarget, C: Clock> TriggerDelegate for &LoopRunner<T, C> {
    fn on_trigger(&mut self, kind: TriggerKind, _at: DateTime<Utc>) {
        let _ = self.trigger(kind);
    }
}

// ───────────────────────────────────────────────────────────────
// Service bound to its collaborators
// ───────────────────────────────────────────────────────────────

/// A [`LoopService`] together with the ports it drives each cycle.
pub struct BoundLoop<S, R, Se, Pu, Ev, Au>
where
    S: PersistencePort,
    R: ProfilePort,
{
    pub service: LoopService<S, R>,
    pub sensor: Se,
    pub pump: Pu,
    pub events: Ev,
    pub audit: Au,
}

impl<S, R, Se, Pu, Ev, Au> BoundLoop<S, R, Se, Pu, Ev, Au>
where
    S: PersistencePort,
    R: ProfilePort,
    Ev: EventSink,
{
    /// Start the service and bind it.
    pub fn new(mut service: LoopService<S, R>, sensor: Se, pump: Pu, mut events: Ev, audit: Au) -> Self {
        service.start(&mut events);
        Self {
            service,
            sensor,
            pump,
            events,
            audit,
        }
    }
}

impl<S, R, Se, Pu, Ev, Au> CycleTarget for BoundLoop<S, R, Se, Pu, Ev, Au>
where
    S: PersistencePort,
    R: ProfilePort,
    Se: SensorPort,
    Pu: PumpPort,
    Ev: EventSink,
    Au: AuditSink,
{
    fn run_cycle(&mut self, now: DateTime<Utc>, trigger: TriggerKind) -> LoopCycleResult {
        self.service.run_cycle(
            now,
            trigger,
            &mut self.sensor,
            &mut self.pump,
            &mut self.events,
            &mut self.audit,
        )
    }
}
