//! Cycle trigger scheduler.
//!
//! Decides *when* a cycle should start.  The scheduler notifies a
//! [`TriggerDelegate`] when it fires; it knows nothing about runners,
//! locks or pumps, so it is testable with a recording delegate.
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                 Trigger Sources                    │
//! │                                                    │
//! │   ┌──────────────┐            ┌──────────────┐     │
//! │   │ Fixed cadence│            │ Fresh reading│     │
//! │   └──────┬───────┘            └──────┬───────┘     │
//! │          ▼                           ▼             │
//! │   ┌────────────────────────────────────────────┐   │
//! │   │             TriggerDelegate                │   │
//! │   └─────────────────────┬──────────────────────┘   │
//! │                         ▼                          │
//! │                 LoopRunner::trigger()              │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! At most one trigger fires per poll.  Fresh data wins over cadence, and
//! any fire restarts the cadence interval.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

use crate::app::ports::{TriggerDelegate, TriggerKind};
use crate::config::{EngineConfig, TriggerMode};

/// The scheduler engine.
#[derive(Debug, Clone)]
pub struct CycleScheduler {
    mode: TriggerMode,
    interval: Duration,
    last_cycle_at: Option<DateTime<Utc>>,
    /// Timestamp of the newest reading that already triggered (or was
    /// seen by) a cycle.
    last_reading_at: Option<DateTime<Utc>>,
    enabled: bool,
}

impl CycleScheduler {
    pub fn new(mode: TriggerMode, interval: Duration) -> Self {
        Self {
            mode,
            interval,
            last_cycle_at: None,
            last_reading_at: None,
            enabled: true,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.trigger_mode,
            Duration::seconds(i64::from(config.cycle_interval_secs)),
        )
    }

    /// Enable or disable all triggers.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Check both sources and fire at most one trigger.
    ///
    /// * `now`: current wall-clock time.
    /// * `newest_reading_at`: timestamp of the newest reading the sensor
    ///   collaborator holds, if any.
    pub fn poll(
        &mut self,
        now: DateTime<Utc>,
        newest_reading_at: Option<DateTime<Utc>>,
        delegate: &mut dyn TriggerDelegate,
    ) -> Option<TriggerKind> {
        if !self.enabled {
            return None;
        }

        let fresh = newest_reading_at.filter(|t| self.last_reading_at.is_none_or(|seen| *t > seen));
        if let Some(t) = fresh {
            self.last_reading_at = Some(t);
        }

        let kind = if fresh.is_some() && self.mode != TriggerMode::Cadence {
            TriggerKind::FreshData
        } else if self.mode != TriggerMode::FreshData && self.cadence_due(now) {
            TriggerKind::Cadence
        } else {
            return None;
        };

        match kind {
            TriggerKind::Cadence => info!("Scheduler: cadence fire (every {} s)", self.interval.num_seconds()),
            _ => debug!("Scheduler: fresh reading, firing"),
        }
        self.last_cycle_at = Some(now);
        delegate.on_trigger(kind, now);
        Some(kind)
    }

    /// Record a cycle started outside the scheduler (manual trigger).
    pub fn note_cycle(&mut self, at: DateTime<Utc>) {
        self.last_cycle_at = Some(at);
    }

    /// When the next cadence fire is due, `None` before the first poll or
    /// in fresh-data-only mode.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        if self.mode == TriggerMode::FreshData {
            return None;
        }
        self.last_cycle_at.map(|t| t + self.interval)
    }

    fn cadence_due(&self, now: DateTime<Utc>) -> bool {
        self.last_cycle_at.is_none_or(|t| now - t >= self.interval)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
