//! Log-based sink adapters.
//!
//! [`LogEventSink`] implements [`EventSink`] and [`LogAuditSink`]
//! implements [`AuditSink`], both by writing structured lines through the
//! `log` facade.  A push-notification or database adapter would implement
//! the same traits.

use log::{error, info, warn};

use crate::app::events::AppEvent;
use crate::app::ports::{AuditError, AuditSink, EventSink};
use crate::audit::AuditRecord;

/// Adapter that logs every [`AppEvent`].
#[derive(Debug, Default)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &AppEvent) {
        match event {
            AppEvent::Started {
                strategy,
                loop_mode,
            } => {
                info!("START | strategy={strategy} mode={loop_mode:?}");
            }
            AppEvent::StateChanged { from, to } => {
                info!("STATE | {:?} -> {:?}", from, to);
            }
            AppEvent::CycleCompleted {
                cycle_id,
                reason,
                approved,
            } => match approved {
                Some(a) => info!(
                    "CYCLE | #{cycle_id} {reason} | {} {} mU (proposed {} mU)",
                    a.kind.tag(),
                    a.amount_mu,
                    a.proposed_mu
                ),
                None => info!("CYCLE | #{cycle_id} {reason}"),
            },
            AppEvent::Notification(n) if n.attention_required => {
                error!("NOTIFY | {} | ATTENTION | {}", n.at.format("%H:%M:%S"), n.message);
            }
            AppEvent::Notification(n) => {
                warn!("NOTIFY | {} | {}", n.at.format("%H:%M:%S"), n.message);
            }
            AppEvent::Suggestion { at, dose } => {
                info!(
                    "SUGGEST | {} | {} {} mU",
                    at.format("%H:%M:%S"),
                    dose.kind.tag(),
                    dose.amount_mu
                );
            }
        }
    }
}

/// Audit sink that writes one log line per record.
#[derive(Debug, Default)]
pub struct LogAuditSink {
    /// Emit the full JSON body, not just the summary.
    verbose: bool,
}

impl LogAuditSink {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl AuditSink for LogAuditSink {
    fn record(&mut self, record: &AuditRecord) -> Result<(), AuditError> {
        let short = record.digest.get(..12).unwrap_or(&record.digest);
        info!(
            "AUDIT | #{} cycle={} {} | {}{} | {short}",
            record.sequence,
            record.cycle_id,
            record.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            record.reason,
            if record.attention_required { " [attention]" } else { "" },
        );
        if self.verbose {
            info!("AUDIT | body={}", record.body);
        }
        Ok(())
    }
}
