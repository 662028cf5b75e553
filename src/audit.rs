//! Audit trail for completed cycles.
//!
//! Every [`LoopCycleResult`] becomes an [`AuditRecord`]: a JSON body plus a
//! SHA-256 digest chained to the previous record, so a reviewer can detect
//! a missing or edited entry.
//!
//! ```text
//!  digest[n] = SHA-256( digest[n-1] ‖ sequence[n] (LE) ‖ body[n] )
//! ```
//!
//! Records the sink refuses are kept in order and re-offered before the
//! next one.  Nothing is dropped silently: if the backlog overflows, the
//! oldest record is discarded with an error log and counted, as is a
//! result that fails to encode.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use hmac_sha256::Hash;
use log::{error, warn};
use serde::{Deserialize, Serialize};

use crate::app::cycle::{LoopCycleResult, ReasonCode};
use crate::app::ports::{AuditError, AuditSink};

/// Digest of the (virtual) record before the first one.
pub const GENESIS_DIGEST: [u8; 32] = [0; 32];

/// Default bound on records held while the sink is unavailable.
/// One day of 5-minute cycles.
const DEFAULT_BACKLOG: usize = 288;

/// One chained audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    pub cycle_id: u64,
    pub timestamp: DateTime<Utc>,
    /// Short reason text ("no dose, stale data").
    pub reason: String,
    pub attention_required: bool,
    /// Full cycle result, JSON.
    pub body: String,
    /// Hex digest of the previous record.
    pub prev_digest: String,
    /// Hex digest of this record.
    pub digest: String,
}

impl AuditRecord {
    /// Recompute this record's digest from its contents.
    pub fn compute_digest(prev: &[u8; 32], sequence: u64, body: &str) -> [u8; 32] {
        let mut h = Hash::new();
        h.update(prev);
        h.update(sequence.to_le_bytes());
        h.update(body.as_bytes());
        h.finalize()
    }

    /// Whether `digest` matches `prev_digest` and the body.
    pub fn is_intact(&self) -> bool {
        let Some(prev) = decode_hex(&self.prev_digest) else {
            return false;
        };
        encode_hex(&Self::compute_digest(&prev, self.sequence, &self.body)) == self.digest
    }
}

/// Chains, buffers and forwards audit records.
pub struct AuditTrail {
    sequence: u64,
    last_digest: [u8; 32],
    backlog: VecDeque<AuditRecord>,
    max_backlog: usize,
    dropped: u64,
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::with_backlog(DEFAULT_BACKLOG)
    }

    pub fn with_backlog(max_backlog: usize) -> Self {
        Self {
            sequence: 0,
            last_digest: GENESIS_DIGEST,
            backlog: VecDeque::new(),
            max_backlog: max_backlog.max(1),
            dropped: 0,
        }
    }

    /// Chain `result` and offer it (after any backlog) to `sink`.
    ///
    /// Returns the sink error if anything is still pending afterwards; the
    /// record itself is retained either way.
    pub fn record(
        &mut self,
        result: &LoopCycleResult,
        sink: &mut impl AuditSink,
    ) -> Result<(), AuditError> {
        let record = match self.chain(result) {
            Ok(r) => r,
            Err(e) => {
                self.dropped += 1;
                error!("Audit record for cycle {} not built: {}", result.cycle_id, e);
                return Err(e);
            }
        };
        if self.backlog.len() >= self.max_backlog {
            if let Some(lost) = self.backlog.pop_front() {
                self.dropped += 1;
                error!(
                    "Audit backlog full: discarded record #{} (cycle {}), {} discarded so far",
                    lost.sequence, lost.cycle_id, self.dropped
                );
            }
        }
        self.backlog.push_back(record);
        self.flush(sink)
    }

    /// Offer buffered records to `sink`, oldest first, stopping at the
    /// first refusal.
    pub fn flush(&mut self, sink: &mut impl AuditSink) -> Result<(), AuditError> {
        while let Some(front) = self.backlog.front() {
            if let Err(e) = sink.record(front) {
                warn!(
                    "Audit sink refused record #{}: {} ({} pending)",
                    front.sequence,
                    e,
                    self.backlog.len()
                );
                return Err(e);
            }
            self.backlog.pop_front();
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.backlog.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn last_digest(&self) -> String {
        encode_hex(&self.last_digest)
    }

    fn chain(&mut self, result: &LoopCycleResult) -> Result<AuditRecord, AuditError> {
        let body = serde_json::to_string(result).map_err(|e| AuditError::Encode(e.to_string()))?;
        self.sequence += 1;
        let digest = AuditRecord::compute_digest(&self.last_digest, self.sequence, &body);
        let record = AuditRecord {
            sequence: self.sequence,
            cycle_id: result.cycle_id,
            timestamp: result.started_at,
            reason: reason_text(result.reason, &result.detail),
            attention_required: result.requires_attention(),
            body,
            prev_digest: encode_hex(&self.last_digest),
            digest: encode_hex(&digest),
        };
        self.last_digest = digest;
        Ok(record)
    }
}

/// Verify an ordered run of records: each intact and linked to its
/// predecessor.  The first record may link to anything.
pub fn verify_chain(records: &[AuditRecord]) -> bool {
    records.iter().all(AuditRecord::is_intact)
        && records
            .windows(2)
            .all(|w| w[1].prev_digest == w[0].digest && w[1].sequence == w[0].sequence + 1)
}

fn reason_text(reason: ReasonCode, detail: &str) -> String {
    if detail.is_empty() {
        reason.to_string()
    } else {
        format!("{reason}: {detail}")
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    use core::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn decode_hex(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(s.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }
    Some(out)
}
