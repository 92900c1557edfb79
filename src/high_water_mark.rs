//! High-water-mark tokens for batches that return no events.
//!
//! The generator remembers the furthest log position a cursor has inspected
//! and mints a token at that position, never behind one it already emitted.

use crate::compat::CapabilitySet;
use crate::oplog::LogicalTime;
use crate::token::{
    compare, DecodeError, EncodedResumeToken, ResumeToken, TokenFormatVersion, TokenOrdering,
};
use serde::{Deserialize, Serialize};

/// Snapshot-friendly representation of generator progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HighWaterMarkSnapshot {
    pub inspected: Option<LogicalTime>,
    pub last_emitted: Option<EncodedResumeToken>,
}

/// Counters surfaced alongside cursor telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HighWaterMarkTelemetry {
    pub emitted_total: u64,
    /// Candidates withheld because they would have regressed.
    pub suppressed_total: u64,
}

/// Synthesizes high-water-mark tokens for batches that carry no events.
///
/// The mark always points at a log position the cursor has actually examined
/// and never moves backwards across calls.
#[derive(Debug, Clone, Default)]
pub struct HighWaterMarkGenerator {
    inspected: Option<LogicalTime>,
    last_emitted: Option<ResumeToken>,
    telemetry: HighWaterMarkTelemetry,
}

impl HighWaterMarkGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores generator state from a snapshot.
    pub fn from_snapshot(
        snapshot: &HighWaterMarkSnapshot,
        max_version: TokenFormatVersion,
    ) -> Result<Self, DecodeError> {
        let last_emitted = snapshot
            .last_emitted
            .as_ref()
            .map(|encoded| encoded.decode(max_version))
            .transpose()?;
        Ok(Self {
            inspected: snapshot.inspected,
            last_emitted,
            telemetry: HighWaterMarkTelemetry::default(),
        })
    }

    pub fn snapshot(&self) -> HighWaterMarkSnapshot {
        HighWaterMarkSnapshot {
            inspected: self.inspected,
            last_emitted: self.last_emitted.as_ref().map(ResumeToken::to_encoded),
        }
    }

    /// Records that the log has been examined through `timestamp`.
    pub fn observe_inspected(&mut self, timestamp: LogicalTime) {
        self.inspected = Some(self.inspected.map_or(timestamp, |ts| ts.max(timestamp)));
    }

    pub fn inspected(&self) -> Option<LogicalTime> {
        self.inspected
    }

    pub fn last_emitted(&self) -> Option<&ResumeToken> {
        self.last_emitted.as_ref()
    }

    pub fn telemetry(&self) -> HighWaterMarkTelemetry {
        self.telemetry
    }

    /// Distance in seconds between the newest log write and the last mark.
    pub fn lag_secs(&self, last_written: Option<LogicalTime>) -> u32 {
        let emitted = self
            .last_emitted
            .as_ref()
            .map_or(0, |token| token.timestamp().secs);
        last_written.map_or(0, |ts| ts.secs.saturating_sub(emitted))
    }

    /// Produces a mark for the furthest inspected position, in the session's
    /// token format.
    ///
    /// Returns `None` when high-water marks are unsupported, nothing has been
    /// inspected, or the candidate would sort below either the previous mark
    /// or `floor`.
    pub fn generate(
        &mut self,
        capabilities: &CapabilitySet,
        floor: Option<&ResumeToken>,
    ) -> Option<ResumeToken> {
        if !capabilities.supports_hwm {
            return None;
        }
        let inspected = self.inspected?;
        let candidate =
            ResumeToken::high_water_mark(capabilities.token_format_version, inspected);
        let regresses = self
            .last_emitted
            .iter()
            .chain(floor)
            .any(|bound| {
                matches!(
                    compare(&candidate, bound),
                    TokenOrdering::Less | TokenOrdering::Incomparable
                )
            });
        if regresses {
            self.telemetry.suppressed_total = self.telemetry.suppressed_total.saturating_add(1);
            return None;
        }
        self.telemetry.emitted_total = self.telemetry.emitted_total.saturating_add(1);
        self.last_emitted = Some(candidate.clone());
        Some(candidate)
    }
}
