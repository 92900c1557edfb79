//! Validation and positioning of resume requests.

use crate::compat::CapabilitySet;
use crate::error::ChangeStreamError;
use crate::logging::{LogContext, LogHandle};
use crate::oplog::{EventSource, LogicalTime};
use crate::test_hooks::TestHookRegistry;
use crate::token::{compare, DecodeError, EncodedResumeToken, ResumeToken, TokenOrdering};
use std::sync::Arc;

const COMPONENT: &str = "resume";

/// Which request option supplied the token. Both share seek semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    ResumeAfter,
    StartAfter,
}

impl ResumeMode {
    /// Picks the single supplied option; supplying both is a client error.
    pub fn select<'a>(
        resume_after: Option<&'a EncodedResumeToken>,
        start_after: Option<&'a EncodedResumeToken>,
    ) -> Result<Option<(ResumeMode, &'a EncodedResumeToken)>, ChangeStreamError> {
        match (resume_after, start_after) {
            (Some(_), Some(_)) => Err(ChangeStreamError::ConflictingResumeOptions),
            (Some(token), None) => Ok(Some((ResumeMode::ResumeAfter, token))),
            (None, Some(token)) => Ok(Some((ResumeMode::StartAfter, token))),
            (None, None) => Ok(None),
        }
    }
}

/// Where a resumed cursor starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekResult {
    /// First log position to read.
    pub scan_from: LogicalTime,
    /// Events at `scan_from` that do not sort after this token are skipped.
    pub skip_through: Option<ResumeToken>,
    /// Token the client resumed from.
    pub resume_token: ResumeToken,
    pub mode: ResumeMode,
}

/// Outcome of placing a candidate event relative to the resume point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    Skip,
    Deliver,
    /// Formats could not be ordered; the event is delivered rather than lost.
    DeliverIncomparable,
}

/// Decides whether `candidate` lies strictly after `resume_point`.
pub fn place_candidate(candidate: &ResumeToken, resume_point: &ResumeToken) -> ResumeDecision {
    match compare(candidate, resume_point) {
        TokenOrdering::Less | TokenOrdering::Equal => ResumeDecision::Skip,
        TokenOrdering::Greater => ResumeDecision::Deliver,
        TokenOrdering::Incomparable => ResumeDecision::DeliverIncomparable,
    }
}

/// Turns client-supplied tokens into cursor seek positions.
pub struct ResumeManager {
    source: Arc<dyn EventSource>,
    logger: LogHandle,
    hooks: TestHookRegistry,
}

impl ResumeManager {
    pub fn new(source: Arc<dyn EventSource>, logger: LogHandle) -> Self {
        Self {
            source,
            logger,
            hooks: TestHookRegistry::new(),
        }
    }

    pub fn with_test_hooks(mut self, hooks: TestHookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// Decodes a wire token with the binary's decoder, then validates it.
    pub fn resume_encoded(
        &self,
        encoded: &EncodedResumeToken,
        capabilities: &CapabilitySet,
        mode: ResumeMode,
    ) -> Result<SeekResult, ChangeStreamError> {
        let token = encoded
            .decode(capabilities.max_decodable_version)
            .map_err(|err| match err {
                DecodeError::UnsupportedVersion { .. } => {
                    ChangeStreamError::invalid_token(err.to_string())
                }
                malformed => ChangeStreamError::Decode(malformed),
            })?;
        self.resume(&token, capabilities, mode)
    }

    /// Validates a decoded token against the session and the retained log.
    pub fn resume(
        &self,
        token: &ResumeToken,
        capabilities: &CapabilitySet,
        mode: ResumeMode,
    ) -> Result<SeekResult, ChangeStreamError> {
        let context = LogContext::new(COMPONENT).at(token.timestamp());
        match self.validate(token, capabilities) {
            Ok(seek) => {
                self.logger.info(
                    context,
                    &format!("resuming {:?} from {} scanning at {}", mode, token, seek.0),
                );
                Ok(SeekResult {
                    scan_from: seek.0,
                    skip_through: seek.1,
                    resume_token: token.clone(),
                    mode,
                })
            }
            Err(err) => {
                self.logger
                    .warn(context, &format!("rejected resume from {}: {}", token, err));
                Err(err)
            }
        }
    }

    fn validate(
        &self,
        token: &ResumeToken,
        capabilities: &CapabilitySet,
    ) -> Result<(LogicalTime, Option<ResumeToken>), ChangeStreamError> {
        if token.version() > capabilities.max_decodable_version {
            return Err(ChangeStreamError::invalid_token(format!(
                "token format {} is newer than {} understood by this binary",
                token.version(),
                capabilities.max_decodable_version
            )));
        }
        if token.is_high_water_mark() && !capabilities.supports_hwm {
            return Err(ChangeStreamError::invalid_token(
                "high-water-mark tokens are not supported at the current feature level",
            ));
        }
        let requested = token.timestamp();
        if self.hooks.force_history_lost() {
            return Err(ChangeStreamError::HistoryLost {
                requested,
                truncated_through: requested,
            });
        }
        if let Some(truncated_through) = self.source.truncated_through() {
            // An HWM needs only what follows it; an event needs its own entry.
            let lost = if token.is_high_water_mark() {
                truncated_through > requested
            } else {
                truncated_through >= requested
            };
            if lost {
                return Err(ChangeStreamError::HistoryLost {
                    requested,
                    truncated_through,
                });
            }
        }
        if token.is_high_water_mark() {
            return Ok((requested.next(), None));
        }
        if !self.source.contains(requested) {
            return Err(ChangeStreamError::invalid_token(format!(
                "resume point {} not found in the log",
                requested
            )));
        }
        Ok((requested, Some(token.clone())))
    }
}
