use crate::cursor::CursorPhase;
use crate::oplog::LogicalTime;
use crate::token::{DecodeError, ResumeToken, TokenBuildError};
use thiserror::Error;

/// Broad class of a change stream failure, used to keep defects apart from
/// client mistakes when reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The caller supplied a token or request that can never succeed as-is.
    ClientInput,
    /// The log no longer holds the history the request needs.
    HistoryLost,
    /// An internal invariant broke; indicates a defect.
    Internal,
    /// The operation was interrupted before completing.
    Interrupted,
    /// The cursor is not in a phase that allows the operation.
    State,
}

/// Errors surfaced while opening, resuming, or iterating a change stream.
///
/// None of these are retried automatically: presenting the same token again
/// cannot succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChangeStreamError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("invalid resume token: {reason}")]
    InvalidResumeToken { reason: String },
    #[error(
        "change stream history lost: resume point {requested} precedes retained history \
         (truncated through {truncated_through})"
    )]
    HistoryLost {
        requested: LogicalTime,
        truncated_through: LogicalTime,
    },
    #[error("failed to build event token: {0}")]
    TokenBuild(#[from] TokenBuildError),
    #[error("internal ordering violation: {next} returned after {previous}")]
    InternalOrderingViolation {
        previous: ResumeToken,
        next: ResumeToken,
    },
    #[error("only one of resumeAfter and startAfter may be supplied")]
    ConflictingResumeOptions,
    #[error("cursor is {phase:?}")]
    CursorNotActive { phase: CursorPhase },
    #[error("operation cancelled while awaiting new log entries")]
    Cancelled,
}

impl ChangeStreamError {
    pub(crate) fn invalid_token(reason: impl Into<String>) -> Self {
        ChangeStreamError::InvalidResumeToken {
            reason: reason.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ChangeStreamError::Decode(_)
            | ChangeStreamError::InvalidResumeToken { .. }
            | ChangeStreamError::ConflictingResumeOptions => ErrorCategory::ClientInput,
            ChangeStreamError::HistoryLost { .. } => ErrorCategory::HistoryLost,
            ChangeStreamError::TokenBuild(_)
            | ChangeStreamError::InternalOrderingViolation { .. } => ErrorCategory::Internal,
            ChangeStreamError::Cancelled => ErrorCategory::Interrupted,
            ChangeStreamError::CursorNotActive { .. } => ErrorCategory::State,
        }
    }

    /// Stable numeric code reported on the wire.
    pub fn code(&self) -> u32 {
        match self {
            ChangeStreamError::Decode(DecodeError::Malformed { .. }) => 9,
            ChangeStreamError::Decode(DecodeError::UnsupportedVersion { .. }) => 260,
            ChangeStreamError::InvalidResumeToken { .. } => 260,
            ChangeStreamError::HistoryLost { .. } => 286,
            ChangeStreamError::TokenBuild(_)
            | ChangeStreamError::InternalOrderingViolation { .. } => 280,
            ChangeStreamError::ConflictingResumeOptions => 2,
            ChangeStreamError::CursorNotActive { .. } => 43,
            ChangeStreamError::Cancelled => 11601,
        }
    }

    pub fn code_name(&self) -> &'static str {
        match self {
            ChangeStreamError::Decode(DecodeError::Malformed { .. }) => "FailedToParse",
            ChangeStreamError::Decode(DecodeError::UnsupportedVersion { .. })
            | ChangeStreamError::InvalidResumeToken { .. } => "InvalidResumeToken",
            ChangeStreamError::HistoryLost { .. } => "ChangeStreamHistoryLost",
            ChangeStreamError::TokenBuild(_)
            | ChangeStreamError::InternalOrderingViolation { .. } => "ChangeStreamFatalError",
            ChangeStreamError::ConflictingResumeOptions => "BadValue",
            ChangeStreamError::CursorNotActive { .. } => "CursorNotFound",
            ChangeStreamError::Cancelled => "Interrupted",
        }
    }

    /// True when the error points at a defect rather than caller input.
    pub fn is_internal(&self) -> bool {
        self.category() == ErrorCategory::Internal
    }
}
