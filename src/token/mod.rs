//! Resume token data model, wire codec, and ordering.
//!
//! A resume token pins a position in the global event order. Event tokens are
//! anchored to a real mutation; high-water-mark tokens are anchored to a log
//! position that produced nothing for the subscriber. Tokens are plain values:
//! any cursor with compatible capabilities can resume from them.

pub mod codec;
pub mod ordering;

use crate::oplog::LogicalTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use codec::{decode, encode, from_hex, to_hex, DecodeError, EncodedResumeToken};
pub use ordering::{compare, ComparisonKey, TieBreakerKey, TokenOrdering};

/// Closed set of token layouts understood by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TokenFormatVersion {
    /// Layout emitted by 4.0-era nodes; cannot carry the originating namespace.
    V0,
    /// Layout emitted once FCV 4.2 is active; carries full tie-breakers.
    V1,
}

impl TokenFormatVersion {
    /// Newest format this build can decode.
    pub const LATEST: TokenFormatVersion = TokenFormatVersion::V1;

    /// Wire byte placed at the front of every encoded token.
    pub fn as_byte(self) -> u8 {
        match self {
            TokenFormatVersion::V0 => 0,
            TokenFormatVersion::V1 => 1,
        }
    }

    /// Maps a wire byte back to a known format.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(TokenFormatVersion::V0),
            1 => Some(TokenFormatVersion::V1),
            _ => None,
        }
    }

    /// Whether tokens in this layout can record the originating namespace.
    pub fn carries_origin(self) -> bool {
        matches!(self, TokenFormatVersion::V1)
    }
}

impl fmt::Display for TokenFormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_byte())
    }
}

/// Distinguishes tokens anchored to a mutation from synthesized positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    Event,
    HighWaterMark,
}

impl TokenKind {
    /// Rank used when tokens share a timestamp: events sort before the HWM.
    pub fn rank(self) -> u8 {
        match self {
            TokenKind::Event => 0,
            TokenKind::HighWaterMark => 1,
        }
    }

    pub(crate) fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            0 => Some(TokenKind::Event),
            1 => Some(TokenKind::HighWaterMark),
            _ => None,
        }
    }
}

/// Identity of the affected document, compared bytewise.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey(Vec<u8>);

impl DocumentKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for DocumentKey {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Fields that disambiguate events committed at the same position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TieBreakers {
    /// Originating namespace; only representable from `V1` onwards.
    pub origin: Option<String>,
    pub document_key: DocumentKey,
}

impl TieBreakers {
    pub fn new(origin: Option<String>, document_key: DocumentKey) -> Self {
        Self {
            origin,
            document_key,
        }
    }
}

/// Errors raised when a token is assembled from inconsistent parts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenBuildError {
    #[error("format {0} cannot carry an origin tie-breaker")]
    OriginUnsupported(TokenFormatVersion),
}

/// Immutable position in the change stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResumeToken {
    timestamp: LogicalTime,
    version: TokenFormatVersion,
    txn_op_index: u32,
    tie_breakers: Option<TieBreakers>,
    kind: TokenKind,
}

impl ResumeToken {
    /// Builds a token anchored to a real mutation.
    pub fn event(
        version: TokenFormatVersion,
        timestamp: LogicalTime,
        txn_op_index: u32,
        tie_breakers: TieBreakers,
    ) -> Result<Self, TokenBuildError> {
        if tie_breakers.origin.is_some() && !version.carries_origin() {
            return Err(TokenBuildError::OriginUnsupported(version));
        }
        Ok(Self {
            timestamp,
            version,
            txn_op_index,
            tie_breakers: Some(tie_breakers),
            kind: TokenKind::Event,
        })
    }

    /// Builds a high-water-mark token; never mid-transaction, never tie-broken.
    pub fn high_water_mark(version: TokenFormatVersion, timestamp: LogicalTime) -> Self {
        Self {
            timestamp,
            version,
            txn_op_index: 0,
            tie_breakers: None,
            kind: TokenKind::HighWaterMark,
        }
    }

    pub fn timestamp(&self) -> LogicalTime {
        self.timestamp
    }

    pub fn version(&self) -> TokenFormatVersion {
        self.version
    }

    pub fn txn_op_index(&self) -> u32 {
        self.txn_op_index
    }

    pub fn tie_breakers(&self) -> Option<&TieBreakers> {
        self.tie_breakers.as_ref()
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn is_high_water_mark(&self) -> bool {
        self.kind == TokenKind::HighWaterMark
    }

    /// Serializes the token into its versioned byte form.
    pub fn encode(&self) -> Vec<u8> {
        codec::encode(self)
    }

    /// Serializes the token into the `{ "_data": <hex> }` wire wrapper.
    pub fn to_encoded(&self) -> EncodedResumeToken {
        EncodedResumeToken::from_token(self)
    }

    /// Normalized key used by [`ordering::compare`].
    pub fn comparison_key(&self) -> ComparisonKey {
        ComparisonKey::from_token(self)
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.tie_breakers) {
            (TokenKind::HighWaterMark, _) | (_, None) => {
                write!(f, "hwm[{} {}]", self.version, self.timestamp)
            }
            (TokenKind::Event, Some(tb)) => write!(
                f,
                "event[{} {} op={} key={}]",
                self.version, self.timestamp, self.txn_op_index, tb.document_key
            ),
        }
    }
}
