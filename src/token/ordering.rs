//! Total order over resume tokens, across token formats where possible.

use super::{DocumentKey, ResumeToken, TokenFormatVersion};
use crate::oplog::LogicalTime;
use std::cmp::Ordering;

/// Result of comparing two tokens.
///
/// `Incomparable` is only produced across formats, when the older format lacks
/// a field needed to place two same-position events with different document
/// keys relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenOrdering {
    Less,
    Equal,
    Greater,
    Incomparable,
}

impl TokenOrdering {
    /// Flips the direction of the comparison.
    pub fn reverse(self) -> Self {
        match self {
            TokenOrdering::Less => TokenOrdering::Greater,
            TokenOrdering::Greater => TokenOrdering::Less,
            other => other,
        }
    }
}

impl From<Ordering> for TokenOrdering {
    fn from(value: Ordering) -> Self {
        match value {
            Ordering::Less => TokenOrdering::Less,
            Ordering::Equal => TokenOrdering::Equal,
            Ordering::Greater => TokenOrdering::Greater,
        }
    }
}

/// Tie-breakers normalized to what the token's format could express.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TieBreakerKey {
    /// High-water marks carry nothing beyond their position.
    Absent,
    /// `V0` event tokens: the origin was never recorded.
    OriginUnknown(DocumentKey),
    /// `V1` event tokens: full disambiguation is available.
    Known {
        origin: Option<String>,
        document_key: DocumentKey,
    },
}

/// Format-independent comparison key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonKey {
    pub timestamp: LogicalTime,
    pub kind_rank: u8,
    pub txn_op_index: u32,
    pub tie_breakers: TieBreakerKey,
}

impl ComparisonKey {
    /// Normalizes a token of any supported format.
    pub fn from_token(token: &ResumeToken) -> Self {
        let tie_breakers = match (token.version(), token.tie_breakers()) {
            (_, None) => TieBreakerKey::Absent,
            (TokenFormatVersion::V0, Some(tb)) => {
                TieBreakerKey::OriginUnknown(tb.document_key.clone())
            }
            (TokenFormatVersion::V1, Some(tb)) => TieBreakerKey::Known {
                origin: tb.origin.clone(),
                document_key: tb.document_key.clone(),
            },
        };
        Self {
            timestamp: token.timestamp(),
            kind_rank: token.kind().rank(),
            txn_op_index: token.txn_op_index(),
            tie_breakers,
        }
    }

    fn position(&self) -> (LogicalTime, u8, u32) {
        (self.timestamp, self.kind_rank, self.txn_op_index)
    }

    /// Compares two normalized keys.
    pub fn compare(&self, other: &ComparisonKey) -> TokenOrdering {
        match self.position().cmp(&other.position()) {
            Ordering::Equal => {}
            unequal => return unequal.into(),
        }
        match (&self.tie_breakers, &other.tie_breakers) {
            (TieBreakerKey::Absent, TieBreakerKey::Absent) => TokenOrdering::Equal,
            (TieBreakerKey::Absent, _) => TokenOrdering::Less,
            (_, TieBreakerKey::Absent) => TokenOrdering::Greater,
            (TieBreakerKey::OriginUnknown(left), TieBreakerKey::OriginUnknown(right)) => {
                left.cmp(right).into()
            }
            (
                TieBreakerKey::Known {
                    origin: left_origin,
                    document_key: left_key,
                },
                TieBreakerKey::Known {
                    origin: right_origin,
                    document_key: right_key,
                },
            ) => (left_origin, left_key).cmp(&(right_origin, right_key)).into(),
            // A position names one write, so a matching key is the same event.
            (TieBreakerKey::OriginUnknown(left), TieBreakerKey::Known { document_key, .. })
            | (TieBreakerKey::Known { document_key, .. }, TieBreakerKey::OriginUnknown(left)) => {
                if left == document_key {
                    TokenOrdering::Equal
                } else {
                    TokenOrdering::Incomparable
                }
            }
        }
    }
}

/// Compares two tokens after normalizing them to a common key.
pub fn compare(a: &ResumeToken, b: &ResumeToken) -> TokenOrdering {
    a.comparison_key().compare(&b.comparison_key())
}

