//! Ordered mutation log consumed by change stream cursors.
//!
//! The write path is out of scope; this module defines the entry shape, the
//! [`EventSource`] seam cursors read through, and an in-memory append log used
//! by the harness and tests.

pub mod buffer;
pub mod clock;
pub mod source;

use crate::token::DocumentKey;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use buffer::{OplogBuffer, OplogError, RetentionPolicy};
pub use clock::{ClusterClock, SystemWallClock, WallClock};
pub use source::{AwaitOutcome, CancellationSignal, EventSource, SourceRead};

/// Compound logical clock: coarse seconds plus a per-second increment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LogicalTime {
    pub secs: u32,
    pub inc: u32,
}

impl LogicalTime {
    pub const MIN: LogicalTime = LogicalTime { secs: 0, inc: 0 };
    pub const MAX: LogicalTime = LogicalTime {
        secs: u32::MAX,
        inc: u32::MAX,
    };

    pub const fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    /// Immediate successor in the total order. Saturates at [`LogicalTime::MAX`].
    pub fn next(self) -> Self {
        if let Some(inc) = self.inc.checked_add(1) {
            Self::new(self.secs, inc)
        } else if let Some(secs) = self.secs.checked_add(1) {
            Self::new(secs, 0)
        } else {
            self
        }
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

/// Kind of document mutation recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteKind {
    Insert,
    Update,
    Replace,
    Delete,
}

/// Single document mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOp {
    pub kind: WriteKind,
    pub namespace: String,
    pub document_key: DocumentKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<serde_json::Value>,
}

impl WriteOp {
    pub fn new(kind: WriteKind, namespace: impl Into<String>, document_key: DocumentKey) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            document_key,
            document: None,
        }
    }

    pub fn insert(
        namespace: impl Into<String>,
        document_key: impl Into<DocumentKey>,
        document: serde_json::Value,
    ) -> Self {
        Self {
            document: Some(document),
            ..Self::new(WriteKind::Insert, namespace, document_key.into())
        }
    }

    pub fn delete(namespace: impl Into<String>, document_key: impl Into<DocumentKey>) -> Self {
        Self::new(WriteKind::Delete, namespace, document_key.into())
    }

    pub fn with_document(mut self, document: serde_json::Value) -> Self {
        self.document = Some(document);
        self
    }
}

/// Payload of one log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum LogOperation {
    Write(WriteOp),
    /// Multi-operation unit committed atomically at one timestamp.
    Transaction { ops: Vec<WriteOp> },
    /// Entry that advances the log without touching any document.
    Noop { message: String },
}

impl LogOperation {
    /// Document writes carried by the entry, in commit order.
    pub fn writes(&self) -> &[WriteOp] {
        match self {
            LogOperation::Write(op) => std::slice::from_ref(op),
            LogOperation::Transaction { ops } => ops,
            LogOperation::Noop { .. } => &[],
        }
    }
}

/// Entry in the ordered log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: LogicalTime,
    pub operation: LogOperation,
}

impl LogEntry {
    pub fn new(timestamp: LogicalTime, operation: LogOperation) -> Self {
        Self {
            timestamp,
            operation,
        }
    }
}
