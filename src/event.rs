//! Change events derived from log entries.

use crate::oplog::{LogEntry, LogicalTime, WriteKind, WriteOp};
use crate::token::{DocumentKey, ResumeToken, TieBreakers, TokenBuildError, TokenFormatVersion};
use serde::{Deserialize, Serialize};

/// Operation type reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
}

impl From<WriteKind> for OperationType {
    fn from(kind: WriteKind) -> Self {
        match kind {
            WriteKind::Insert => OperationType::Insert,
            WriteKind::Update => OperationType::Update,
            WriteKind::Replace => OperationType::Replace,
            WriteKind::Delete => OperationType::Delete,
        }
    }
}

/// Single mutation notification delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Token that resumes immediately after this event.
    pub id: ResumeToken,
    pub operation_type: OperationType,
    pub namespace: String,
    pub document_key: DocumentKey,
    pub full_document: Option<serde_json::Value>,
    pub cluster_time: LogicalTime,
    pub txn_op_index: u32,
}

/// Which namespaces a subscription observes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NamespaceFilter {
    #[default]
    All,
    /// Every collection of one database (`db.*`).
    Database(String),
    /// Exactly one `db.collection` namespace.
    Collection(String),
}

impl NamespaceFilter {
    /// Parses `"*"`, `"db.*"`, or `"db.coll"`.
    pub fn parse(spec: &str) -> Self {
        if spec.is_empty() || spec == "*" {
            NamespaceFilter::All
        } else if let Some(db) = spec.strip_suffix(".*") {
            NamespaceFilter::Database(db.to_string())
        } else {
            NamespaceFilter::Collection(spec.to_string())
        }
    }

    pub fn matches(&self, namespace: &str) -> bool {
        match self {
            NamespaceFilter::All => true,
            NamespaceFilter::Database(db) => namespace
                .split_once('.')
                .map_or(false, |(entry_db, _)| entry_db == db),
            NamespaceFilter::Collection(collection) => namespace == collection,
        }
    }
}

/// Builds the event token for one write inside an entry.
pub fn event_token(
    version: TokenFormatVersion,
    timestamp: LogicalTime,
    txn_op_index: u32,
    op: &WriteOp,
) -> Result<ResumeToken, TokenBuildError> {
    let origin = version.carries_origin().then(|| op.namespace.clone());
    ResumeToken::event(
        version,
        timestamp,
        txn_op_index,
        TieBreakers::new(origin, op.document_key.clone()),
    )
}

/// Derives the events an entry produces for `filter`, with tokens in `version`.
///
/// Noop entries and writes to unobserved namespaces produce nothing; the
/// entry still counts as inspected for high-water-mark purposes.
pub fn derive_events(
    entry: &LogEntry,
    filter: &NamespaceFilter,
    version: TokenFormatVersion,
) -> Result<Vec<ChangeEvent>, TokenBuildError> {
    let mut events = Vec::new();
    for (index, op) in entry.operation.writes().iter().enumerate() {
        if !filter.matches(&op.namespace) {
            continue;
        }
        let txn_op_index = index as u32;
        events.push(ChangeEvent {
            id: event_token(version, entry.timestamp, txn_op_index, op)?,
            operation_type: op.kind.into(),
            namespace: op.namespace.clone(),
            document_key: op.document_key.clone(),
            full_document: op.document.clone(),
            cluster_time: entry.timestamp,
            txn_op_index,
        });
    }
    Ok(events)
}
