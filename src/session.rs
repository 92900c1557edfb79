//! Subscription entrypoint and the JSON request/response surface.

use crate::compat::{capabilities_for, BinaryVersion, CapabilitySet, FeatureCompatibilityVersion};
use crate::config::ServerParameters;
use crate::cursor::{
    ChangeBatch, ChangeStreamCursor, CursorOptions, DEFAULT_BATCH_SIZE, DEFAULT_MAX_AWAIT,
};
use crate::error::ChangeStreamError;
use crate::event::{ChangeEvent, NamespaceFilter, OperationType};
use crate::logging::{LogContext, LogHandle};
use crate::oplog::{EventSource, LogicalTime};
use crate::resume::{ResumeManager, ResumeMode};
use crate::test_hooks::TestHookRegistry;
use crate::token::EncodedResumeToken;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const COMPONENT: &str = "session";

/// Batch defaults applied when a request leaves them unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDefaults {
    pub batch_size: usize,
    pub max_await: Duration,
}

impl Default for StreamDefaults {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_await: DEFAULT_MAX_AWAIT,
        }
    }
}

/// Client connection to one node. Capabilities are computed once, here.
pub struct Session {
    binary: BinaryVersion,
    fcv: FeatureCompatibilityVersion,
    capabilities: CapabilitySet,
    source: Arc<dyn EventSource>,
    defaults: StreamDefaults,
    logger: LogHandle,
    hooks: TestHookRegistry,
    next_cursor_id: AtomicU64,
}

impl Session {
    /// Establishes a session against `binary` under the current `fcv`.
    pub fn establish(
        binary: BinaryVersion,
        fcv: FeatureCompatibilityVersion,
        source: Arc<dyn EventSource>,
        logger: LogHandle,
    ) -> Self {
        let capabilities = capabilities_for(binary, fcv);
        logger.info(
            LogContext::new(COMPONENT),
            &format!(
                "session on binary {} with fcv {} (pbrt={}, hwm={}, emit={}, decode<={})",
                binary,
                fcv,
                capabilities.supports_pbrt,
                capabilities.supports_hwm,
                capabilities.token_format_version,
                capabilities.max_decodable_version
            ),
        );
        Self {
            binary,
            fcv,
            capabilities,
            source,
            defaults: StreamDefaults::default(),
            logger,
            hooks: TestHookRegistry::new(),
            next_cursor_id: AtomicU64::new(1),
        }
    }

    /// Establishes a session reading FCV and batch defaults from parameters.
    pub fn from_parameters(
        binary: BinaryVersion,
        parameters: &ServerParameters,
        source: Arc<dyn EventSource>,
        logger: LogHandle,
    ) -> Self {
        Self::establish(binary, parameters.feature_compatibility_version, source, logger)
            .with_defaults(StreamDefaults {
                batch_size: parameters.change_stream_batch_size,
                max_await: parameters.max_await(),
            })
    }

    pub fn with_defaults(mut self, defaults: StreamDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_test_hooks(mut self, hooks: TestHookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn binary(&self) -> BinaryVersion {
        self.binary
    }

    pub fn feature_compatibility_version(&self) -> FeatureCompatibilityVersion {
        self.fcv
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Opens a change stream cursor for `request`.
    pub fn subscribe(
        &self,
        request: &SubscribeRequest,
    ) -> Result<ChangeStreamCursor, ChangeStreamError> {
        let resume =
            ResumeMode::select(request.resume_after.as_ref(), request.start_after.as_ref())?;
        let options = CursorOptions {
            batch_size: request.batch_size.unwrap_or(self.defaults.batch_size),
            max_await: request
                .max_await_time_ms
                .map_or(self.defaults.max_await, Duration::from_millis),
            post_batch_resume_token: request.post_batch_resume_token,
            filter: NamespaceFilter::parse(&request.namespace),
        };
        let cursor_id = self.next_cursor_id.fetch_add(1, Ordering::Relaxed);
        let mut cursor = ChangeStreamCursor::new(
            cursor_id,
            self.source.clone(),
            self.capabilities,
            options,
            self.logger.clone(),
        )
        .with_test_hooks(self.hooks.clone());
        let seek = match resume {
            Some((mode, token)) => Some(
                ResumeManager::new(self.source.clone(), self.logger.clone())
                    .with_test_hooks(self.hooks.clone())
                    .resume_encoded(token, &self.capabilities, mode)?,
            ),
            None => None,
        };
        cursor.open(seek)?;
        Ok(cursor)
    }
}

/// Change stream subscription request as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    /// `"*"`, `"db.*"`, or `"db.collection"`.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_after: Option<EncodedResumeToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_after: Option<EncodedResumeToken>,
    #[serde(default = "default_true")]
    pub post_batch_resume_token: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_await_time_ms: Option<u64>,
}

fn default_namespace() -> String {
    "*".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for SubscribeRequest {
    fn default() -> Self {
        Self::new(default_namespace())
    }
}

impl SubscribeRequest {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resume_after: None,
            start_after: None,
            post_batch_resume_token: true,
            batch_size: None,
            max_await_time_ms: None,
        }
    }

    pub fn resume_after(mut self, token: EncodedResumeToken) -> Self {
        self.resume_after = Some(token);
        self
    }

    pub fn start_after(mut self, token: EncodedResumeToken) -> Self {
        self.start_after = Some(token);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn max_await_time_ms(mut self, max_await_time_ms: u64) -> Self {
        self.max_await_time_ms = Some(max_await_time_ms);
        self
    }

    pub fn without_post_batch_resume_token(mut self) -> Self {
        self.post_batch_resume_token = false;
        self
    }
}

/// Response to a subscribe or get-more request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBatch {
    pub cursor: CursorResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorResponse {
    /// `0` once the cursor is exhausted.
    pub id: u64,
    pub next_batch: Vec<ChangeEventDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_batch_resume_token: Option<EncodedResumeToken>,
}

/// Change event as rendered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEventDocument {
    #[serde(rename = "_id")]
    pub id: EncodedResumeToken,
    pub operation_type: OperationType,
    pub ns: String,
    pub document_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<serde_json::Value>,
    pub cluster_time: LogicalTime,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub txn_op_index: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

impl From<&ChangeEvent> for ChangeEventDocument {
    fn from(event: &ChangeEvent) -> Self {
        Self {
            id: event.id.to_encoded(),
            operation_type: event.operation_type,
            ns: event.namespace.clone(),
            document_key: event.document_key.to_string(),
            full_document: event.full_document.clone(),
            cluster_time: event.cluster_time,
            txn_op_index: event.txn_op_index,
        }
    }
}

impl From<&ChangeBatch> for ResponseBatch {
    fn from(batch: &ChangeBatch) -> Self {
        Self {
            cursor: CursorResponse {
                id: if batch.exhausted { 0 } else { batch.cursor_id },
                next_batch: batch.events.iter().map(ChangeEventDocument::from).collect(),
                post_batch_resume_token: batch
                    .post_batch_resume_token
                    .as_ref()
                    .map(|token| token.to_encoded()),
            },
        }
    }
}

/// Error document returned instead of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub ok: u8,
    pub code: u32,
    pub code_name: String,
    pub errmsg: String,
}

impl From<&ChangeStreamError> for ErrorResponse {
    fn from(err: &ChangeStreamError) -> Self {
        Self {
            ok: 0,
            code: err.code(),
            code_name: err.code_name().to_string(),
            errmsg: err.to_string(),
        }
    }
}
