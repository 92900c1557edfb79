//! Resumable change streams: resume tokens, post-batch resume tokens, and
//! high-water marks gated by binary version and feature compatibility version.

pub mod app;
pub mod client;
pub mod compat;
pub mod config;
pub mod cursor;
pub mod error;
pub mod event;
pub mod harness;
pub mod high_water_mark;
pub mod logging;
pub mod oplog;
pub mod resume;
pub mod session;
pub mod test_hooks;
pub mod token;

pub use client::{
    ChangeStreamClient, ClientError, ClientTelemetry, FileTokenStore, MemoryTokenStore,
    ResumeTokenStore, TokenStoreError,
};
pub use compat::{
    capabilities_for, BinaryVersion, CapabilityLevel, CapabilitySet, FeatureCompatibilityVersion,
    UnknownVersion,
};
pub use config::{
    ConfigError, ConfigKnobClass, ConfigPatchResult, ConfigService, ConfigTelemetry,
    ServerParameters, FCV_PARAMETER, RETENTION_PARAMETER,
};
pub use cursor::{
    ChangeBatch, ChangeStreamCursor, CursorOptions, CursorPhase, CursorState, CursorTelemetry,
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_AWAIT,
};
pub use error::{ChangeStreamError, ErrorCategory};
pub use event::{derive_events, event_token, ChangeEvent, NamespaceFilter, OperationType};
pub use harness::{
    run_upgrade_downgrade, upgrade_downgrade_plan, MultiVersionHarness, PhasePlan, PhaseReport,
    ScenarioReport,
};
pub use high_water_mark::{HighWaterMarkGenerator, HighWaterMarkSnapshot, HighWaterMarkTelemetry};
pub use logging::{
    JsonLineLogger, LogContext, LogFile, LogHandle, LogLevel, LogRotationPolicy, LoggingError,
};
pub use oplog::{
    AwaitOutcome, CancellationSignal, ClusterClock, EventSource, LogEntry, LogOperation,
    LogicalTime, OplogBuffer, OplogError, RetentionPolicy, SourceRead, SystemWallClock, WallClock,
    WriteKind, WriteOp,
};
pub use resume::{place_candidate, ResumeDecision, ResumeManager, ResumeMode, SeekResult};
pub use session::{
    ChangeEventDocument, CursorResponse, ErrorResponse, ResponseBatch, Session, StreamDefaults,
    SubscribeRequest,
};
pub use test_hooks::{TestHook, TestHookRegistry};
pub use token::{
    compare, decode, encode, from_hex, to_hex, ComparisonKey, DecodeError, DocumentKey,
    EncodedResumeToken, ResumeToken, TieBreakerKey, TieBreakers, TokenBuildError,
    TokenFormatVersion, TokenKind, TokenOrdering,
};
