use crate::oplog::LogicalTime;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Severity levels, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the canonical uppercase representation.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rotation policy (default 64 MiB × 4 segments).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    pub max_bytes: usize,
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 64 << 20,
            max_files: 4,
        }
    }
}

/// Accumulated log lines for a rotated segment.
#[derive(Debug, Default, Clone)]
pub struct LogFile {
    lines: Vec<String>,
    bytes_written: usize,
}

impl LogFile {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }
}

/// Structured fields attached to every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogContext<'a> {
    pub component: &'a str,
    /// Cursor the record concerns; `0` for session- or process-level records.
    pub cursor_id: u64,
    pub cluster_time: Option<LogicalTime>,
}

impl<'a> LogContext<'a> {
    pub fn new(component: &'a str) -> Self {
        Self {
            component,
            cursor_id: 0,
            cluster_time: None,
        }
    }

    pub fn cursor(mut self, cursor_id: u64) -> Self {
        self.cursor_id = cursor_id;
        self
    }

    pub fn at(mut self, cluster_time: LogicalTime) -> Self {
        self.cluster_time = Some(cluster_time);
        self
    }
}

/// JSON-line logger with deterministic rotation semantics.
#[derive(Debug, Clone)]
pub struct JsonLineLogger {
    policy: LogRotationPolicy,
    current_level: LogLevel,
    files: VecDeque<LogFile>,
    active: LogFile,
}

impl JsonLineLogger {
    pub fn new(policy: LogRotationPolicy) -> Self {
        Self {
            policy,
            current_level: LogLevel::Info,
            files: VecDeque::new(),
            active: LogFile::default(),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.current_level
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.current_level = level;
    }

    /// Emits a JSON-line log entry.
    pub fn log(
        &mut self,
        ts_ms: u64,
        level: LogLevel,
        context: LogContext<'_>,
        message: &str,
    ) -> Result<(), LoggingError> {
        if level < self.current_level {
            return Ok(());
        }
        let cluster_time = context
            .cluster_time
            .map(|time| [time.secs, time.inc]);
        let record = LogRecord {
            ts: ts_ms,
            level: level.as_str(),
            component: context.component,
            cursor_id: context.cursor_id,
            cluster_time,
            message,
        };
        let line = serde_json::to_string(&record)?;
        self.rotate_if_needed(line.len());
        self.active.bytes_written = self.active.bytes_written.saturating_add(line.len());
        self.active.lines.push(line);
        Ok(())
    }

    /// Returns rotated history followed by the active segment.
    pub fn files(&self) -> impl Iterator<Item = &LogFile> {
        self.files.iter().chain(std::iter::once(&self.active))
    }

    /// All retained lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.files()
            .flat_map(|file| file.lines().iter().cloned())
            .collect()
    }

    fn rotate_if_needed(&mut self, next_line_len: usize) {
        if self.active.bytes_written + next_line_len <= self.policy.max_bytes {
            return;
        }
        if !self.active.lines.is_empty() {
            self.files.push_back(std::mem::take(&mut self.active));
            while self.files.len() > self.policy.max_files {
                self.files.pop_front();
            }
        }
        self.active = LogFile::default();
    }
}

/// Errors surfaced while serializing JSON-line logs.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to serialize log record: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct LogRecord<'a> {
    ts: u64,
    level: &'a str,
    component: &'a str,
    cursor_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    cluster_time: Option<[u32; 2]>,
    message: &'a str,
}

/// Shared handle so sessions, cursors, and the harness append to one logger.
#[derive(Debug, Clone)]
pub struct LogHandle {
    inner: Arc<Mutex<JsonLineLogger>>,
}

impl Default for LogHandle {
    fn default() -> Self {
        Self::new(JsonLineLogger::new(LogRotationPolicy::default()))
    }
}

impl LogHandle {
    pub fn new(logger: JsonLineLogger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(logger)),
        }
    }

    pub fn set_level(&self, level: LogLevel) {
        self.inner.lock().unwrap().set_level(level);
    }

    /// Records a line stamped with the current wall-clock time. Serialization
    /// failures are dropped; logging never fails the caller's operation.
    pub fn log(&self, level: LogLevel, context: LogContext<'_>, message: &str) {
        let _ = self
            .inner
            .lock()
            .unwrap()
            .log(now_ms(), level, context, message);
    }

    pub fn debug(&self, context: LogContext<'_>, message: &str) {
        self.log(LogLevel::Debug, context, message);
    }

    pub fn info(&self, context: LogContext<'_>, message: &str) {
        self.log(LogLevel::Info, context, message);
    }

    pub fn warn(&self, context: LogContext<'_>, message: &str) {
        self.log(LogLevel::Warn, context, message);
    }

    pub fn error(&self, context: LogContext<'_>, message: &str) {
        self.log(LogLevel::Error, context, message);
    }

    /// Copy of every retained line, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.inner.lock().unwrap().lines()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
