use super::clock::{ClusterClock, SystemWallClock, WallClock};
use super::source::{AwaitOutcome, CancellationSignal, EventSource, SourceRead};
use super::{LogEntry, LogOperation, LogicalTime};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Bounds how much history the log keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetentionPolicy {
    /// Oldest entries are discarded once the log holds more than this many.
    pub max_entries: Option<usize>,
}

impl RetentionPolicy {
    pub fn unbounded() -> Self {
        Self { max_entries: None }
    }

    pub fn max_entries(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries.max(1)),
        }
    }
}

/// Errors surfaced by the write side of the in-memory log.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OplogError {
    #[error("log is closed")]
    Closed,
    #[error("timestamp {attempted} does not advance past {last}")]
    OutOfOrder {
        attempted: LogicalTime,
        last: LogicalTime,
    },
}

struct OplogState {
    entries: VecDeque<LogEntry>,
    truncated_through: Option<LogicalTime>,
    retention: RetentionPolicy,
    clock: ClusterClock<Box<dyn WallClock + Send>>,
    closed: bool,
}

impl OplogState {
    fn has_news(&self, from: LogicalTime) -> bool {
        let appended = self
            .entries
            .back()
            .map_or(false, |entry| entry.timestamp >= from);
        let truncated = self.truncated_through.map_or(false, |ts| ts >= from);
        appended || truncated
    }

    fn push(&mut self, entry: LogEntry) {
        self.clock.observe(entry.timestamp);
        self.entries.push_back(entry);
        if let Some(max_entries) = self.retention.max_entries {
            while self.entries.len() > max_entries {
                self.discard_front();
            }
        }
    }

    fn discard_front(&mut self) {
        if let Some(entry) = self.entries.pop_front() {
            self.truncated_through = Some(entry.timestamp);
        }
    }
}

struct Shared {
    state: Mutex<OplogState>,
    cv: Condvar,
}

/// In-memory append log with retention, blocking waits, and shutdown.
///
/// Cheap to clone; clones share the same log.
#[derive(Clone)]
pub struct OplogBuffer {
    shared: Arc<Shared>,
}

impl Default for OplogBuffer {
    fn default() -> Self {
        Self::new(RetentionPolicy::unbounded())
    }
}

impl OplogBuffer {
    /// Creates a log stamped from the system wall clock.
    pub fn new(retention: RetentionPolicy) -> Self {
        Self::with_clock(retention, SystemWallClock)
    }

    /// Creates a log with a custom wall clock (used in tests).
    pub fn with_clock(retention: RetentionPolicy, clock: impl WallClock + Send + 'static) -> Self {
        let clock: Box<dyn WallClock + Send> = Box::new(clock);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(OplogState {
                    entries: VecDeque::new(),
                    truncated_through: None,
                    retention,
                    clock: ClusterClock::new(clock),
                    closed: false,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Appends an entry at the next cluster time and wakes waiting cursors.
    pub fn append(&self, operation: LogOperation) -> Result<LogicalTime, OplogError> {
        let mut guard = self.shared.state.lock().unwrap();
        if guard.closed {
            return Err(OplogError::Closed);
        }
        let timestamp = guard.clock.tick();
        guard.push(LogEntry::new(timestamp, operation));
        self.shared.cv.notify_all();
        Ok(timestamp)
    }

    /// Appends an entry at an explicit time, which must advance the log.
    pub fn append_at(
        &self,
        timestamp: LogicalTime,
        operation: LogOperation,
    ) -> Result<(), OplogError> {
        let mut guard = self.shared.state.lock().unwrap();
        if guard.closed {
            return Err(OplogError::Closed);
        }
        if let Some(last) = guard.clock.last() {
            if timestamp <= last {
                return Err(OplogError::OutOfOrder {
                    attempted: timestamp,
                    last,
                });
            }
        }
        guard.push(LogEntry::new(timestamp, operation));
        self.shared.cv.notify_all();
        Ok(())
    }

    /// Discards every retained entry with a timestamp `<= through`.
    pub fn truncate_through(&self, through: LogicalTime) -> usize {
        let mut guard = self.shared.state.lock().unwrap();
        let mut removed = 0;
        while guard
            .entries
            .front()
            .map_or(false, |entry| entry.timestamp <= through)
        {
            guard.discard_front();
            removed += 1;
        }
        if removed > 0 {
            self.shared.cv.notify_all();
        }
        removed
    }

    /// Replaces the retention policy, applying it immediately.
    pub fn set_retention(&self, retention: RetentionPolicy) {
        let mut guard = self.shared.state.lock().unwrap();
        guard.retention = retention;
        if let Some(max_entries) = retention.max_entries {
            while guard.entries.len() > max_entries {
                guard.discard_front();
            }
        }
        self.shared.cv.notify_all();
    }

    /// Stops accepting writes and releases every waiter.
    pub fn close(&self) {
        let mut guard = self.shared.state.lock().unwrap();
        guard.closed = true;
        self.shared.cv.notify_all();
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timestamp of the oldest retained entry.
    pub fn earliest_retained(&self) -> Option<LogicalTime> {
        self.shared
            .state
            .lock()
            .unwrap()
            .entries
            .front()
            .map(|entry| entry.timestamp)
    }
}

impl fmt::Debug for OplogBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.shared.state.lock().unwrap();
        f.debug_struct("OplogBuffer")
            .field("entries", &guard.entries.len())
            .field("truncated_through", &guard.truncated_through)
            .field("closed", &guard.closed)
            .finish()
    }
}

impl EventSource for OplogBuffer {
    fn read_from(&self, from: LogicalTime, limit: usize) -> SourceRead {
        let guard = self.shared.state.lock().unwrap();
        if let Some(truncated_through) = guard.truncated_through {
            if truncated_through >= from {
                return SourceRead::HistoryLost { truncated_through };
            }
        }
        let start = guard
            .entries
            .partition_point(|entry| entry.timestamp < from);
        let entries = guard
            .entries
            .iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect();
        SourceRead::Entries(entries)
    }

    fn last_written(&self) -> Option<LogicalTime> {
        self.shared.state.lock().unwrap().clock.last()
    }

    fn truncated_through(&self) -> Option<LogicalTime> {
        self.shared.state.lock().unwrap().truncated_through
    }

    fn contains(&self, timestamp: LogicalTime) -> bool {
        let guard = self.shared.state.lock().unwrap();
        guard
            .entries
            .binary_search_by(|entry| entry.timestamp.cmp(&timestamp))
            .is_ok()
    }

    fn await_from(
        &self,
        from: LogicalTime,
        timeout: Duration,
        cancel: &CancellationSignal,
    ) -> AwaitOutcome {
        let deadline = Instant::now() + timeout;
        let shared = self.shared.clone();
        let _registration = cancel.register(move || {
            let _guard = shared.state.lock().unwrap();
            shared.cv.notify_all();
        });
        let mut guard = self.shared.state.lock().unwrap();
        loop {
            if guard.has_news(from) {
                return AwaitOutcome::Ready;
            }
            if cancel.is_cancelled() {
                return AwaitOutcome::Cancelled;
            }
            if guard.closed {
                return AwaitOutcome::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return AwaitOutcome::TimedOut;
            }
            let (next_guard, _) = self.shared.cv.wait_timeout(guard, deadline - now).unwrap();
            guard = next_guard;
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }
}
