use super::{LogEntry, LogicalTime};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Result of reading a slice of the log.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRead {
    /// Entries at or after the requested position, possibly empty.
    Entries(Vec<LogEntry>),
    /// Entries needed to continue from the requested position were discarded.
    HistoryLost { truncated_through: LogicalTime },
}

/// Outcome of waiting for the log to grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitOutcome {
    Ready,
    TimedOut,
    Cancelled,
    Closed,
}

/// Read-only view of the shared ordered log.
///
/// Implementations must yield entries in strictly increasing timestamp order
/// and report truncation instead of silently skipping discarded entries.
pub trait EventSource: Send + Sync {
    /// Returns up to `limit` entries whose timestamp is `>= from`.
    fn read_from(&self, from: LogicalTime, limit: usize) -> SourceRead;

    /// Timestamp of the newest entry ever written, if any.
    fn last_written(&self) -> Option<LogicalTime>;

    /// Newest timestamp removed by retention, if anything was removed.
    fn truncated_through(&self) -> Option<LogicalTime>;

    /// Whether an entry with exactly this timestamp is still retained.
    fn contains(&self, timestamp: LogicalTime) -> bool;

    /// Blocks until an entry `>= from` exists, the timeout elapses, the wait
    /// is cancelled, or the source shuts down.
    fn await_from(
        &self,
        from: LogicalTime,
        timeout: Duration,
        cancel: &CancellationSignal,
    ) -> AwaitOutcome;

    /// True once the source will never produce new entries.
    fn is_closed(&self) -> bool;
}

type Waker = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    wakers: Mutex<Vec<(u64, Waker)>>,
}

/// Cloneable cancellation flag for blocking waits (connection close, session
/// timeout, shutdown).
#[derive(Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<CancelInner>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the signal cancelled and wakes every registered waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let wakers: Vec<Waker> = self
            .inner
            .wakers
            .lock()
            .unwrap()
            .drain(..)
            .map(|(_, waker)| waker)
            .collect();
        for waker in wakers {
            waker();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Registers a wake-up callback for the lifetime of the returned guard.
    /// Runs the callback immediately when already cancelled.
    pub fn register(&self, waker: impl Fn() + Send + Sync + 'static) -> WakerRegistration {
        let waker: Waker = Arc::new(waker);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if self.is_cancelled() {
            waker();
        } else {
            self.inner.wakers.lock().unwrap().push((id, waker));
        }
        WakerRegistration {
            inner: self.inner.clone(),
            id,
        }
    }
}

impl std::fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Removes its waker from the signal when dropped.
pub struct WakerRegistration {
    inner: Arc<CancelInner>,
    id: u64,
}

impl Drop for WakerRegistration {
    fn drop(&mut self) {
        if let Ok(mut wakers) = self.inner.wakers.lock() {
            wakers.retain(|(id, _)| *id != self.id);
        }
    }
}
