use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tidemark::{
    capabilities_for, AwaitOutcome, BinaryVersion, CancellationSignal, CapabilitySet,
    ChangeStreamCursor, ChangeStreamError, CursorOptions, CursorPhase, EventSource,
    FeatureCompatibilityVersion, LogEntry, LogHandle, LogOperation, LogicalTime, NamespaceFilter,
    OplogBuffer, RetentionPolicy, SourceRead, TestHook, TestHookRegistry, TokenFormatVersion,
    TokenKind, WallClock, WriteOp,
};

const WATCHED: &str = "db.watched";

struct MockClock {
    secs: u32,
}

impl WallClock for MockClock {
    fn now_secs(&mut self) -> u32 {
        self.secs
    }
}

fn log_with(retention: RetentionPolicy) -> OplogBuffer {
    OplogBuffer::with_clock(retention, MockClock { secs: 100 })
}

fn full() -> CapabilitySet {
    capabilities_for(BinaryVersion::Release42, FeatureCompatibilityVersion::V42)
}

fn options(batch_size: usize) -> CursorOptions {
    CursorOptions {
        batch_size,
        max_await: Duration::from_millis(10),
        post_batch_resume_token: true,
        filter: NamespaceFilter::parse(WATCHED),
    }
}

fn open(log: &OplogBuffer, caps: CapabilitySet, opts: CursorOptions) -> ChangeStreamCursor {
    let mut cursor =
        ChangeStreamCursor::new(1, Arc::new(log.clone()), caps, opts, LogHandle::default());
    cursor.open(None).unwrap();
    cursor
}

fn insert(log: &OplogBuffer, namespace: &str, key: &str) -> LogicalTime {
    log.append(LogOperation::Write(WriteOp::insert(
        namespace,
        key,
        serde_json::json!({ "_id": key }),
    )))
    .unwrap()
}

#[test]
fn fresh_stream_first_empty_batch_carries_mark_at_log_end() {
    let log = log_with(RetentionPolicy::unbounded());
    insert(&log, "db.other", "a");
    let latest = log
        .append(LogOperation::Noop {
            message: "idle".into(),
        })
        .unwrap();
    let mut cursor = open(&log, full(), options(10));
    let batch = cursor.next_batch(&CancellationSignal::new()).unwrap();
    assert!(batch.events.is_empty());
    let pbrt = batch.post_batch_resume_token.unwrap();
    assert_eq!(pbrt.kind(), TokenKind::HighWaterMark);
    assert_eq!(pbrt.timestamp(), latest);
}

#[test]
fn empty_log_yields_no_token_until_something_is_inspected() {
    let log = log_with(RetentionPolicy::unbounded());
    let mut cursor = open(&log, full(), options(10));
    let batch = cursor.next_batch(&CancellationSignal::new()).unwrap();
    assert!(batch.events.is_empty());
    assert_eq!(batch.post_batch_resume_token, None);
}

#[test]
fn unwatched_writes_advance_mark_and_idle_batches_repeat_it() {
    let log = log_with(RetentionPolicy::unbounded());
    let mut cursor = open(&log, full(), options(10));
    let cancel = CancellationSignal::new();

    let other = insert(&log, "db.other", "x");
    let first = cursor.next_batch(&cancel).unwrap();
    assert!(first.events.is_empty());
    let mark = first.post_batch_resume_token.clone().unwrap();
    assert!(mark.is_high_water_mark());
    assert_eq!(mark.timestamp(), other);
    assert_eq!(mark.version(), TokenFormatVersion::V1);

    let idle = cursor.next_batch(&cancel).unwrap();
    assert_eq!(idle.post_batch_resume_token, Some(mark.clone()));

    let watched = insert(&log, WATCHED, "y");
    let third = cursor.next_batch(&cancel).unwrap();
    assert_eq!(third.events.len(), 1);
    assert_eq!(third.events[0].cluster_time, watched);
    assert_eq!(third.post_batch_resume_token, Some(third.events[0].id.clone()));

    let telemetry = cursor.telemetry();
    assert_eq!(telemetry.batches_total, 3);
    assert_eq!(telemetry.empty_batches_total, 2);
    assert_eq!(telemetry.high_water_marks_total, 1);
    assert_eq!(telemetry.events_total, 1);
}

#[test]
fn large_transactions_span_batches_without_advancing_token() {
    let log = log_with(RetentionPolicy::unbounded());
    let mut cursor = open(&log, full(), options(2));
    let cancel = CancellationSignal::new();
    let committed = log
        .append(LogOperation::Transaction {
            ops: vec![
                WriteOp::delete(WATCHED, "a"),
                WriteOp::delete(WATCHED, "b"),
                WriteOp::delete(WATCHED, "c"),
            ],
        })
        .unwrap();

    let first = cursor.next_batch(&cancel).unwrap();
    assert_eq!(first.events.len(), 2);
    assert_eq!(cursor.pending_events(), 1);
    let pbrt = first.post_batch_resume_token.unwrap();
    assert_eq!(pbrt, first.events[1].id);
    assert_eq!(pbrt.txn_op_index(), 1);
    assert_eq!(pbrt.timestamp(), committed);

    let second = cursor.next_batch(&cancel).unwrap();
    assert_eq!(second.events.len(), 1);
    assert_eq!(second.events[0].txn_op_index, 2);
    assert_eq!(second.post_batch_resume_token, Some(second.events[0].id.clone()));
    assert_eq!(cursor.pending_events(), 0);
}

#[test]
fn token_omitted_when_unsupported_or_not_requested() {
    let log = log_with(RetentionPolicy::unbounded());
    insert(&log, WATCHED, "seed");
    let legacy = capabilities_for(BinaryVersion::Release40, FeatureCompatibilityVersion::V40);
    let mut cursor = open(&log, legacy, options(10));
    insert(&log, WATCHED, "a");
    let batch = cursor.next_batch(&CancellationSignal::new()).unwrap();
    assert_eq!(batch.events.len(), 1);
    assert_eq!(batch.events[0].id.version(), TokenFormatVersion::V0);
    assert_eq!(batch.post_batch_resume_token, None);

    let mut opts = options(10);
    opts.post_batch_resume_token = false;
    let mut cursor = open(&log, full(), opts);
    let batch = cursor.next_batch(&CancellationSignal::new()).unwrap();
    assert_eq!(batch.post_batch_resume_token, None);
    assert!(cursor.post_batch_resume_token().is_some());
}

#[test]
fn cancelled_wait_leaves_cursor_unchanged() {
    let log = log_with(RetentionPolicy::unbounded());
    insert(&log, "db.other", "x");
    let mut cursor = open(&log, full(), options(10));
    let before_state = cursor.state().clone();
    let before_token = cursor.post_batch_resume_token().cloned();
    let before_telemetry = cursor.telemetry();

    let cancel = CancellationSignal::new();
    cancel.cancel();
    let err = cursor.next_batch(&cancel).unwrap_err();
    assert_eq!(err, ChangeStreamError::Cancelled);
    assert_eq!(cursor.phase(), CursorPhase::Active);
    assert_eq!(cursor.state(), &before_state);
    assert_eq!(cursor.post_batch_resume_token().cloned(), before_token);
    assert_eq!(cursor.telemetry(), before_telemetry);

    let key = insert(&log, WATCHED, "y");
    let batch = cursor.next_batch(&CancellationSignal::new()).unwrap();
    assert_eq!(batch.events[0].cluster_time, key);
}

#[test]
fn truncation_invalidates_cursor() {
    let log = log_with(RetentionPolicy::max_entries(1));
    let mut cursor = open(&log, full(), options(10));
    insert(&log, WATCHED, "a");
    insert(&log, WATCHED, "b");
    let last = insert(&log, WATCHED, "c");
    let err = cursor.next_batch(&CancellationSignal::new()).unwrap_err();
    match err {
        ChangeStreamError::HistoryLost {
            truncated_through, ..
        } => assert!(truncated_through < last),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(cursor.phase(), CursorPhase::Invalidated);
    assert!(matches!(
        cursor.next_batch(&CancellationSignal::new()),
        Err(ChangeStreamError::CursorNotActive {
            phase: CursorPhase::Invalidated
        })
    ));
}

#[test]
fn closed_source_drains_then_exhausts() {
    let log = log_with(RetentionPolicy::unbounded());
    let mut cursor = open(&log, full(), options(10));
    insert(&log, WATCHED, "a");
    log.close();

    let first = cursor.next_batch(&CancellationSignal::new()).unwrap();
    assert_eq!(first.events.len(), 1);
    assert!(!first.exhausted);

    let second = cursor.next_batch(&CancellationSignal::new()).unwrap();
    assert!(second.exhausted);
    assert_eq!(second.post_batch_resume_token, first.post_batch_resume_token);
    assert_eq!(cursor.phase(), CursorPhase::Exhausted);
    assert!(cursor.state().exhausted);
}

#[test]
fn client_close_is_terminal() {
    let log = log_with(RetentionPolicy::unbounded());
    let mut cursor = open(&log, full(), options(10));
    cursor.close();
    assert_eq!(cursor.phase(), CursorPhase::Exhausted);
    assert!(matches!(
        cursor.next_batch(&CancellationSignal::new()),
        Err(ChangeStreamError::CursorNotActive {
            phase: CursorPhase::Exhausted
        })
    ));
    assert!(matches!(
        cursor.open(None),
        Err(ChangeStreamError::CursorNotActive { .. })
    ));
}

#[test]
fn returned_tokens_never_decrease() {
    let log = log_with(RetentionPolicy::unbounded());
    let mut cursor = open(&log, full(), options(3));
    let cancel = CancellationSignal::new();
    let mut previous = None;
    for round in 0..6 {
        for key in 0..round {
            let namespace = if key % 2 == 0 { WATCHED } else { "db.other" };
            insert(&log, namespace, &format!("{round}-{key}"));
        }
        let batch = cursor.next_batch(&cancel).unwrap();
        let tokens = batch
            .events
            .iter()
            .map(|event| event.id.clone())
            .chain(batch.post_batch_resume_token.clone());
        for token in tokens {
            if let Some(previous) = &previous {
                assert_ne!(
                    tidemark::compare(&token, previous),
                    tidemark::TokenOrdering::Less
                );
            }
            previous = Some(token);
        }
    }
}

struct RegressingSource {
    reads: Mutex<VecDeque<Vec<LogEntry>>>,
}

impl EventSource for RegressingSource {
    fn read_from(&self, _from: LogicalTime, _limit: usize) -> SourceRead {
        SourceRead::Entries(self.reads.lock().unwrap().pop_front().unwrap_or_default())
    }

    fn last_written(&self) -> Option<LogicalTime> {
        None
    }

    fn truncated_through(&self) -> Option<LogicalTime> {
        None
    }

    fn contains(&self, _timestamp: LogicalTime) -> bool {
        false
    }

    fn await_from(
        &self,
        _from: LogicalTime,
        _timeout: Duration,
        _cancel: &CancellationSignal,
    ) -> AwaitOutcome {
        AwaitOutcome::TimedOut
    }

    fn is_closed(&self) -> bool {
        false
    }
}

#[test]
fn regressing_source_is_reported_as_internal_fault() {
    let entry = |secs, key: &str| {
        LogEntry::new(
            LogicalTime::new(secs, 1),
            LogOperation::Write(WriteOp::delete(WATCHED, key)),
        )
    };
    let source = RegressingSource {
        reads: Mutex::new(VecDeque::from(vec![
            vec![entry(10, "a")],
            Vec::new(),
            vec![entry(5, "b")],
        ])),
    };
    let logger = LogHandle::default();
    let mut cursor =
        ChangeStreamCursor::new(7, Arc::new(source), full(), options(10), logger.clone());
    cursor.open(None).unwrap();
    let cancel = CancellationSignal::new();
    assert_eq!(cursor.next_batch(&cancel).unwrap().events.len(), 1);

    let err = cursor.next_batch(&cancel).unwrap_err();
    assert!(matches!(
        err,
        ChangeStreamError::InternalOrderingViolation { .. }
    ));
    assert!(err.is_internal());
    assert_eq!(err.code_name(), "ChangeStreamFatalError");
    assert_eq!(cursor.phase(), CursorPhase::Invalidated);
    assert!(logger
        .lines()
        .iter()
        .any(|line| line.contains("\"level\":\"ERROR\"") && line.contains("\"cursor_id\":7")));
}

#[test]
fn hooks_suppress_marks_and_delay_waits() {
    let log = log_with(RetentionPolicy::unbounded());
    let mut hooks = TestHookRegistry::new();
    hooks.register(TestHook::SuppressHighWaterMarks);
    hooks.register(TestHook::InjectAwaitDelay { delay_ms: 30 });
    let mut cursor = ChangeStreamCursor::new(
        1,
        Arc::new(log.clone()),
        full(),
        options(10),
        LogHandle::default(),
    )
    .with_test_hooks(hooks);
    cursor.open(None).unwrap();
    insert(&log, "db.other", "x");

    let start = Instant::now();
    let batch = cursor.next_batch(&CancellationSignal::new()).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert!(batch.events.is_empty());
    assert_eq!(batch.post_batch_resume_token, None);
    assert_eq!(cursor.telemetry().high_water_marks_total, 0);
}
