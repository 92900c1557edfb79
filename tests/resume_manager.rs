use std::sync::Arc;
use std::time::Duration;
use tidemark::{
    capabilities_for, event_token, BinaryVersion, CancellationSignal, CapabilitySet,
    ChangeStreamCursor, ChangeStreamError, CursorOptions, DecodeError, EncodedResumeToken, EventSource,
    FeatureCompatibilityVersion, LogHandle, LogOperation, LogicalTime, NamespaceFilter,
    OplogBuffer, ResumeManager, ResumeMode, ResumeToken, RetentionPolicy, TestHook,
    TestHookRegistry, TokenFormatVersion, WallClock, WriteOp,
};

const WATCHED: &str = "db.watched";

struct MockClock;

impl WallClock for MockClock {
    fn now_secs(&mut self) -> u32 {
        200
    }
}

fn log_with(retention: RetentionPolicy) -> OplogBuffer {
    OplogBuffer::with_clock(retention, MockClock)
}

fn caps(binary: BinaryVersion, fcv: FeatureCompatibilityVersion) -> CapabilitySet {
    capabilities_for(binary, fcv)
}

fn full() -> CapabilitySet {
    caps(BinaryVersion::Release42, FeatureCompatibilityVersion::V42)
}

fn manager(log: &OplogBuffer) -> ResumeManager {
    ResumeManager::new(Arc::new(log.clone()), LogHandle::default())
}

fn append(log: &OplogBuffer, op: WriteOp) -> (LogicalTime, WriteOp) {
    let ts = log.append(LogOperation::Write(op.clone())).unwrap();
    (ts, op)
}

fn resumed_cursor(
    log: &OplogBuffer,
    caps: CapabilitySet,
    token: &ResumeToken,
) -> ChangeStreamCursor {
    let seek = manager(log)
        .resume(token, &caps, ResumeMode::ResumeAfter)
        .unwrap();
    let options = CursorOptions {
        max_await: Duration::from_millis(10),
        filter: NamespaceFilter::parse(WATCHED),
        ..CursorOptions::default()
    };
    let mut cursor =
        ChangeStreamCursor::new(1, Arc::new(log.clone()), caps, options, LogHandle::default());
    cursor.open(Some(seek)).unwrap();
    cursor
}

#[test]
fn event_tokens_seek_to_their_entry_and_skip_through_it() {
    let log = log_with(RetentionPolicy::unbounded());
    let (ts, op) = append(&log, WriteOp::delete(WATCHED, "a"));
    let token = event_token(TokenFormatVersion::V1, ts, 0, &op).unwrap();
    let seek = manager(&log)
        .resume(&token, &full(), ResumeMode::StartAfter)
        .unwrap();
    assert_eq!(seek.scan_from, ts);
    assert_eq!(seek.skip_through, Some(token.clone()));
    assert_eq!(seek.resume_token, token);
    assert_eq!(seek.mode, ResumeMode::StartAfter);
}

#[test]
fn high_water_marks_seek_strictly_past_their_position() {
    let log = log_with(RetentionPolicy::unbounded());
    let (ts, _) = append(&log, WriteOp::delete("db.other", "a"));
    let mark = ResumeToken::high_water_mark(TokenFormatVersion::V0, ts);
    let seek = manager(&log)
        .resume(&mark, &full(), ResumeMode::ResumeAfter)
        .unwrap();
    assert_eq!(seek.scan_from, ts.next());
    assert_eq!(seek.skip_through, None);
}

#[test]
fn high_water_mark_rejected_without_support() {
    let log = log_with(RetentionPolicy::unbounded());
    let (ts, _) = append(&log, WriteOp::delete(WATCHED, "a"));
    let mark = ResumeToken::high_water_mark(TokenFormatVersion::V0, ts);
    let legacy = caps(BinaryVersion::Release40, FeatureCompatibilityVersion::V40);
    let err = manager(&log)
        .resume(&mark, &legacy, ResumeMode::ResumeAfter)
        .unwrap_err();
    assert!(matches!(err, ChangeStreamError::InvalidResumeToken { .. }));
    assert_eq!(err.code(), 260);
}

#[test]
fn newer_format_than_binary_understands_is_invalid() {
    let log = log_with(RetentionPolicy::unbounded());
    let (ts, op) = append(&log, WriteOp::delete(WATCHED, "a"));
    let token = event_token(TokenFormatVersion::V1, ts, 0, &op).unwrap();
    let old = caps(
        BinaryVersion::Release40Backport,
        FeatureCompatibilityVersion::V40,
    );
    assert!(matches!(
        manager(&log).resume(&token, &old, ResumeMode::ResumeAfter),
        Err(ChangeStreamError::InvalidResumeToken { .. })
    ));
    assert!(matches!(
        manager(&log).resume_encoded(&token.to_encoded(), &old, ResumeMode::ResumeAfter),
        Err(ChangeStreamError::InvalidResumeToken { .. })
    ));
}

#[test]
fn garbage_tokens_fail_to_parse() {
    let log = log_with(RetentionPolicy::unbounded());
    let err = manager(&log)
        .resume_encoded(
            &EncodedResumeToken::new("00ff"),
            &full(),
            ResumeMode::ResumeAfter,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        ChangeStreamError::Decode(DecodeError::Malformed { .. })
    ));
    assert_eq!(err.code_name(), "FailedToParse");
}

#[test]
fn truncated_history_is_reported() {
    let log = log_with(RetentionPolicy::max_entries(1));
    let (first, op) = append(&log, WriteOp::delete(WATCHED, "a"));
    let (second, _) = append(&log, WriteOp::delete(WATCHED, "b"));
    assert_eq!(log.truncated_through(), Some(first));

    let token = event_token(TokenFormatVersion::V1, first, 0, &op).unwrap();
    let err = manager(&log)
        .resume(&token, &full(), ResumeMode::ResumeAfter)
        .unwrap_err();
    assert_eq!(
        err,
        ChangeStreamError::HistoryLost {
            requested: first,
            truncated_through: first
        }
    );
    assert_eq!(err.code(), 286);

    // A mark at the truncation point only needs what follows it.
    let mark = ResumeToken::high_water_mark(TokenFormatVersion::V1, first);
    let seek = manager(&log)
        .resume(&mark, &full(), ResumeMode::ResumeAfter)
        .unwrap();
    assert_eq!(seek.scan_from, first.next());
    assert!(second >= seek.scan_from);
}

#[test]
fn missing_event_inside_horizon_is_invalid() {
    let log = log_with(RetentionPolicy::unbounded());
    let (ts, op) = append(&log, WriteOp::delete(WATCHED, "a"));
    let ghost = event_token(TokenFormatVersion::V1, ts.next(), 0, &op).unwrap();
    let err = manager(&log)
        .resume(&ghost, &full(), ResumeMode::ResumeAfter)
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn both_resume_options_conflict() {
    let token = EncodedResumeToken::new("00");
    assert_eq!(
        ResumeMode::select(Some(&token), Some(&token)),
        Err(ChangeStreamError::ConflictingResumeOptions)
    );
    assert_eq!(ResumeMode::select(None, None), Ok(None));
    assert_eq!(
        ResumeMode::select(None, Some(&token)),
        Ok(Some((ResumeMode::StartAfter, &token)))
    );
}

#[test]
fn resumed_stream_starts_strictly_after_event_token() {
    let log = log_with(RetentionPolicy::unbounded());
    let ops = vec![
        WriteOp::delete(WATCHED, "a"),
        WriteOp::delete(WATCHED, "b"),
        WriteOp::delete(WATCHED, "c"),
    ];
    let ts = log
        .append(LogOperation::Transaction { ops: ops.clone() })
        .unwrap();
    let (after, _) = append(&log, WriteOp::delete(WATCHED, "d"));
    let token = event_token(TokenFormatVersion::V1, ts, 1, &ops[1]).unwrap();

    let mut cursor = resumed_cursor(&log, full(), &token);
    let batch = cursor.next_batch(&CancellationSignal::new()).unwrap();
    let keys: Vec<_> = batch
        .events
        .iter()
        .map(|event| event.document_key.to_string())
        .collect();
    assert_eq!(keys, vec!["c", "d"]);
    assert_eq!(batch.events[1].cluster_time, after);
}

#[test]
fn resume_from_mark_excludes_its_own_position() {
    let log = log_with(RetentionPolicy::unbounded());
    let (ts, _) = append(&log, WriteOp::delete(WATCHED, "at-mark"));
    let (after, _) = append(&log, WriteOp::delete(WATCHED, "after-mark"));
    let mark = ResumeToken::high_water_mark(TokenFormatVersion::V1, ts);

    let mut cursor = resumed_cursor(&log, full(), &mark);
    let batch = cursor.next_batch(&CancellationSignal::new()).unwrap();
    assert_eq!(batch.events.len(), 1);
    assert_eq!(batch.events[0].cluster_time, after);
}

#[test]
fn idle_resumed_stream_echoes_the_resume_point() {
    let log = log_with(RetentionPolicy::unbounded());
    let (ts, _) = append(&log, WriteOp::delete("db.other", "x"));
    let mark = ResumeToken::high_water_mark(TokenFormatVersion::V0, ts);
    let mut cursor = resumed_cursor(&log, full(), &mark);
    let batch = cursor.next_batch(&CancellationSignal::new()).unwrap();
    assert!(batch.events.is_empty());
    assert_eq!(batch.post_batch_resume_token, Some(mark));
}

#[test]
fn older_format_token_skips_its_own_event() {
    let log = log_with(RetentionPolicy::unbounded());
    let ops = vec![WriteOp::delete(WATCHED, "a"), WriteOp::delete(WATCHED, "b")];
    let ts = log
        .append(LogOperation::Transaction { ops: ops.clone() })
        .unwrap();
    let old_token = event_token(TokenFormatVersion::V0, ts, 0, &ops[0]).unwrap();

    let mut cursor = resumed_cursor(&log, full(), &old_token);
    let batch = cursor.next_batch(&CancellationSignal::new()).unwrap();
    assert_eq!(batch.events.len(), 1);
    assert_eq!(batch.events[0].document_key.to_string(), "b");
    assert_eq!(batch.events[0].id.version(), TokenFormatVersion::V1);
    assert_eq!(cursor.telemetry().incomparable_resolutions_total, 0);
}

#[test]
fn newer_format_token_skips_its_own_event_after_fcv_downgrade() {
    let log = log_with(RetentionPolicy::unbounded());
    let (ts, op) = append(&log, WriteOp::delete(WATCHED, "a"));
    let issued = event_token(TokenFormatVersion::V1, ts, 0, &op).unwrap();
    let lowered = caps(BinaryVersion::Release42, FeatureCompatibilityVersion::V40);
    assert_eq!(lowered.token_format_version, TokenFormatVersion::V0);

    let mut cursor = resumed_cursor(&log, lowered, &issued);
    let batch = cursor.next_batch(&CancellationSignal::new()).unwrap();
    assert!(batch.events.is_empty());

    let (after, _) = append(&log, WriteOp::delete(WATCHED, "b"));
    let batch = cursor.next_batch(&CancellationSignal::new()).unwrap();
    assert_eq!(batch.events.len(), 1);
    assert_eq!(batch.events[0].cluster_time, after);
}

#[test]
fn unresolvable_cross_format_ties_are_delivered_not_dropped() {
    let log = log_with(RetentionPolicy::unbounded());
    let ops = vec![WriteOp::delete(WATCHED, "a"), WriteOp::delete(WATCHED, "b")];
    let ts = log
        .append(LogOperation::Transaction { ops: ops.clone() })
        .unwrap();
    let mismatched = event_token(TokenFormatVersion::V0, ts, 0, &WriteOp::delete(WATCHED, "z"))
        .unwrap();

    let mut cursor = resumed_cursor(&log, full(), &mismatched);
    let batch = cursor.next_batch(&CancellationSignal::new()).unwrap();
    assert_eq!(batch.events.len(), 2);
    assert_eq!(cursor.telemetry().incomparable_resolutions_total, 1);
}

#[test]
fn forced_history_loss_hook() {
    let log = log_with(RetentionPolicy::unbounded());
    let (ts, _) = append(&log, WriteOp::delete(WATCHED, "a"));
    let mut hooks = TestHookRegistry::new();
    hooks.register(TestHook::ForceHistoryLost);
    let err = manager(&log)
        .with_test_hooks(hooks)
        .resume(
            &ResumeToken::high_water_mark(TokenFormatVersion::V1, ts),
            &full(),
            ResumeMode::ResumeAfter,
        )
        .unwrap_err();
    assert!(matches!(err, ChangeStreamError::HistoryLost { .. }));
}
