//! Change stream cursor: batching, post-batch resume tokens, and lifecycle.

use crate::compat::CapabilitySet;
use crate::error::ChangeStreamError;
use crate::event::{derive_events, ChangeEvent, NamespaceFilter};
use crate::high_water_mark::{HighWaterMarkGenerator, HighWaterMarkTelemetry};
use crate::logging::{LogContext, LogHandle};
use crate::oplog::{AwaitOutcome, CancellationSignal, EventSource, LogicalTime, SourceRead};
use crate::resume::{place_candidate, ResumeDecision, SeekResult};
use crate::test_hooks::TestHookRegistry;
use crate::token::{compare, ResumeToken, TokenOrdering};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

const COMPONENT: &str = "cursor";
const READ_CHUNK: usize = 64;

pub const DEFAULT_BATCH_SIZE: usize = 101;
pub const DEFAULT_MAX_AWAIT: Duration = Duration::from_millis(1_000);

/// Lifecycle phase of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorPhase {
    Opening,
    Active,
    Exhausted,
    Invalidated,
}

impl CursorPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, CursorPhase::Exhausted | CursorPhase::Invalidated)
    }
}

/// Per-cursor knobs fixed at subscription time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorOptions {
    /// Upper bound on events per batch; clamped to at least one.
    pub batch_size: usize,
    /// Longest a batch waits for new entries before returning empty.
    pub max_await: Duration,
    /// Whether the client asked for post-batch resume tokens.
    pub post_batch_resume_token: bool,
    pub filter: NamespaceFilter,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_await: DEFAULT_MAX_AWAIT,
            post_batch_resume_token: true,
            filter: NamespaceFilter::All,
        }
    }
}

/// Position and capabilities carried across batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    /// Newest token this cursor produced; never moves backwards.
    pub last_returned_token: Option<ResumeToken>,
    pub capabilities: CapabilitySet,
    pub exhausted: bool,
}

/// Events returned by one `next_batch` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub cursor_id: u64,
    pub events: Vec<ChangeEvent>,
    /// Present only when the session supports it and the client requested it.
    pub post_batch_resume_token: Option<ResumeToken>,
    pub exhausted: bool,
}

/// Counters surfaced for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CursorTelemetry {
    pub batches_total: u64,
    pub events_total: u64,
    pub empty_batches_total: u64,
    pub high_water_marks_total: u64,
    /// Events delivered because the resume point could not be ordered against them.
    pub incomparable_resolutions_total: u64,
}

#[derive(Debug, Clone)]
struct ScanState {
    scan_from: LogicalTime,
    pending: VecDeque<ChangeEvent>,
    skip_through: Option<ResumeToken>,
    inspected: Option<LogicalTime>,
    incomparable_resolutions: u64,
}

impl ScanState {
    fn at(scan_from: LogicalTime) -> Self {
        Self {
            scan_from,
            pending: VecDeque::new(),
            skip_through: None,
            inspected: None,
            incomparable_resolutions: 0,
        }
    }
}

/// Iterates change events for one subscriber.
pub struct ChangeStreamCursor {
    id: u64,
    phase: CursorPhase,
    source: Arc<dyn EventSource>,
    options: CursorOptions,
    state: CursorState,
    scan: ScanState,
    post_batch_token: Option<ResumeToken>,
    high_water_marks: HighWaterMarkGenerator,
    telemetry: CursorTelemetry,
    logger: LogHandle,
    hooks: TestHookRegistry,
}

impl ChangeStreamCursor {
    /// Creates a cursor in the `Opening` phase.
    pub fn new(
        id: u64,
        source: Arc<dyn EventSource>,
        capabilities: CapabilitySet,
        options: CursorOptions,
        logger: LogHandle,
    ) -> Self {
        Self {
            id,
            phase: CursorPhase::Opening,
            source,
            options,
            state: CursorState {
                last_returned_token: None,
                capabilities,
                exhausted: false,
            },
            scan: ScanState::at(LogicalTime::MIN),
            post_batch_token: None,
            high_water_marks: HighWaterMarkGenerator::new(),
            telemetry: CursorTelemetry::default(),
            logger,
            hooks: TestHookRegistry::new(),
        }
    }

    pub fn with_test_hooks(mut self, hooks: TestHookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// Positions the cursor and makes it `Active`.
    ///
    /// Without a seek the stream starts after the newest log entry, which
    /// counts as already inspected.
    pub fn open(&mut self, seek: Option<SeekResult>) -> Result<(), ChangeStreamError> {
        if self.phase != CursorPhase::Opening {
            return Err(ChangeStreamError::CursorNotActive { phase: self.phase });
        }
        match seek {
            None => {
                let last_written = self.source.last_written();
                let scan_from = last_written.map_or(LogicalTime::MIN, LogicalTime::next);
                self.scan = ScanState::at(scan_from);
                if let Some(ts) = last_written {
                    self.high_water_marks.observe_inspected(ts);
                }
            }
            Some(seek) => {
                if let SourceRead::HistoryLost { truncated_through } =
                    self.source.read_from(seek.scan_from, 1)
                {
                    let err = ChangeStreamError::HistoryLost {
                        requested: seek.scan_from,
                        truncated_through,
                    };
                    self.invalidate(&err);
                    return Err(err);
                }
                self.scan = ScanState::at(seek.scan_from);
                self.scan.skip_through = seek.skip_through;
                if seek.resume_token.is_high_water_mark() {
                    self.high_water_marks
                        .observe_inspected(seek.resume_token.timestamp());
                }
                self.post_batch_token = Some(seek.resume_token);
            }
        }
        self.phase = CursorPhase::Active;
        self.logger.info(
            self.context().at(self.scan.scan_from),
            &format!(
                "cursor opened emitting {} tokens",
                self.state.capabilities.token_format_version
            ),
        );
        Ok(())
    }

    /// Returns the next batch, waiting up to `max_await` when nothing is new.
    ///
    /// A cancelled wait returns `Cancelled` and leaves the cursor exactly as
    /// it was before the call.
    pub fn next_batch(
        &mut self,
        cancel: &CancellationSignal,
    ) -> Result<ChangeBatch, ChangeStreamError> {
        if self.phase != CursorPhase::Active {
            return Err(ChangeStreamError::CursorNotActive { phase: self.phase });
        }
        let mut scan = self.scan.clone();
        let mut events = Vec::new();
        self.scan_or_invalidate(&mut scan, &mut events)?;

        if events.is_empty() && !self.source.is_closed() {
            if let Some(delay) = self.hooks.await_delay() {
                std::thread::sleep(delay);
            }
            let outcome = self
                .source
                .await_from(scan.scan_from, self.options.max_await, cancel);
            match outcome {
                AwaitOutcome::Ready | AwaitOutcome::Closed => {
                    self.scan_or_invalidate(&mut scan, &mut events)?
                }
                AwaitOutcome::TimedOut => {}
                AwaitOutcome::Cancelled => {
                    self.logger
                        .debug(self.context(), "wait for new entries cancelled");
                    return Err(ChangeStreamError::Cancelled);
                }
            }
        }
        let mut exhausted = false;
        if events.is_empty() && self.source.is_closed() {
            self.scan_or_invalidate(&mut scan, &mut events)?;
            exhausted = events.is_empty();
        }

        if let Some(ts) = scan.inspected {
            self.high_water_marks.observe_inspected(ts);
        }
        let (post_batch_token, fresh_mark) = match events.last() {
            Some(last) => (Some(last.id.clone()), None),
            None => self.empty_batch_token(),
        };

        let mut last = self.state.last_returned_token.clone();
        for token in events.iter().map(|event| &event.id).chain(fresh_mark.as_ref()) {
            self.check_order(last.as_ref(), token)?;
            last = Some(token.clone());
        }

        self.telemetry.batches_total += 1;
        self.telemetry.events_total += events.len() as u64;
        self.telemetry.incomparable_resolutions_total += scan.incomparable_resolutions;
        scan.incomparable_resolutions = 0;
        if events.is_empty() {
            self.telemetry.empty_batches_total += 1;
        }
        if fresh_mark.is_some() {
            self.telemetry.high_water_marks_total += 1;
        }
        self.scan = scan;
        self.state.last_returned_token = last;
        self.post_batch_token = post_batch_token;
        if exhausted {
            self.phase = CursorPhase::Exhausted;
            self.state.exhausted = true;
            self.logger
                .info(self.context(), "event source closed; cursor exhausted");
        }

        let emitted = match (
            self.state.capabilities.supports_pbrt,
            self.options.post_batch_resume_token,
        ) {
            (true, true) => self.post_batch_token.clone(),
            _ => None,
        };
        let mut context = self.context();
        if let Some(token) = &emitted {
            context = context.at(token.timestamp());
        }
        self.logger.debug(
            context,
            &format!(
                "batch of {} events, {} pending",
                events.len(),
                self.scan.pending.len()
            ),
        );
        Ok(ChangeBatch {
            cursor_id: self.id,
            events,
            post_batch_resume_token: emitted,
            exhausted,
        })
    }

    /// Client-initiated close.
    pub fn close(&mut self) {
        if self.phase.is_terminal() {
            return;
        }
        self.phase = CursorPhase::Exhausted;
        self.state.exhausted = true;
        self.scan.pending.clear();
        self.logger.info(self.context(), "cursor closed by client");
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> CursorPhase {
        self.phase
    }

    pub fn state(&self) -> &CursorState {
        &self.state
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.state.capabilities
    }

    pub fn options(&self) -> &CursorOptions {
        &self.options
    }

    /// Most recent post-batch resume token, whether or not it was sent.
    pub fn post_batch_resume_token(&self) -> Option<&ResumeToken> {
        self.post_batch_token.as_ref()
    }

    /// Events derived but not yet returned.
    pub fn pending_events(&self) -> usize {
        self.scan.pending.len()
    }

    pub fn telemetry(&self) -> CursorTelemetry {
        self.telemetry
    }

    pub fn high_water_mark_telemetry(&self) -> HighWaterMarkTelemetry {
        self.high_water_marks.telemetry()
    }

    /// Seconds between the newest log write and this cursor's latest mark.
    pub fn high_water_mark_lag_secs(&self) -> u32 {
        self.high_water_marks.lag_secs(self.source.last_written())
    }

    fn context(&self) -> LogContext<'static> {
        LogContext::new(COMPONENT).cursor(self.id)
    }

    fn scan_or_invalidate(
        &mut self,
        scan: &mut ScanState,
        events: &mut Vec<ChangeEvent>,
    ) -> Result<(), ChangeStreamError> {
        let result = self.scan_batch(scan, events);
        if let Err(err) = &result {
            self.invalidate(err);
        }
        result
    }

    /// Moves pending events into `events` and reads the log until the batch
    /// is full, events are left over, or the log has nothing newer.
    fn scan_batch(
        &self,
        scan: &mut ScanState,
        events: &mut Vec<ChangeEvent>,
    ) -> Result<(), ChangeStreamError> {
        let batch_size = self.options.batch_size.max(1);
        loop {
            while events.len() < batch_size {
                match scan.pending.pop_front() {
                    Some(event) => events.push(event),
                    None => break,
                }
            }
            if events.len() >= batch_size {
                return Ok(());
            }
            let entries = match self.source.read_from(scan.scan_from, READ_CHUNK) {
                SourceRead::Entries(entries) => entries,
                SourceRead::HistoryLost { truncated_through } => {
                    let err = ChangeStreamError::HistoryLost {
                        requested: scan.scan_from,
                        truncated_through,
                    };
                    return Err(err);
                }
            };
            if entries.is_empty() {
                return Ok(());
            }
            for entry in &entries {
                let derived = derive_events(
                    entry,
                    &self.options.filter,
                    self.state.capabilities.token_format_version,
                )?;
                for event in derived {
                    if let Some(resume_point) = scan
                        .skip_through
                        .as_ref()
                        .filter(|token| token.timestamp() == entry.timestamp)
                    {
                        match place_candidate(&event.id, resume_point) {
                            ResumeDecision::Skip => continue,
                            ResumeDecision::Deliver => {}
                            ResumeDecision::DeliverIncomparable => {
                                scan.incomparable_resolutions += 1;
                                self.logger.info(
                                    self.context().at(entry.timestamp),
                                    &format!(
                                        "delivering {} unordered against resume point {}",
                                        event.id, resume_point
                                    ),
                                );
                            }
                        }
                    }
                    scan.pending.push_back(event);
                }
                scan.scan_from = entry.timestamp.next();
                scan.inspected = Some(entry.timestamp);
            }
            if scan
                .skip_through
                .as_ref()
                .map_or(false, |token| token.timestamp() < scan.scan_from)
            {
                scan.skip_through = None;
            }
        }
    }

    /// Token for a batch without events, plus the mark when one was minted.
    fn empty_batch_token(&mut self) -> (Option<ResumeToken>, Option<ResumeToken>) {
        let previous = self.post_batch_token.clone();
        let capabilities = self.state.capabilities;
        if !capabilities.supports_pbrt
            || !capabilities.supports_hwm
            || self.hooks.high_water_marks_suppressed()
        {
            return (previous, None);
        }
        let advanced = match (self.high_water_marks.inspected(), &previous) {
            (Some(inspected), Some(previous)) => inspected > previous.timestamp(),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !advanced {
            return (previous, None);
        }
        match self
            .high_water_marks
            .generate(&capabilities, previous.as_ref())
        {
            Some(mark) => (Some(mark.clone()), Some(mark)),
            None => (previous, None),
        }
    }

    fn check_order(
        &mut self,
        previous: Option<&ResumeToken>,
        next: &ResumeToken,
    ) -> Result<(), ChangeStreamError> {
        let Some(previous) = previous else {
            return Ok(());
        };
        match compare(next, previous) {
            TokenOrdering::Greater | TokenOrdering::Equal => Ok(()),
            TokenOrdering::Less | TokenOrdering::Incomparable => {
                let err = ChangeStreamError::InternalOrderingViolation {
                    previous: previous.clone(),
                    next: next.clone(),
                };
                self.invalidate(&err);
                Err(err)
            }
        }
    }

    fn invalidate(&mut self, err: &ChangeStreamError) {
        self.phase = CursorPhase::Invalidated;
        self.scan.pending.clear();
        let context = self.context();
        if err.is_internal() {
            self.logger.error(context, &err.to_string());
        } else {
            self.logger
                .warn(context, &format!("cursor invalidated: {}", err));
        }
    }
}
