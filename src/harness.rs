//! In-process replica-set stand-in that replays the rolling upgrade and
//! downgrade matrix against the change stream core.
//!
//! Only the binary-version and FCV signals change between phases; the log
//! itself survives every "restart", as it would on disk.

use crate::compat::{BinaryVersion, FeatureCompatibilityVersion};
use crate::config::{
    ConfigPatchResult, ConfigService, ServerParameters, FCV_PARAMETER, RETENTION_PARAMETER,
};
use crate::error::ChangeStreamError;
use crate::logging::{LogContext, LogHandle};
use crate::oplog::{CancellationSignal, LogOperation, LogicalTime, OplogBuffer, WriteOp};
use crate::session::{Session, SubscribeRequest};
use crate::token::EncodedResumeToken;
use anyhow::{bail, ensure, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

const COMPONENT: &str = "harness";
const WATCHED_NAMESPACE: &str = "test.watched";
const UNWATCHED_NAMESPACE: &str = "test.unwatched";
const HARNESS_MAX_AWAIT_MS: u64 = 10;

/// Expected behavior for one step of the matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasePlan {
    pub label: String,
    pub binary: BinaryVersion,
    pub fcv: FeatureCompatibilityVersion,
    /// Whether an empty batch must carry a post-batch resume token.
    pub expect_post_batch_token: bool,
    /// Whether resuming from the previous phase's mark must succeed.
    pub expect_resume: bool,
}

/// What one phase observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub label: String,
    pub binary: String,
    pub fcv: String,
    pub post_batch_resume_token: Option<EncodedResumeToken>,
    /// `None` when there was no earlier mark to resume from.
    pub resumed_from_previous: Option<bool>,
}

/// Outcome of one full upgrade/downgrade cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioReport {
    pub old_binary: String,
    pub phases: Vec<PhaseReport>,
}

/// Upgrade to 4.2, raise FCV to 4.2, lower it again, and downgrade back to
/// `old`. Change stream features on the old binary hinge on the backport.
pub fn upgrade_downgrade_plan(old: BinaryVersion) -> Vec<PhasePlan> {
    let backported = old.capability_level().supports_high_water_marks();
    let phase = |label: &str, binary, fcv, expect_post_batch_token, expect_resume| PhasePlan {
        label: label.to_string(),
        binary,
        fcv,
        expect_post_batch_token,
        expect_resume,
    };
    vec![
        phase(
            "old binary",
            old,
            FeatureCompatibilityVersion::V40,
            backported,
            false,
        ),
        phase(
            "4.2 binary, fcv 4.0",
            BinaryVersion::Release42,
            FeatureCompatibilityVersion::V40,
            true,
            true,
        ),
        phase(
            "4.2 binary, fcv 4.2",
            BinaryVersion::Release42,
            FeatureCompatibilityVersion::V42,
            true,
            true,
        ),
        phase(
            "4.2 binary, fcv lowered to 4.0",
            BinaryVersion::Release42,
            FeatureCompatibilityVersion::V40,
            true,
            true,
        ),
        phase(
            "downgraded to old binary",
            old,
            FeatureCompatibilityVersion::V40,
            backported,
            backported,
        ),
    ]
}

/// Single node whose binary and FCV can be swapped between phases.
pub struct MultiVersionHarness {
    oplog: OplogBuffer,
    config: ConfigService,
    binary: BinaryVersion,
    logger: LogHandle,
    next_document: u64,
}

impl MultiVersionHarness {
    pub fn new(binary: BinaryVersion, fcv: FeatureCompatibilityVersion, logger: LogHandle) -> Self {
        let parameters = ServerParameters {
            feature_compatibility_version: fcv,
            change_stream_max_await_ms: HARNESS_MAX_AWAIT_MS,
            ..ServerParameters::default()
        };
        Self {
            oplog: OplogBuffer::new(parameters.retention()),
            config: ConfigService::from_parameters(&parameters),
            binary,
            logger,
            next_document: 0,
        }
    }

    pub fn binary(&self) -> BinaryVersion {
        self.binary
    }

    pub fn oplog(&self) -> &OplogBuffer {
        &self.oplog
    }

    pub fn config(&self) -> &ConfigService {
        &self.config
    }

    /// Swaps the running binary; the log is kept.
    pub fn restart_with_binary(&mut self, binary: BinaryVersion) {
        if binary != self.binary {
            self.logger.info(
                LogContext::new(COMPONENT),
                &format!("restarting node: binary {} -> {}", self.binary, binary),
            );
        }
        self.binary = binary;
    }

    pub fn set_feature_compatibility_version(
        &mut self,
        fcv: FeatureCompatibilityVersion,
    ) -> Result<()> {
        let previous = self.config.feature_compatibility_version();
        self.patch_parameters(json!({ FCV_PARAMETER: fcv.as_str() }))
            .with_context(|| format!("setting fcv {}", fcv))?;
        if previous != fcv {
            self.logger.info(
                LogContext::new(COMPONENT),
                &format!("fcv {} -> {}", previous, fcv),
            );
        }
        Ok(())
    }

    /// Applies a parameter patch. Hot knobs reach the running log at once;
    /// the rest wait for the next session.
    pub fn patch_parameters(&mut self, patch: Value) -> Result<ConfigPatchResult> {
        let result = self.config.patch(patch)?;
        if result.changed_keys.iter().any(|key| key == RETENTION_PARAMETER) {
            let retention = self.config.parameters().retention();
            self.oplog.set_retention(retention);
            self.logger.info(
                LogContext::new(COMPONENT),
                &format!(
                    "oplog retention set to {:?} entries at config version {}",
                    retention.max_entries, result.version
                ),
            );
        }
        Ok(result)
    }

    /// New session reading the current FCV.
    pub fn session(&self) -> Session {
        let source = Arc::new(self.oplog.clone());
        Session::from_parameters(
            self.binary,
            self.config.parameters(),
            source,
            self.logger.clone(),
        )
    }

    /// Inserts the next numbered document into `namespace`.
    pub fn insert(&mut self, namespace: &str) -> Result<(LogicalTime, String)> {
        self.next_document += 1;
        let key = format!("doc-{}", self.next_document);
        let op = WriteOp::insert(namespace, key.as_str(), json!({ "_id": key }));
        let timestamp = self.oplog.append(LogOperation::Write(op))?;
        Ok((timestamp, key))
    }

    /// Runs every phase of `plan`, checking each expectation.
    pub fn run_plan(&mut self, plan: &[PhasePlan]) -> Result<Vec<PhaseReport>> {
        let mut reports = Vec::with_capacity(plan.len());
        let mut previous_mark: Option<EncodedResumeToken> = None;
        for phase in plan {
            self.restart_with_binary(phase.binary);
            self.set_feature_compatibility_version(phase.fcv)?;
            let report = self
                .run_phase(phase, previous_mark.as_ref())
                .with_context(|| format!("phase {:?}", phase.label))?;
            previous_mark = report.post_batch_resume_token.clone();
            reports.push(report);
        }
        Ok(reports)
    }

    fn run_phase(
        &mut self,
        phase: &PhasePlan,
        previous_mark: Option<&EncodedResumeToken>,
    ) -> Result<PhaseReport> {
        let session = self.session();
        let cancel = CancellationSignal::new();

        let mut cursor = session.subscribe(&SubscribeRequest::new(WATCHED_NAMESPACE))?;
        self.insert(UNWATCHED_NAMESPACE)?;
        let batch = cursor.next_batch(&cancel)?;
        ensure!(
            batch.events.is_empty(),
            "writes to {} leaked into the stream",
            UNWATCHED_NAMESPACE
        );
        let mark = batch.post_batch_resume_token.as_ref().map(|token| token.to_encoded());
        ensure!(
            mark.is_some() == phase.expect_post_batch_token,
            "post-batch resume token present={} expected={}",
            mark.is_some(),
            phase.expect_post_batch_token
        );
        if let Some(token) = &batch.post_batch_resume_token {
            ensure!(
                token.is_high_water_mark(),
                "empty batch carried a non-high-water-mark token {}",
                token
            );
        }
        cursor.close();

        let resumed_from_previous = match previous_mark {
            Some(mark) => Some(self.check_resume(&session, mark, phase.expect_resume)?),
            None => None,
        };
        self.logger.info(
            LogContext::new(COMPONENT),
            &format!(
                "phase {:?} passed (pbrt={}, resumed={:?})",
                phase.label,
                mark.is_some(),
                resumed_from_previous
            ),
        );
        Ok(PhaseReport {
            label: phase.label.clone(),
            binary: phase.binary.to_string(),
            fcv: phase.fcv.to_string(),
            post_batch_resume_token: mark,
            resumed_from_previous,
        })
    }

    fn check_resume(
        &mut self,
        session: &Session,
        mark: &EncodedResumeToken,
        expect_resume: bool,
    ) -> Result<bool> {
        let (inserted_at, key) = self.insert(WATCHED_NAMESPACE)?;
        let request = SubscribeRequest::new(WATCHED_NAMESPACE).resume_after(mark.clone());
        let mut cursor = match session.subscribe(&request) {
            Ok(cursor) => cursor,
            Err(err @ ChangeStreamError::InvalidResumeToken { .. }) if !expect_resume => {
                self.logger.info(
                    LogContext::new(COMPONENT),
                    &format!("resume rejected as expected: {}", err),
                );
                return Ok(false);
            }
            Err(err) => bail!("resume from previous mark failed: {}", err),
        };
        ensure!(expect_resume, "resume from previous mark unexpectedly succeeded");
        let batch = cursor.next_batch(&CancellationSignal::new())?;
        let Some(event) = batch.events.iter().find(|event| event.cluster_time == inserted_at) else {
            bail!("resumed stream did not deliver {}", key);
        };
        ensure!(
            event.document_key.to_string() == key,
            "resumed stream delivered {} instead of {}",
            event.document_key,
            key
        );
        cursor.close();
        Ok(true)
    }
}

/// Runs the full cycle starting and ending on `old`.
pub fn run_upgrade_downgrade(old: BinaryVersion, logger: LogHandle) -> Result<ScenarioReport> {
    let mut harness = MultiVersionHarness::new(old, FeatureCompatibilityVersion::V40, logger);
    let phases = harness.run_plan(&upgrade_downgrade_plan(old))?;
    Ok(ScenarioReport {
        old_binary: old.to_string(),
        phases,
    })
}
