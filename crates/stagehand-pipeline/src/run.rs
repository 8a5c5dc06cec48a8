//! The run record and its wall-clock deadline.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagehand_types::{PipelineError, Result, RunStatus, StageResult, StageStatus};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// RunClock — global timeout watchdog
// ---------------------------------------------------------------------------

/// Start instant and deadline of one run.
///
/// A timeout too large to represent as an instant means no deadline.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    started: Instant,
    deadline: Option<Instant>,
}

impl RunClock {
    pub fn start(timeout: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started.checked_add(timeout),
        }
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        match self.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Why a run ended in `FAILURE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// A fatal stage returned `FAIL`.
    StageFailed,
    /// The global deadline passed before every stage completed.
    GlobalTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage: String,
    pub cause: FailureCause,
}

/// One end-to-end execution of the stage sequence.
///
/// Only the orchestrator mutates a run. Once a terminal status is set every
/// further mutation is rejected with [`PipelineError::RunFinalized`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    build_number: u64,
    job_name: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    timeout_ms: u64,
    results: Vec<StageResult>,
    #[serde(default)]
    skipped: Vec<String>,
    status: RunStatus,
    failure: Option<RunFailure>,
}

impl Run {
    pub(crate) fn new(build_number: u64, job_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            build_number,
            job_name: job_name.into(),
            started_at: Utc::now(),
            finished_at: None,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            results: Vec::new(),
            skipped: Vec::new(),
            status: RunStatus::Pending,
            failure: None,
        }
    }

    pub fn build_number(&self) -> u64 {
        self.build_number
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Absolute deadline derived from the start time and the global timeout,
    /// `None` when it lies beyond the representable calendar.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let timeout = chrono::Duration::from_std(Duration::from_millis(self.timeout_ms)).ok()?;
        self.started_at.checked_add_signed(timeout)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn results(&self) -> &[StageResult] {
        &self.results
    }

    /// Stages never started because the run had already ended.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        self.failure.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn result_for(&self, stage: &str) -> Option<&StageResult> {
        self.results.iter().find(|r| r.stage == stage)
    }

    /// First stage whose result is `FAIL`, in execution order.
    pub fn first_failed_stage(&self) -> Option<&StageResult> {
        self.results
            .iter()
            .find(|r| r.status == StageStatus::Fail)
    }

    /// Name of the stage to blame for a `FAILURE`: the first `FAIL` result,
    /// else the stage that overran the global deadline.
    pub fn failing_stage(&self) -> Option<&str> {
        self.first_failed_stage()
            .map(|r| r.stage.as_str())
            .or_else(|| self.failure.as_ref().map(|f| f.stage.as_str()))
    }

    /// Wall-clock duration, available once finished.
    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }

    pub(crate) fn record(&mut self, result: StageResult) -> Result<()> {
        self.ensure_open()?;
        self.results.push(result);
        Ok(())
    }

    pub(crate) fn skip(&mut self, stage: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.skipped.push(stage.into());
        Ok(())
    }

    /// Assign the single terminal status.
    pub(crate) fn finish(&mut self, status: RunStatus, failure: Option<RunFailure>) -> Result<()> {
        self.ensure_open()?;
        if !status.is_terminal() {
            return Err(PipelineError::Other(format!(
                "cannot finish run #{} with non-terminal status {}",
                self.build_number, status
            )));
        }
        self.status = status;
        self.failure = failure;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(PipelineError::RunFinalized {
                build: self.build_number,
            });
        }
        Ok(())
    }
}

/// Terminal status for a run in which every stage completed.
pub fn classify(results: &[StageResult]) -> RunStatus {
    if results.iter().any(|r| r.status == StageStatus::Fail) {
        RunStatus::Failure
    } else if results.iter().any(|r| r.status == StageStatus::FailSoft) {
        RunStatus::Unstable
    } else {
        RunStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_types::FailureKind;

    fn soft(stage: &str) -> StageResult {
        StageResult::failed(stage, StageStatus::FailSoft, FailureKind::NonzeroExit, "x", 1)
    }

    fn hard(stage: &str) -> StageResult {
        StageResult::failed(stage, StageStatus::Fail, FailureKind::NonzeroExit, "x", 1)
    }

    #[test]
    fn classify_covers_all_terminal_statuses() {
        assert_eq!(classify(&[]), RunStatus::Success);
        assert_eq!(
            classify(&[StageResult::pass("a", 1), StageResult::pass("b", 1)]),
            RunStatus::Success
        );
        assert_eq!(
            classify(&[StageResult::pass("a", 1), soft("b")]),
            RunStatus::Unstable
        );
        assert_eq!(classify(&[soft("a"), hard("b")]), RunStatus::Failure);
    }

    #[test]
    fn finished_run_rejects_mutation() {
        let mut run = Run::new(3, "job", Duration::from_secs(60));
        run.record(StageResult::pass("Setup", 5)).unwrap();
        run.finish(RunStatus::Success, None).unwrap();

        assert!(run.finished_at().is_some());
        assert!(matches!(
            run.record(StageResult::pass("late", 1)),
            Err(PipelineError::RunFinalized { build: 3 })
        ));
        assert!(run.skip("late").is_err());
        assert!(run.finish(RunStatus::Failure, None).is_err());
        assert_eq!(run.status(), RunStatus::Success);
    }

    #[test]
    fn finish_requires_terminal_status() {
        let mut run = Run::new(1, "job", Duration::from_secs(60));
        assert!(run.finish(RunStatus::Pending, None).is_err());
        assert_eq!(run.status(), RunStatus::Pending);
    }

    #[test]
    fn failing_stage_prefers_first_fail_result() {
        let mut run = Run::new(1, "job", Duration::from_secs(60));
        run.record(soft("Validate Data")).unwrap();
        run.record(hard("Deploy")).unwrap();
        run.finish(
            RunStatus::Failure,
            Some(RunFailure {
                stage: "Deploy".into(),
                cause: FailureCause::StageFailed,
            }),
        )
        .unwrap();
        assert_eq!(run.failing_stage(), Some("Deploy"));
    }

    #[test]
    fn failing_stage_falls_back_to_timeout_stage() {
        let mut run = Run::new(1, "job", Duration::from_secs(1));
        run.record(StageResult::pass("Setup", 2000)).unwrap();
        run.finish(
            RunStatus::Failure,
            Some(RunFailure {
                stage: "Setup".into(),
                cause: FailureCause::GlobalTimeout,
            }),
        )
        .unwrap();
        assert_eq!(run.failing_stage(), Some("Setup"));
        assert!(run.first_failed_stage().is_none());
    }

    #[test]
    fn deadline_is_start_plus_timeout() {
        let run = Run::new(1, "job", Duration::from_secs(90));
        let deadline = run.deadline().unwrap();
        assert_eq!((deadline - run.started_at()).num_seconds(), 90);
    }

    #[test]
    fn huge_timeout_has_no_calendar_deadline() {
        let run = Run::new(1, "job", Duration::from_secs(u64::MAX / 2));
        assert!(run.deadline().is_none());
        assert_eq!(run.timeout_ms(), u64::MAX);
    }

    #[tokio::test]
    async fn huge_timeout_never_expires() {
        let clock = RunClock::start(Duration::from_secs(u64::MAX / 2));
        assert!(!clock.expired());
        assert_eq!(clock.remaining(), Duration::MAX);
    }

    #[tokio::test]
    async fn clock_expires_at_deadline() {
        let clock = RunClock::start(Duration::from_millis(50));
        assert!(!clock.expired());
        assert!(clock.remaining() <= Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(clock.expired());
        assert_eq!(clock.remaining(), Duration::ZERO);
        assert!(clock.elapsed() >= Duration::from_millis(50));
    }
}
