use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use stagehand_exec::{append_to_log, last_lines, ArtifactArchiver, Invocation, ProcessRunner};
use stagehand_types::{FailureKind, StageResult, StageStatus};
use tokio::time::Instant;

use crate::layout::RunLayout;
use crate::metrics::{parse_record_count, MetricsRecord, MetricsSpec};
use crate::run::RunClock;
use crate::service::{CommandHealthCheck, ServiceOutcome, ServiceSpec, ServiceSupervisor};
use crate::stage::{Stage, Step, StepKind};

#[derive(Debug, Clone)]
struct StepFailure {
    kind: FailureKind,
    message: String,
}

impl StepFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Executes one stage's steps in order and classifies the outcome.
pub struct StageRunner {
    runner: Arc<dyn ProcessRunner>,
    archiver: ArtifactArchiver,
    supervisor: Option<ServiceSupervisor>,
    layout: RunLayout,
}

impl StageRunner {
    pub fn new(runner: Arc<dyn ProcessRunner>, archiver: ArtifactArchiver, layout: RunLayout) -> Self {
        Self {
            runner,
            archiver,
            supervisor: None,
            layout,
        }
    }

    pub fn with_supervisor(mut self, supervisor: ServiceSupervisor) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Run `stage` against the run deadline in `clock`.
    ///
    /// Steps run in declared order. The first failing step ends a fatal stage;
    /// a `non_fatal` stage keeps going. `best_effort` steps only ever add a
    /// warning. Stage artifact patterns are archived whatever the outcome.
    pub async fn run(&self, stage: &Stage, clock: &RunClock) -> StageResult {
        let start = Instant::now();
        let log = self.layout.stage_log(&stage.name);
        self.note(
            &log,
            &format!(
                "=== {} (build #{}) ===",
                stage.name,
                self.layout.build_number()
            ),
        )
        .await;

        let mut warnings = Vec::new();
        let mut first_failure: Option<StepFailure> = None;

        for step in &stage.steps {
            if clock.expired() {
                first_failure.get_or_insert_with(|| {
                    StepFailure::new(
                        FailureKind::Timeout,
                        format!("global timeout reached before step '{}'", step.name),
                    )
                });
                break;
            }

            let remaining = clock.remaining();
            let clipped = remaining < step.timeout;
            let timeout = step.timeout.min(remaining);

            let Err(mut failure) = self.run_step(step, timeout, &log, clock, &mut warnings).await
            else {
                continue;
            };

            if clipped && failure.kind == FailureKind::Timeout {
                failure.message = format!("global timeout reached during step '{}'", step.name);
            }

            if step.best_effort {
                tracing::warn!(stage = %stage.name, step = %step.name, error = %failure.message, "Best-effort step failed, continuing");
                warnings.push(format!(
                    "step '{}' failed (ignored): {}",
                    step.name, failure.message
                ));
                continue;
            }

            tracing::warn!(stage = %stage.name, step = %step.name, kind = %failure.kind, error = %failure.message, "Step failed");
            if first_failure.is_none() {
                first_failure = Some(failure);
            }
            if !stage.non_fatal {
                break;
            }
        }

        if !stage.archive.is_empty() {
            let set = self.archiver.archive(&stage.slug(), &stage.archive).await;
            warnings.extend(set.warnings.into_iter().map(|w| format!("archive: {}", w)));
        }

        for warning in &warnings {
            self.note(&log, &format!("[warning] {}", warning)).await;
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        let result = match first_failure {
            None => StageResult::pass(&stage.name, duration_ms),
            Some(failure) => {
                let status = if stage.non_fatal {
                    StageStatus::FailSoft
                } else {
                    StageStatus::Fail
                };
                StageResult::failed(
                    &stage.name,
                    status,
                    failure.kind,
                    format!("{}: {}", failure.kind, failure.message),
                    duration_ms,
                )
            }
        };
        self.note(&log, &format!("=== {}: {} ({}ms) ===", stage.name, result.status, duration_ms))
            .await;

        result.with_log(log).with_warnings(warnings)
    }

    async fn run_step(
        &self,
        step: &Step,
        timeout: Duration,
        log: &Path,
        clock: &RunClock,
        warnings: &mut Vec<String>,
    ) -> Result<(), StepFailure> {
        match &step.kind {
            StepKind::Command(command) => {
                let result = self
                    .runner
                    .run(&Invocation::new(&step.name, command, timeout, log))
                    .await;
                if result.failure.is_some() && !result.stderr.is_empty() {
                    tracing::debug!(step = %step.name, stderr = %last_lines(&result.stderr, 5), "Step stderr tail");
                }
                into_step_result(&result)
            }
            StepKind::Service(spec) => self.ensure_service(step, spec, timeout, log, warnings).await,
            StepKind::Metrics(spec) => self.write_metrics(step, spec, timeout, log, clock).await,
        }
    }

    async fn ensure_service(
        &self,
        step: &Step,
        spec: &ServiceSpec,
        timeout: Duration,
        log: &Path,
        warnings: &mut Vec<String>,
    ) -> Result<(), StepFailure> {
        let Some(supervisor) = &self.supervisor else {
            return Err(StepFailure::new(
                FailureKind::StartError,
                format!("no service supervisor configured for '{}'", spec.name),
            ));
        };

        self.note(log, &format!("==> {}: ensure '{}' is running", step.name, spec.name))
            .await;
        let health = CommandHealthCheck::new(self.runner.clone(), spec, log);
        let service_log = self.layout.service_log(&spec.name);
        let outcome = tokio::time::timeout(
            timeout,
            supervisor.ensure_running(spec, &health, &service_log),
        )
        .await
        .map_err(|_| {
            StepFailure::new(
                FailureKind::Timeout,
                format!("timed out after {}ms", timeout.as_millis()),
            )
        })?;

        let line = match &outcome {
            ServiceOutcome::AlreadyRunning { pid } => format!("already running (pid {})", pid),
            ServiceOutcome::Started { pid } => format!("started (pid {})", pid),
            ServiceOutcome::Unhealthy { last_error, .. } => format!("unhealthy: {}", last_error),
            ServiceOutcome::LaunchFailed(message) => format!("launch failed: {}", message),
        };
        self.note(log, &format!("<== {}: {}", step.name, line)).await;

        match outcome {
            ServiceOutcome::LaunchFailed(message) => {
                Err(StepFailure::new(FailureKind::StartError, message))
            }
            other => {
                if let Some(warning) = other.warning(&spec.name) {
                    warnings.push(warning);
                }
                Ok(())
            }
        }
    }

    async fn write_metrics(
        &self,
        step: &Step,
        spec: &MetricsSpec,
        timeout: Duration,
        log: &Path,
        clock: &RunClock,
    ) -> Result<(), StepFailure> {
        let result = self
            .runner
            .run(&Invocation::new(
                &step.name,
                &spec.count_command,
                spec.count_timeout.min(timeout),
                log,
            ))
            .await;
        into_step_result(&result)?;

        let record_count = parse_record_count(&result.stdout).ok_or_else(|| {
            StepFailure::new(
                FailureKind::NonzeroExit,
                format!(
                    "could not read a record count from output: {:?}",
                    result.stdout.trim()
                ),
            )
        })?;

        MetricsRecord::success(self.layout.build_number(), clock.elapsed(), record_count)
            .write(&self.layout.metrics_path())
            .await
            .map_err(|e| StepFailure::new(FailureKind::NonzeroExit, e.to_string()))
    }

    async fn note(&self, log: &Path, line: &str) {
        if let Err(e) = append_to_log(log, &format!("{}\n", line)).await {
            tracing::debug!(log = %log.display(), error = %e, "Could not write stage log");
        }
    }
}

fn into_step_result(result: &stagehand_types::ExecutionResult) -> Result<(), StepFailure> {
    match result.failure {
        None => Ok(()),
        Some(kind) => Err(StepFailure::new(
            kind,
            result.message.clone().unwrap_or_else(|| kind.to_string()),
        )),
    }
}
