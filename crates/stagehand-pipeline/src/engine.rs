//! Pipeline orchestration: the stage-sequencing state machine.
//!
//! `INIT -> RUNNING(i) -> {SUCCESS, FAILURE, UNSTABLE}`. Stages run strictly
//! in order. A `FAIL` result or an expired global deadline ends the run and
//! every remaining stage is skipped without being started.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use stagehand_exec::{ArtifactArchiver, ProcessRunner};
use stagehand_types::{
    EnvironmentContext, PipelineError, Result, RunStatus, StageResult, StageStatus,
};

use crate::events::{EventEmitter, RunEvent};
use crate::hooks::{HookSet, PostActionDispatcher};
use crate::layout::RunLayout;
use crate::retention::prune_runs;
use crate::run::{classify, FailureCause, Run, RunClock, RunFailure};
use crate::run_record::save_run;
use crate::service::{ServiceHost, ServiceSupervisor};
use crate::stage::Stage;
use crate::stage_runner::StageRunner;

pub const DEFAULT_GLOBAL_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_KEEP_RUNS: usize = 10;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Orchestrator state. `Finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Init,
    Running(usize),
    Finished(RunStatus),
}

/// Owns the stage list, the run deadline and the post-action hooks of one run.
pub struct PipelineOrchestrator {
    context: Arc<EnvironmentContext>,
    runner: Arc<dyn ProcessRunner>,
    layout: RunLayout,
    stages: Vec<Stage>,
    timeout: Duration,
    hooks: HookSet,
    service_host: Option<Arc<dyn ServiceHost>>,
    events: EventEmitter,
    keep_runs: Option<usize>,
}

/// Reject stage lists whose logs would collide.
pub fn validate_stages(stages: &[Stage]) -> Result<()> {
    let mut seen = HashSet::new();
    for stage in stages {
        if stage.name.trim().is_empty() {
            return Err(PipelineError::InvalidConfig {
                key: "stage".into(),
                message: "stage name must not be empty".into(),
            });
        }
        if !seen.insert(stage.slug()) {
            return Err(PipelineError::InvalidConfig {
                key: "stage".into(),
                message: format!("duplicate stage name '{}'", stage.name),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// PipelineOrchestrator
// ---------------------------------------------------------------------------

impl PipelineOrchestrator {
    pub fn new(
        context: Arc<EnvironmentContext>,
        runner: Arc<dyn ProcessRunner>,
        layout: RunLayout,
    ) -> Self {
        Self {
            context,
            runner,
            layout,
            stages: Vec::new(),
            timeout: DEFAULT_GLOBAL_TIMEOUT,
            hooks: HookSet::new(),
            service_host: None,
            events: EventEmitter::default(),
            keep_runs: None,
        }
    }

    pub fn with_stages(mut self, stages: Vec<Stage>) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_hooks(mut self, hooks: HookSet) -> Self {
        self.hooks = hooks;
        self
    }

    /// Host used by service steps to find and launch background servers.
    pub fn with_service_host(mut self, host: Arc<dyn ServiceHost>) -> Self {
        self.service_host = Some(host);
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Prune all but the `keep` most recent runs when the run starts.
    pub fn with_retention(mut self, keep: usize) -> Self {
        self.keep_runs = Some(keep);
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    fn stage_runner(&self) -> StageRunner {
        let archiver = ArtifactArchiver::new(self.context.workspace(), self.layout.stage_artifacts_dir())
            .exclude(self.layout.runs_root());
        let runner = StageRunner::new(self.runner.clone(), archiver, self.layout.clone());
        match &self.service_host {
            Some(host) => runner.with_supervisor(ServiceSupervisor::new(host.clone())),
            None => runner,
        }
    }

    /// Execute every stage, dispatch post actions once, and return the
    /// finished run.
    pub async fn run(self) -> Result<Run> {
        validate_stages(&self.stages)?;

        let clock = RunClock::start(self.timeout);
        let mut run = Run::new(
            self.layout.build_number(),
            self.context.job_name(),
            self.timeout,
        );
        // Stage logs are opened lazily, so the run goes on without this and
        // still reaches a terminal status and its hooks.
        if let Err(e) = tokio::fs::create_dir_all(self.layout.logs_dir()).await {
            tracing::warn!(dir = %self.layout.logs_dir().display(), error = %e, "⚠️ Could not create run log directory");
        }
        if let Some(keep) = self.keep_runs {
            if let Err(e) = prune_runs(self.layout.runs_root(), keep).await {
                tracing::warn!(error = %e, "Could not prune old runs");
            }
        }

        let stage_runner = self.stage_runner();
        let mut failure: Option<RunFailure> = None;
        let mut state = RunState::Init;

        let status = loop {
            state = match state {
                RunState::Init => {
                    tracing::info!(
                        job = %self.context.job_name(),
                        build = run.build_number(),
                        stages = self.stages.len(),
                        timeout_secs = self.timeout.as_secs(),
                        "Starting run"
                    );
                    self.events.emit(RunEvent::RunStarted {
                        job_name: self.context.job_name().to_string(),
                        build_number: run.build_number(),
                        stage_count: self.stages.len(),
                    });
                    if self.stages.is_empty() {
                        RunState::Finished(RunStatus::Success)
                    } else {
                        RunState::Running(0)
                    }
                }
                RunState::Running(index) => {
                    let stage = &self.stages[index];
                    if clock.expired() {
                        tracing::error!(stage = %stage.name, "❌ Global timeout reached, stage not started");
                        failure = Some(RunFailure {
                            stage: stage.name.clone(),
                            cause: FailureCause::GlobalTimeout,
                        });
                        RunState::Finished(RunStatus::Failure)
                    } else {
                        let result = self.run_stage(&stage_runner, stage, index, &clock).await;
                        let stage_status = result.status;
                        run.record(result)?;

                        if stage_status == StageStatus::Fail {
                            failure = Some(RunFailure {
                                stage: stage.name.clone(),
                                cause: FailureCause::StageFailed,
                            });
                            RunState::Finished(RunStatus::Failure)
                        } else if clock.expired() {
                            tracing::error!(
                                stage = %stage.name,
                                elapsed_ms = clock.elapsed().as_millis() as u64,
                                "❌ Global timeout reached"
                            );
                            failure = Some(RunFailure {
                                stage: stage.name.clone(),
                                cause: FailureCause::GlobalTimeout,
                            });
                            RunState::Finished(RunStatus::Failure)
                        } else if index + 1 < self.stages.len() {
                            RunState::Running(index + 1)
                        } else {
                            RunState::Finished(classify(run.results()))
                        }
                    }
                }
                RunState::Finished(status) => break status,
            };
        };

        for stage in &self.stages[run.results().len()..] {
            tracing::info!(stage = %stage.name, "⏭ Skipped");
            run.skip(&stage.name)?;
            self.events.emit(RunEvent::StageSkipped {
                stage: stage.name.clone(),
            });
        }

        run.finish(status, failure)?;
        log_run_status(&run);

        if let Err(e) = save_run(&run, &self.layout).await {
            tracing::warn!(error = %e, "Could not save run record");
        }

        let dispatcher = PostActionDispatcher::new(self.hooks).with_events(self.events.clone());
        dispatcher.dispatch(&run).await;

        self.events.emit(RunEvent::RunFinished {
            build_number: run.build_number(),
            status: run.status(),
            failing_stage: run.failing_stage().map(str::to_string),
            duration_ms: run.duration_ms().unwrap_or_default(),
        });
        Ok(run)
    }

    async fn run_stage(
        &self,
        stage_runner: &StageRunner,
        stage: &Stage,
        index: usize,
        clock: &RunClock,
    ) -> StageResult {
        tracing::info!(stage = %stage.name, index, steps = stage.steps.len(), "Stage started");
        self.events.emit(RunEvent::StageStarted {
            stage: stage.name.clone(),
            index,
        });

        let result = stage_runner.run(stage, clock).await;

        match result.status {
            StageStatus::Pass => {
                tracing::info!(stage = %stage.name, duration_ms = result.duration_ms, "✅ Stage passed")
            }
            StageStatus::FailSoft => tracing::warn!(
                stage = %stage.name,
                duration_ms = result.duration_ms,
                error = result.error.as_deref().unwrap_or_default(),
                "⚠️ Stage failed (non-fatal)"
            ),
            StageStatus::Fail => tracing::error!(
                stage = %stage.name,
                duration_ms = result.duration_ms,
                error = result.error.as_deref().unwrap_or_default(),
                "❌ Stage failed"
            ),
        }
        for warning in &result.warnings {
            tracing::warn!(stage = %stage.name, warning = %warning, "⚠️ Warning");
        }

        self.events.emit(RunEvent::StageCompleted {
            stage: stage.name.clone(),
            status: result.status,
            duration_ms: result.duration_ms,
        });
        result
    }
}

fn log_run_status(run: &Run) {
    let build = run.build_number();
    match run.status() {
        RunStatus::Success => tracing::info!(build, "✅ Pipeline succeeded"),
        RunStatus::Unstable => tracing::warn!(build, "⚠️ Pipeline unstable"),
        RunStatus::Failure => tracing::error!(
            build,
            stage = run.failing_stage().unwrap_or("unknown"),
            "❌ Pipeline failed"
        ),
        RunStatus::Pending => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
