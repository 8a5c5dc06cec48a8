//! Post-action hooks dispatched once a run reaches a terminal status.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagehand_exec::ArtifactArchiver;
use stagehand_types::{PipelineError, Result, RunStatus};

use crate::events::{EventEmitter, RunEvent};
use crate::run::Run;

/// A callback run after the pipeline has finished.
///
/// Hook errors are logged by the dispatcher and never change the run status.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, run: &Run) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    Always,
    Success,
    Failure,
    Unstable,
}

impl HookPhase {
    /// The outcome-specific phase matching a terminal `status`.
    pub fn for_status(status: RunStatus) -> Option<Self> {
        match status {
            RunStatus::Success => Some(HookPhase::Success),
            RunStatus::Failure => Some(HookPhase::Failure),
            RunStatus::Unstable => Some(HookPhase::Unstable),
            RunStatus::Pending => None,
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "always"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Unstable => write!(f, "unstable"),
        }
    }
}

/// Hooks grouped by phase, each group run in registration order.
#[derive(Default, Clone)]
pub struct HookSet {
    always: Vec<Arc<dyn Hook>>,
    success: Vec<Arc<dyn Hook>>,
    failure: Vec<Arc<dyn Hook>>,
    unstable: Vec<Arc<dyn Hook>>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, phase: HookPhase, hook: Arc<dyn Hook>) -> Self {
        match phase {
            HookPhase::Always => self.always.push(hook),
            HookPhase::Success => self.success.push(hook),
            HookPhase::Failure => self.failure.push(hook),
            HookPhase::Unstable => self.unstable.push(hook),
        }
        self
    }

    pub fn always(self, hook: impl Hook + 'static) -> Self {
        self.add(HookPhase::Always, Arc::new(hook))
    }

    pub fn success(self, hook: impl Hook + 'static) -> Self {
        self.add(HookPhase::Success, Arc::new(hook))
    }

    pub fn failure(self, hook: impl Hook + 'static) -> Self {
        self.add(HookPhase::Failure, Arc::new(hook))
    }

    pub fn unstable(self, hook: impl Hook + 'static) -> Self {
        self.add(HookPhase::Unstable, Arc::new(hook))
    }

    pub fn hooks(&self, phase: HookPhase) -> &[Arc<dyn Hook>] {
        match phase {
            HookPhase::Always => &self.always,
            HookPhase::Success => &self.success,
            HookPhase::Failure => &self.failure,
            HookPhase::Unstable => &self.unstable,
        }
    }

    pub fn len(&self) -> usize {
        self.always.len() + self.success.len() + self.failure.len() + self.unstable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// PostActionDispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookInvocation {
    pub phase: HookPhase,
    pub hook: String,
    pub error: Option<String>,
}

/// Which hooks ran and how they fared.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub invocations: Vec<HookInvocation>,
}

impl DispatchReport {
    pub fn fired(&self, phase: HookPhase) -> usize {
        self.invocations.iter().filter(|i| i.phase == phase).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &HookInvocation> {
        self.invocations.iter().filter(|i| i.error.is_some())
    }
}

/// Runs the hook set for a finished run, exactly once.
///
/// `always` hooks run first, then the one phase matching the terminal status.
pub struct PostActionDispatcher {
    hooks: HookSet,
    dispatched: AtomicBool,
    events: Option<EventEmitter>,
}

impl PostActionDispatcher {
    pub fn new(hooks: HookSet) -> Self {
        Self {
            hooks,
            dispatched: AtomicBool::new(false),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    /// Returns `None` without running anything when `run` is not terminal or
    /// when hooks were already dispatched.
    pub async fn dispatch(&self, run: &Run) -> Option<DispatchReport> {
        let Some(phase) = HookPhase::for_status(run.status()) else {
            tracing::warn!(build = run.build_number(), "Post actions requested for an unfinished run");
            return None;
        };
        if self.dispatched.swap(true, Ordering::SeqCst) {
            tracing::warn!(build = run.build_number(), "Post actions already dispatched");
            return None;
        }

        let mut report = DispatchReport::default();
        for current in [HookPhase::Always, phase] {
            for hook in self.hooks.hooks(current) {
                tracing::debug!(phase = %current, hook = %hook.name(), "Running post action");
                let error = match hook.run(run).await {
                    Ok(()) => None,
                    Err(e) => {
                        let err = PipelineError::Hook {
                            hook: hook.name().to_string(),
                            message: e.to_string(),
                        };
                        tracing::error!(phase = %current, error = %err, "❌ Post action failed");
                        if let Some(events) = &self.events {
                            events.emit(RunEvent::HookFailed {
                                hook: hook.name().to_string(),
                                error: e.to_string(),
                            });
                        }
                        Some(e.to_string())
                    }
                };
                report.invocations.push(HookInvocation {
                    phase: current,
                    hook: hook.name().to_string(),
                    error,
                });
            }
        }
        Some(report)
    }
}

// ---------------------------------------------------------------------------
// Built-in hooks
// ---------------------------------------------------------------------------

/// Sweeps glob patterns into a named artifact set.
pub struct ArchiveHook {
    name: String,
    archiver: ArtifactArchiver,
    patterns: Vec<String>,
}

impl ArchiveHook {
    pub fn new(name: impl Into<String>, archiver: ArtifactArchiver, patterns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            archiver,
            patterns,
        }
    }
}

#[async_trait]
impl Hook for ArchiveHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _run: &Run) -> Result<()> {
        let set = self.archiver.archive(&self.name, &self.patterns).await;
        for warning in &set.warnings {
            tracing::warn!(artifacts = %self.name, warning = %warning, "⚠️ Artifact sweep warning");
        }
        Ok(())
    }
}

type HookFn = dyn Fn(&Run) -> Result<()> + Send + Sync;

/// Hook backed by a synchronous closure.
pub struct FnHook {
    name: String,
    f: Box<HookFn>,
}

impl FnHook {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Run) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl Hook for FnHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, run: &Run) -> Result<()> {
        (self.f)(run)
    }
}
