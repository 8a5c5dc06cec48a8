//! Static stage and step definitions.

use std::time::Duration;

use crate::layout::slugify;
use crate::metrics::MetricsSpec;
use crate::service::ServiceSpec;

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// What a step does when it runs.
#[derive(Debug, Clone)]
pub enum StepKind {
    /// A shell command run through the process runner.
    Command(String),
    /// Make sure a long-lived background server is up.
    Service(ServiceSpec),
    /// Write the deploy metrics record.
    Metrics(MetricsSpec),
}

/// A single unit of external work within a stage.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    pub timeout: Duration,
    /// Swallow this step's failure and keep going (`cmd || true`).
    pub best_effort: bool,
}

impl Step {
    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(name, StepKind::Command(command.into()))
    }

    pub fn service(name: impl Into<String>, spec: ServiceSpec) -> Self {
        Self::new(name, StepKind::Service(spec))
    }

    pub fn metrics(name: impl Into<String>, spec: MetricsSpec) -> Self {
        Self::new(name, StepKind::Metrics(spec))
    }

    fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            timeout: DEFAULT_STEP_TIMEOUT,
            best_effort: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }
}

/// A named, ordered group of steps.
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub steps: Vec<Step>,
    /// Step failures degrade the stage to `FAIL_SOFT` instead of failing the run.
    pub non_fatal: bool,
    /// Glob patterns archived after the stage, whatever its outcome.
    pub archive: Vec<String>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            non_fatal: false,
            archive: Vec::new(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn non_fatal(mut self) -> Self {
        self.non_fatal = true;
        self
    }

    pub fn archive<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.archive.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// File-system safe form of the stage name.
    pub fn slug(&self) -> String {
        slugify(&self.name)
    }
}
