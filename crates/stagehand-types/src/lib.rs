//! Shared types, errors, environment context, and outcomes for the stagehand orchestrator.
//!
//! This crate provides the foundational types used across all other stagehand crates:
//! - `PipelineError` — unified error taxonomy
//! - `EnvironmentContext` — configuration resolved once per run, read-only afterwards
//! - `ExecutionResult` — what a single external command invocation produced
//! - `StageResult`, `StageStatus`, `RunStatus` — stage and run outcomes

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Unified error type for all stagehand subsystems.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    // === Configuration Errors ===
    #[error("Missing required configuration: {}", keys.join(", "))]
    MissingConfig { keys: Vec<String> },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidConfig { key: String, message: String },

    // === Execution Errors ===
    #[error("Failed to start '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("Archiving '{pattern}' failed: {message}")]
    Archive { pattern: String, message: String },

    // === Post-action Errors ===
    #[error("Notification delivery failed: {0}")]
    Notification(String),

    #[error("Hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    #[error("Run #{build} already reached a terminal status")]
    RunFinalized { build: u64 },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Returns `true` for errors raised while resolving configuration, before any stage runs.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            PipelineError::MissingConfig { .. } | PipelineError::InvalidConfig { .. }
        )
    }
}

/// A convenience alias for `Result<T, PipelineError>`.
pub type Result<T> = std::result::Result<T, PipelineError>;

// ---------------------------------------------------------------------------
// EnvironmentContext — configuration resolved once per run
// ---------------------------------------------------------------------------

/// Keys that must resolve to a non-empty value before the first stage starts.
pub const REQUIRED_KEYS: &[&str] = &[
    "DB_HOST",
    "DB_PORT",
    "DB_NAME",
    "DB_USER",
    "DB_PASSWORD",
    "NOTIFY_EMAIL",
    "PYTHON",
];

pub const DEFAULT_JOB_NAME: &str = "etl-dashboard";
pub const DEFAULT_BUILD_URL_BASE: &str = "http://localhost:8080/job";

/// Connection settings for the external data store.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-run identity assigned by the caller before configuration is resolved.
#[derive(Debug, Clone)]
pub struct RunIdentity {
    pub build_number: u64,
    pub workspace: PathBuf,
}

/// Immutable, per-run configuration shared by every stage.
///
/// Constructed once through [`resolve`](EnvironmentContext::resolve); there are
/// no mutators, so stages can only read it.
#[derive(Debug, Clone)]
pub struct EnvironmentContext {
    job_name: String,
    build_number: u64,
    build_url: String,
    workspace: PathBuf,
    database: DatabaseConfig,
    notify_recipient: String,
    python: String,
}

impl EnvironmentContext {
    /// Resolve every configuration value through `lookup`.
    ///
    /// Blank values count as unresolved. All missing required keys are
    /// reported together in a single [`PipelineError::MissingConfig`].
    pub fn resolve<F>(lookup: F, identity: RunIdentity) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let missing: Vec<String> = REQUIRED_KEYS
            .iter()
            .filter(|k| get(**k).is_none())
            .map(|k| k.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::MissingConfig { keys: missing });
        }

        let required = |key: &str| {
            get(key).ok_or_else(|| PipelineError::MissingConfig {
                keys: vec![key.to_string()],
            })
        };

        let raw_port = required("DB_PORT")?;
        let port = raw_port
            .trim()
            .parse::<u16>()
            .map_err(|e| PipelineError::InvalidConfig {
                key: "DB_PORT".into(),
                message: format!("'{}' is not a port number: {}", raw_port, e),
            })?;

        let job_name = get("JOB_NAME").unwrap_or_else(|| DEFAULT_JOB_NAME.to_string());
        let base = get("BUILD_URL_BASE").unwrap_or_else(|| DEFAULT_BUILD_URL_BASE.to_string());
        let build_url = format!(
            "{}/{}/{}/",
            base.trim_end_matches('/'),
            job_name,
            identity.build_number
        );

        Ok(Self {
            job_name,
            build_number: identity.build_number,
            build_url,
            workspace: identity.workspace,
            database: DatabaseConfig {
                host: required("DB_HOST")?,
                port,
                name: required("DB_NAME")?,
                user: required("DB_USER")?,
                password: required("DB_PASSWORD")?,
            },
            notify_recipient: required("NOTIFY_EMAIL")?,
            python: required("PYTHON")?,
        })
    }

    /// Resolve from the process environment.
    pub fn from_env(identity: RunIdentity) -> Result<Self> {
        Self::resolve(|key| std::env::var(key).ok(), identity)
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn build_number(&self) -> u64 {
        self.build_number
    }

    pub fn build_url(&self) -> &str {
        &self.build_url
    }

    /// Link to the console log of this build.
    pub fn console_url(&self) -> String {
        format!("{}console", self.build_url)
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn database(&self) -> &DatabaseConfig {
        &self.database
    }

    pub fn notify_recipient(&self) -> &str {
        &self.notify_recipient
    }

    pub fn python(&self) -> &str {
        &self.python
    }

    /// Variables every child process inherits.
    pub fn process_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("DB_HOST".into(), self.database.host.clone());
        env.insert("DB_PORT".into(), self.database.port.to_string());
        env.insert("DB_NAME".into(), self.database.name.clone());
        env.insert("DB_USER".into(), self.database.user.clone());
        env.insert("DB_PASSWORD".into(), self.database.password.clone());
        env.insert("PGPASSWORD".into(), self.database.password.clone());
        env.insert("PYTHON".into(), self.python.clone());
        env.insert("NOTIFY_EMAIL".into(), self.notify_recipient.clone());
        env.insert("BUILD_NUMBER".into(), self.build_number.to_string());
        env.insert("JOB_NAME".into(), self.job_name.clone());
        env.insert("BUILD_URL".into(), self.build_url.clone());
        env.insert(
            "WORKSPACE".into(),
            self.workspace.to_string_lossy().into_owned(),
        );
        env
    }
}

// ---------------------------------------------------------------------------
// ExecutionResult — outcome of one external command invocation
// ---------------------------------------------------------------------------

/// Why an invocation did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The command could not be launched.
    StartError,
    /// The step timeout or the global deadline elapsed.
    Timeout,
    /// The command ran and exited with a non-zero status.
    NonzeroExit,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartError => write!(f, "START_ERROR"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::NonzeroExit => write!(f, "NONZERO_EXIT"),
        }
    }
}

/// Everything observable about a finished invocation.
///
/// Every failure mode is represented here, so a process runner never has to
/// return an error.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub failure: Option<FailureKind>,
    pub message: Option<String>,
    pub log_path: PathBuf,
}

impl ExecutionResult {
    /// The command ran to completion with `exit_code`.
    pub fn exited(exit_code: i32, duration_ms: u64, log_path: impl Into<PathBuf>) -> Self {
        let failure = (exit_code != 0).then_some(FailureKind::NonzeroExit);
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: String::new(),
            duration_ms,
            failure,
            message: failure.map(|_| format!("exited with code {}", exit_code)),
            log_path: log_path.into(),
        }
    }

    /// The command could not be launched.
    pub fn start_error(
        message: impl Into<String>,
        duration_ms: u64,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms,
            failure: Some(FailureKind::StartError),
            message: Some(message.into()),
            log_path: log_path.into(),
        }
    }

    /// The command was killed after `timeout_ms`.
    pub fn timed_out(timeout_ms: u64, duration_ms: u64, log_path: impl Into<PathBuf>) -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms,
            failure: Some(FailureKind::Timeout),
            message: Some(format!("timed out after {}ms", timeout_ms)),
            log_path: log_path.into(),
        }
    }

    /// Attach captured output.
    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self.stderr = stderr.into();
        self
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// One-line description of the failure, e.g. `NONZERO_EXIT: exited with code 3`.
    pub fn failure_summary(&self) -> Option<String> {
        self.failure.map(|kind| match &self.message {
            Some(msg) => format!("{}: {}", kind, msg),
            None => kind.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// StageStatus / RunStatus
// ---------------------------------------------------------------------------

/// Tri-state outcome of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pass,
    Fail,
    /// A failure tolerated by policy.
    FailSoft,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
            Self::FailSoft => write!(f, "FAIL_SOFT"),
        }
    }
}

/// Status of a whole run. Everything except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Success,
    Failure,
    Unstable,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
            Self::Unstable => write!(f, "UNSTABLE"),
        }
    }
}

// ---------------------------------------------------------------------------
// StageResult — outcome of running one stage within one run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    pub duration_ms: u64,
    pub log_path: Option<PathBuf>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    /// Soft warnings that did not change `status` (e.g. a failed health check).
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl StageResult {
    /// Create a passing result.
    pub fn pass(stage: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Pass,
            duration_ms,
            log_path: None,
            error: None,
            failure_kind: None,
            warnings: Vec::new(),
        }
    }

    /// Create a failed (`Fail` or `FailSoft`) result carrying the failing step's error.
    pub fn failed(
        stage: impl Into<String>,
        status: StageStatus,
        kind: FailureKind,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            stage: stage.into(),
            status,
            duration_ms,
            log_path: None,
            error: Some(error.into()),
            failure_kind: Some(kind),
            warnings: Vec::new(),
        }
    }

    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}
