//! Supervision of long-lived background servers.
//!
//! A service outlives the run that started it. [`ServiceSupervisor`] only
//! makes sure one instance is up and answering its health check; it never
//! stops the service.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use stagehand_exec::{append_to_log, Invocation, LocalProcessRunner, ProcessRunner};
use stagehand_types::{EnvironmentContext, PipelineError, Result};

use crate::retry::{retry_with_backoff, BackoffPolicy};

pub const DEFAULT_GRACE: Duration = Duration::from_secs(3);
pub const DEFAULT_HEALTH_ATTEMPTS: usize = 3;
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

/// How to find, start and health-check a background service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    /// Shell command that starts the service in the foreground.
    pub command: String,
    /// Regex matched against process command lines to detect a running instance.
    pub match_pattern: String,
    /// Wait after a fresh launch before the first health check.
    pub grace: Duration,
    pub health_command: String,
    pub health_timeout: Duration,
    pub health_attempts: usize,
    pub backoff: BackoffPolicy,
}

impl ServiceSpec {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        match_pattern: impl Into<String>,
        health_command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            match_pattern: match_pattern.into(),
            grace: DEFAULT_GRACE,
            health_command: health_command.into(),
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            health_attempts: DEFAULT_HEALTH_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_health_attempts(mut self, attempts: usize) -> Self {
        self.health_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Result of [`ServiceSupervisor::ensure_running`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// An instance was already running and is healthy.
    AlreadyRunning { pid: u32 },
    /// A new instance was launched and is healthy.
    Started { pid: u32 },
    /// The service is (or was just launched) but never passed its health check.
    Unhealthy {
        launched: bool,
        attempts: usize,
        last_error: String,
    },
    /// The service could not be launched at all.
    LaunchFailed(String),
}

impl ServiceOutcome {
    /// Soft warning to attach to the stage result, if any.
    pub fn warning(&self, service: &str) -> Option<String> {
        match self {
            ServiceOutcome::Unhealthy {
                attempts,
                last_error,
                ..
            } => Some(format!(
                "{} failed its health check after {} attempt(s): {}",
                service, attempts, last_error
            )),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Seams: health check and process host
// ---------------------------------------------------------------------------

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> std::result::Result<(), String>;
}

/// Health check that passes when a command exits zero.
pub struct CommandHealthCheck {
    runner: Arc<dyn ProcessRunner>,
    invocation: Invocation,
}

impl CommandHealthCheck {
    pub fn new(runner: Arc<dyn ProcessRunner>, spec: &ServiceSpec, log_path: &Path) -> Self {
        Self {
            runner,
            invocation: Invocation::new(
                format!("{} health", spec.name),
                spec.health_command.clone(),
                spec.health_timeout,
                log_path,
            ),
        }
    }
}

#[async_trait]
impl HealthCheck for CommandHealthCheck {
    async fn check(&self) -> std::result::Result<(), String> {
        let result = self.runner.run(&self.invocation).await;
        match result.failure_summary() {
            None => Ok(()),
            Some(summary) => Err(summary),
        }
    }
}

/// Where services are looked up and launched.
#[async_trait]
pub trait ServiceHost: Send + Sync {
    /// PID of a process whose command line matches `pattern`.
    async fn find_running(&self, pattern: &Regex) -> Result<Option<u32>>;

    /// Start `spec.command` detached from the caller, appending output to `log_path`.
    async fn launch_detached(&self, spec: &ServiceSpec, log_path: &Path) -> Result<u32>;
}

/// Uses the local process table and shell.
pub struct LocalServiceHost {
    context: Arc<EnvironmentContext>,
}

impl LocalServiceHost {
    pub fn new(context: Arc<EnvironmentContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl ServiceHost for LocalServiceHost {
    async fn find_running(&self, pattern: &Regex) -> Result<Option<u32>> {
        let output = tokio::process::Command::new("ps")
            .args(["-eo", "pid=,args="])
            .output()
            .await
            .map_err(|e| PipelineError::Spawn {
                command: "ps".into(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(PipelineError::Other(format!(
                "ps exited with {}",
                output.status
            )));
        }
        let own_pid = std::process::id();
        let table = String::from_utf8_lossy(&output.stdout);
        Ok(find_in_process_table(&table, pattern, own_pid))
    }

    async fn launch_detached(&self, spec: &ServiceSpec, log_path: &Path) -> Result<u32> {
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = tokio::process::Command::new("bash");
        cmd.args(["-c", &spec.command])
            .current_dir(self.context.workspace())
            .env_clear()
            .envs(LocalProcessRunner::filtered_env())
            .envs(self.context.process_env())
            .stdin(std::process::Stdio::null())
            .stdout(log)
            .stderr(log_err);

        // Own process group so the service survives the run's signals
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|e| PipelineError::Spawn {
            command: spec.command.clone(),
            message: e.to_string(),
        })?;
        child.id().ok_or_else(|| PipelineError::Spawn {
            command: spec.command.clone(),
            message: "service exited immediately".into(),
        })
    }
}

/// Pretends nothing is running and records launches in the log without spawning.
pub struct DryRunServiceHost;

#[async_trait]
impl ServiceHost for DryRunServiceHost {
    async fn find_running(&self, _pattern: &Regex) -> Result<Option<u32>> {
        Ok(None)
    }

    async fn launch_detached(&self, spec: &ServiceSpec, log_path: &Path) -> Result<u32> {
        tracing::info!(service = %spec.name, command = %spec.command, "Dry run, not launching service");
        append_to_log(
            log_path,
            &format!("==> {}: {}\n<== dry run, not launched\n", spec.name, spec.command),
        )
        .await?;
        Ok(0)
    }
}

/// First PID in `ps -eo pid=,args=` output whose args match `pattern`,
/// ignoring `own_pid`.
fn find_in_process_table(table: &str, pattern: &Regex, own_pid: u32) -> Option<u32> {
    table.lines().find_map(|line| {
        let line = line.trim_start();
        let (pid, args) = line.split_once(char::is_whitespace)?;
        let pid: u32 = pid.parse().ok()?;
        (pid != own_pid && pattern.is_match(args.trim())).then_some(pid)
    })
}

// ---------------------------------------------------------------------------
// ServiceSupervisor
// ---------------------------------------------------------------------------

pub struct ServiceSupervisor {
    host: Arc<dyn ServiceHost>,
}

impl ServiceSupervisor {
    pub fn new(host: Arc<dyn ServiceHost>) -> Self {
        Self { host }
    }

    /// Make sure exactly one instance of `spec` is running, launching it if
    /// none is found, then health-check it with bounded retry.
    pub async fn ensure_running(
        &self,
        spec: &ServiceSpec,
        health: &dyn HealthCheck,
        log_path: &Path,
    ) -> ServiceOutcome {
        let pattern = match Regex::new(&spec.match_pattern) {
            Ok(p) => p,
            Err(e) => {
                return ServiceOutcome::LaunchFailed(format!(
                    "invalid match pattern '{}': {}",
                    spec.match_pattern, e
                ))
            }
        };

        let existing = match self.host.find_running(&pattern).await {
            Ok(pid) => pid,
            Err(e) => {
                tracing::warn!(service = %spec.name, error = %e, "Could not inspect process table, launching anyway");
                None
            }
        };

        let (pid, launched) = match existing {
            Some(pid) => {
                tracing::info!(service = %spec.name, pid, "Service already running");
                (pid, false)
            }
            None => match self.host.launch_detached(spec, log_path).await {
                Ok(pid) => {
                    tracing::info!(service = %spec.name, pid, grace_ms = spec.grace.as_millis() as u64, "Service launched");
                    tokio::time::sleep(spec.grace).await;
                    (pid, true)
                }
                Err(e) => {
                    tracing::warn!(service = %spec.name, error = %e, "Service launch failed");
                    return ServiceOutcome::LaunchFailed(e.to_string());
                }
            },
        };

        let (result, attempts) = retry_with_backoff(
            || health.check(),
            spec.health_attempts,
            &spec.backoff,
            &spec.name,
        )
        .await;

        match result {
            Ok(()) if launched => ServiceOutcome::Started { pid },
            Ok(()) => ServiceOutcome::AlreadyRunning { pid },
            Err(last_error) => {
                tracing::warn!(service = %spec.name, attempts, error = %last_error, "Service health check failed");
                ServiceOutcome::Unhealthy {
                    launched,
                    attempts,
                    last_error,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeHost {
        running: Option<u32>,
        launch_error: bool,
        launches: Mutex<Vec<String>>,
    }

    impl FakeHost {
        fn new(running: Option<u32>) -> Self {
            Self {
                running,
                launch_error: false,
                launches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ServiceHost for FakeHost {
        async fn find_running(&self, _pattern: &Regex) -> Result<Option<u32>> {
            Ok(self.running)
        }

        async fn launch_detached(&self, spec: &ServiceSpec, _log: &Path) -> Result<u32> {
            if self.launch_error {
                return Err(PipelineError::Spawn {
                    command: spec.command.clone(),
                    message: "no such file".into(),
                });
            }
            self.launches.lock().unwrap().push(spec.command.clone());
            Ok(4242)
        }
    }

    /// Fails the first `failures` checks.
    struct FlakyHealth {
        failures: usize,
        calls: AtomicUsize,
    }

    impl FlakyHealth {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HealthCheck for FlakyHealth {
        async fn check(&self) -> std::result::Result<(), String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err("connection refused".into())
            } else {
                Ok(())
            }
        }
    }

    fn spec() -> ServiceSpec {
        ServiceSpec::new(
            "dashboard",
            "python dashboard/app.py",
            r"dashboard/app\.py",
            "curl -sf http://localhost:8050/",
        )
        .with_grace(Duration::ZERO)
        .with_backoff(BackoffPolicy::None)
    }

    #[tokio::test]
    async fn existing_instance_is_not_relaunched() {
        let host = Arc::new(FakeHost::new(Some(77)));
        let supervisor = ServiceSupervisor::new(host.clone());
        let health = FlakyHealth::new(0);

        let outcome = supervisor
            .ensure_running(&spec(), &health, Path::new("/tmp/unused.log"))
            .await;

        assert_eq!(outcome, ServiceOutcome::AlreadyRunning { pid: 77 });
        assert!(host.launches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn absent_instance_is_launched_once() {
        let host = Arc::new(FakeHost::new(None));
        let supervisor = ServiceSupervisor::new(host.clone());
        let health = FlakyHealth::new(1);

        let outcome = supervisor
            .ensure_running(&spec(), &health, Path::new("/tmp/unused.log"))
            .await;

        assert_eq!(outcome, ServiceOutcome::Started { pid: 4242 });
        assert_eq!(host.launches.lock().unwrap().len(), 1);
        assert_eq!(health.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn health_retry_is_bounded() {
        let supervisor = ServiceSupervisor::new(Arc::new(FakeHost::new(None)));
        let health = FlakyHealth::new(usize::MAX);

        let outcome = supervisor
            .ensure_running(&spec(), &health, Path::new("/tmp/unused.log"))
            .await;

        assert_eq!(
            outcome,
            ServiceOutcome::Unhealthy {
                launched: true,
                attempts: 3,
                last_error: "connection refused".into(),
            }
        );
        assert_eq!(health.calls.load(Ordering::SeqCst), 3);
        assert!(outcome.warning("dashboard").unwrap().contains("3 attempt(s)"));
    }

    #[tokio::test]
    async fn launch_error_is_reported() {
        let mut host = FakeHost::new(None);
        host.launch_error = true;
        let supervisor = ServiceSupervisor::new(Arc::new(host));
        let health = FlakyHealth::new(0);

        let outcome = supervisor
            .ensure_running(&spec(), &health, Path::new("/tmp/unused.log"))
            .await;

        assert!(matches!(outcome, ServiceOutcome::LaunchFailed(ref m) if m.contains("no such file")));
        assert_eq!(health.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_pattern_is_launch_failure() {
        let supervisor = ServiceSupervisor::new(Arc::new(FakeHost::new(None)));
        let mut bad = spec();
        bad.match_pattern = "(".into();

        let outcome = supervisor
            .ensure_running(&bad, &FlakyHealth::new(0), Path::new("/tmp/unused.log"))
            .await;
        assert!(matches!(outcome, ServiceOutcome::LaunchFailed(_)));
    }

    #[test]
    fn process_table_matching_skips_own_pid() {
        let table = "    1 /sbin/init\n  200 python dashboard/app.py\n  300 python dashboard/app.py --debug\n";
        let pattern = Regex::new(r"dashboard/app\.py").unwrap();

        assert_eq!(find_in_process_table(table, &pattern, 1), Some(200));
        assert_eq!(find_in_process_table(table, &pattern, 200), Some(300));
        let none = Regex::new("nginx").unwrap();
        assert_eq!(find_in_process_table(table, &none, 1), None);
    }

    #[tokio::test]
    async fn dry_run_host_logs_instead_of_launching() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs/service-dashboard.log");
        let host = DryRunServiceHost;

        let pid = host.launch_detached(&spec(), &log).await.unwrap();

        assert_eq!(pid, 0);
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("dry run, not launched"));
    }
}
