use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stagehand_types::{EnvironmentContext, ExecutionResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::runner::{open_log, Invocation, ProcessRunner};
use crate::truncation::{keep_tail, truncate_output};

const MAX_CAPTURE_BYTES: usize = 64 * 1024;
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);
/// How long to keep draining pipes after the child exits. Detached
/// grandchildren may hold them open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Step log shared by the stdout and stderr pumps.
struct StepLog {
    file: Mutex<tokio::fs::File>,
    path: PathBuf,
    write_failed: AtomicBool,
}

impl StepLog {
    fn new(file: tokio::fs::File, path: impl Into<PathBuf>) -> Self {
        Self {
            file: Mutex::new(file),
            path: path.into(),
            write_failed: AtomicBool::new(false),
        }
    }
}

type SharedLog = Arc<StepLog>;

/// Runs commands through a local shell with the run's [`EnvironmentContext`]
/// as their environment and the workspace as their working directory.
pub struct LocalProcessRunner {
    context: Arc<EnvironmentContext>,
    shell: String,
    kill_grace: Duration,
}

impl LocalProcessRunner {
    pub fn new(context: Arc<EnvironmentContext>) -> Self {
        Self {
            context,
            shell: "bash".to_string(),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Inherited environment with secrets stripped. Run credentials are
    /// added back explicitly from the context.
    pub fn filtered_env() -> HashMap<String, String> {
        let exclude_suffixes: &[&str] = &[
            "_api_key",
            "_secret",
            "_token",
            "_password",
            "_credential",
        ];
        let always_include: &[&str] = &[
            "PATH", "HOME", "USER", "SHELL", "LANG", "TERM", "TMPDIR",
        ];

        let mut result = HashMap::new();
        for (key, value) in std::env::vars() {
            let lower = key.to_lowercase();
            if always_include.contains(&key.as_str())
                || !exclude_suffixes.iter().any(|s| lower.ends_with(s))
            {
                result.insert(key, value);
            }
        }
        result
    }

    /// SIGTERM the process group, then SIGKILL after the grace period.
    async fn terminate(&self, child: &mut tokio::process::Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGTERM);
                }
                tokio::select! {
                    _ = child.wait() => {}
                    _ = tokio::time::sleep(self.kill_grace) => {
                        unsafe {
                            libc::kill(-(pid as i32), libc::SIGKILL);
                        }
                        let _ = child.kill().await;
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.kill().await;
        }
    }
}

#[async_trait]
impl ProcessRunner for LocalProcessRunner {
    async fn run(&self, invocation: &Invocation) -> ExecutionResult {
        let start = Instant::now();
        let elapsed_ms = || start.elapsed().as_millis() as u64;

        let log: SharedLog = match open_log(&invocation.log_path).await {
            Ok(file) => Arc::new(StepLog::new(file, &invocation.log_path)),
            Err(e) => {
                return ExecutionResult::start_error(
                    format!("cannot open log {}: {}", invocation.log_path.display(), e),
                    elapsed_ms(),
                    &invocation.log_path,
                );
            }
        };
        write_line(
            &log,
            &format!("==> {}: {}", invocation.label, invocation.command),
        )
        .await;

        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.args(["-c", &invocation.command])
            .current_dir(self.context.workspace())
            .env_clear()
            .envs(Self::filtered_env())
            .envs(self.context.process_env())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        // Own process group so a timeout can take down the whole tree
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to start '{}': {}", self.shell, e);
                write_line(&log, &format!("<== {}: {}", invocation.label, message)).await;
                tracing::warn!(step = %invocation.label, error = %e, "Command could not start");
                return ExecutionResult::start_error(message, elapsed_ms(), &invocation.log_path);
            }
        };

        let stdout_pump = child
            .stdout
            .take()
            .map(|s| tokio::spawn(pump(s, log.clone(), "", MAX_CAPTURE_BYTES)));
        let stderr_pump = child
            .stderr
            .take()
            .map(|s| tokio::spawn(pump(s, log.clone(), "[stderr] ", MAX_CAPTURE_BYTES)));

        let waited = tokio::time::timeout(invocation.timeout, child.wait()).await;
        let result = match waited {
            Ok(Ok(status)) => {
                ExecutionResult::exited(status.code().unwrap_or(-1), 0, &invocation.log_path)
            }
            Ok(Err(e)) => ExecutionResult::start_error(
                format!("failed waiting for command: {}", e),
                0,
                &invocation.log_path,
            ),
            Err(_) => {
                tracing::warn!(
                    step = %invocation.label,
                    timeout_ms = invocation.timeout.as_millis() as u64,
                    "Command timed out, terminating"
                );
                self.terminate(&mut child).await;
                ExecutionResult::timed_out(
                    invocation.timeout.as_millis() as u64,
                    0,
                    &invocation.log_path,
                )
            }
        };

        let stdout = drain(stdout_pump).await;
        let stderr = drain(stderr_pump).await;
        let duration_ms = elapsed_ms();

        let footer = match result.failure_summary() {
            Some(summary) => format!("<== {}: {} ({}ms)", invocation.label, summary, duration_ms),
            None => format!("<== {}: ok ({}ms)", invocation.label, duration_ms),
        };
        write_line(&log, &footer).await;

        tracing::debug!(
            step = %invocation.label,
            exit_code = ?result.exit_code,
            duration_ms,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Command finished"
        );

        ExecutionResult {
            duration_ms,
            ..result
        }
        .with_output(
            truncate_output(&stdout, MAX_CAPTURE_BYTES),
            truncate_output(&stderr, MAX_CAPTURE_BYTES),
        )
    }
}

/// Write one line to the shared log and flush it so it survives a later kill.
///
/// The first failed write is logged; later ones are dropped quietly.
async fn write_line(log: &StepLog, line: &str) {
    let mut file = log.file.lock().await;
    let written = match file.write_all(format!("{}\n", line).as_bytes()).await {
        Ok(()) => file.flush().await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        if !log.write_failed.swap(true, Ordering::Relaxed) {
            tracing::warn!(log = %log.path.display(), error = %e, "Could not write step log, further output is lost");
        }
    }
}

/// Copy a child stream into the log line by line, returning the tail of
/// what was read. The full output only ever lives in the log file.
async fn pump<R>(stream: R, log: SharedLog, prefix: &'static str, max_bytes: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut captured = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']);
                write_line(&log, &format!("{}{}", prefix, line)).await;
                captured.push_str(line);
                captured.push('\n');
                if captured.len() > max_bytes * 2 {
                    keep_tail(&mut captured, max_bytes);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Stopped reading child output");
                break;
            }
        }
    }
    captured
}

async fn drain(pump: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = pump else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "Output reader task failed");
            String::new()
        }
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_types::{FailureKind, RunIdentity};
    use std::path::Path;
    use tempfile::TempDir;

    fn make_runner(dir: &TempDir) -> LocalProcessRunner {
        let env = HashMap::from([
            ("DB_HOST", "localhost"),
            ("DB_PORT", "5432"),
            ("DB_NAME", "warehouse"),
            ("DB_USER", "etl"),
            ("DB_PASSWORD", "pw"),
            ("NOTIFY_EMAIL", "ops@example.com"),
            ("PYTHON", "python3"),
        ]);
        let ctx = EnvironmentContext::resolve(
            |k| env.get(k).map(|v| v.to_string()),
            RunIdentity {
                build_number: 5,
                workspace: dir.path().to_path_buf(),
            },
        )
        .unwrap();
        LocalProcessRunner::new(Arc::new(ctx)).with_kill_grace(Duration::from_millis(200))
    }

    fn invocation(dir: &Path, command: &str, timeout_ms: u64) -> Invocation {
        Invocation::new(
            "step",
            command,
            Duration::from_millis(timeout_ms),
            dir.join("logs/stage.log"),
        )
    }

    #[tokio::test]
    async fn run_echo_succeeds_and_logs() {
        let dir = TempDir::new().unwrap();
        let runner = make_runner(&dir);

        let result = runner.run(&invocation(dir.path(), "echo hello", 5000)).await;
        assert!(result.succeeded());
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.trim(), "hello");

        let log = std::fs::read_to_string(dir.path().join("logs/stage.log")).unwrap();
        assert!(log.contains("==> step: echo hello"));
        assert!(log.contains("hello"));
        assert!(log.contains("<== step: ok"));
    }

    #[tokio::test]
    async fn run_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let runner = make_runner(&dir);

        let result = runner
            .run(&invocation(dir.path(), "echo oops >&2; exit 3", 5000))
            .await;
        assert_eq!(result.failure, Some(FailureKind::NonzeroExit));
        assert_eq!(result.exit_code, Some(3));
        assert!(result.stderr.contains("oops"));

        let log = std::fs::read_to_string(dir.path().join("logs/stage.log")).unwrap();
        assert!(log.contains("[stderr] oops"));
    }

    #[tokio::test]
    async fn run_timeout_keeps_partial_output() {
        let dir = TempDir::new().unwrap();
        let runner = make_runner(&dir);

        let result = runner
            .run(&invocation(dir.path(), "echo started; sleep 60", 300))
            .await;
        assert_eq!(result.failure, Some(FailureKind::Timeout));
        assert!(result.duration_ms >= 300);

        let log = std::fs::read_to_string(dir.path().join("logs/stage.log")).unwrap();
        assert!(log.contains("started"));
        assert!(log.contains("TIMEOUT"));
    }

    #[tokio::test]
    async fn missing_shell_is_start_error() {
        let dir = TempDir::new().unwrap();
        let runner = make_runner(&dir).with_shell("/nonexistent/shell");

        let result = runner.run(&invocation(dir.path(), "true", 1000)).await;
        assert_eq!(result.failure, Some(FailureKind::StartError));
        assert!(result.exit_code.is_none());
    }

    #[tokio::test]
    async fn pump_keeps_a_bounded_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pump.log");
        let file = open_log(&path).await.unwrap();
        let log = Arc::new(StepLog::new(file, &path));

        let output: String = (0..2000).map(|i| format!("row {:05}\n", i)).collect();
        let captured = pump(output.as_bytes(), log, "", 1024).await;

        assert!(captured.len() <= 2 * 1024);
        assert!(captured.ends_with("row 01999\n"));
        let logged = std::fs::read_to_string(&path).unwrap();
        assert_eq!(logged, output);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn failed_log_write_is_flagged_once() {
        let path = Path::new("/dev/full");
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .unwrap();
        let log = StepLog::new(file, path);

        write_line(&log, "first").await;
        assert!(log.write_failed.load(Ordering::Relaxed));
        write_line(&log, "second").await;
        assert!(log.write_failed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn commands_inherit_context_and_workspace() {
        let dir = TempDir::new().unwrap();
        let runner = make_runner(&dir);

        let result = runner
            .run(&invocation(
                dir.path(),
                "echo \"$BUILD_NUMBER $DB_NAME\"; pwd",
                5000,
            ))
            .await;
        assert!(result.succeeded());
        let mut lines = result.stdout.lines();
        assert_eq!(lines.next(), Some("5 warehouse"));
        let pwd = std::fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(pwd, std::fs::canonicalize(dir.path()).unwrap());
    }
}
