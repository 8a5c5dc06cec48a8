use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use stagehand_types::ExecutionResult;
use tokio::io::AsyncWriteExt;

/// One external command invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Step name, used in log headers.
    pub label: String,
    pub command: String,
    pub timeout: Duration,
    /// Append-only log receiving stdout and stderr as they are produced.
    pub log_path: PathBuf,
}

impl Invocation {
    pub fn new(
        label: impl Into<String>,
        command: impl Into<String>,
        timeout: Duration,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
            timeout,
            log_path: log_path.into(),
        }
    }
}

/// Boundary to external work.
///
/// `run` never fails: a command that cannot start, times out, or exits
/// non-zero is reported through [`ExecutionResult::failure`].
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> ExecutionResult;
}

/// Open `path` for appending, creating parent directories as needed.
pub async fn open_log(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// Append `text` to the log at `path`.
pub async fn append_to_log(path: &Path, text: &str) -> std::io::Result<()> {
    let mut file = open_log(path).await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_creates_parents_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("7/logs/setup.log");

        append_to_log(&path, "first\n").await.unwrap();
        append_to_log(&path, "second\n").await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "first\nsecond\n");
    }
}
