use std::sync::Mutex;

use async_trait::async_trait;
use stagehand_types::ExecutionResult;

use crate::runner::{append_to_log, Invocation, ProcessRunner};

/// Records commands instead of running them. Every invocation succeeds.
#[derive(Default)]
pub struct DryRunRunner {
    commands: Mutex<Vec<String>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands seen so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProcessRunner for DryRunRunner {
    async fn run(&self, invocation: &Invocation) -> ExecutionResult {
        tracing::info!(step = %invocation.label, command = %invocation.command, "Dry run, skipping command execution");
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(invocation.command.clone());
        }
        let line = format!(
            "==> {}: {}\n<== {}: dry run, not executed\n",
            invocation.label, invocation.command, invocation.label
        );
        if let Err(e) = append_to_log(&invocation.log_path, &line).await {
            tracing::warn!(error = %e, log = %invocation.log_path.display(), "Could not write step log");
        }
        ExecutionResult::exited(0, 0, &invocation.log_path)
    }
}
