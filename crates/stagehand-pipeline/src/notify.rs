//! Failure notification.
//!
//! A [`NotificationEvent`] is only ever composed for a run that ended in
//! `FAILURE`. Delivery is fire-and-forget: errors are logged and swallowed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use stagehand_types::{EnvironmentContext, PipelineError, Result, RunStatus};
use tokio::io::AsyncWriteExt;

use crate::hooks::Hook;
use crate::run::Run;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub job_name: String,
    pub build_number: u64,
    pub build_url: String,
    pub console_url: String,
    pub failing_stage: String,
    pub error: Option<String>,
    pub recipient: String,
}

impl NotificationEvent {
    /// Compose the event for a failed run; `None` for any other status.
    pub fn from_run(run: &Run, context: &EnvironmentContext) -> Option<Self> {
        if run.status() != RunStatus::Failure {
            return None;
        }
        let failing_stage = run.failing_stage().unwrap_or("unknown").to_string();
        let error = run
            .result_for(&failing_stage)
            .and_then(|r| r.error.clone());
        Some(Self {
            job_name: run.job_name().to_string(),
            build_number: run.build_number(),
            build_url: context.build_url().to_string(),
            console_url: context.console_url(),
            failing_stage,
            error,
            recipient: context.notify_recipient().to_string(),
        })
    }

    pub fn to_email(&self) -> EmailMessage {
        let mut body = format!(
            "Pipeline failed.\n\nJob: {}\nBuild: #{}\nBuild URL: {}\nFailed stage: {}\n",
            self.job_name, self.build_number, self.build_url, self.failing_stage
        );
        if let Some(error) = &self.error {
            body.push_str(&format!("Error: {}\n", error));
        }
        body.push_str(&format!("\nConsole output: {}\n", self.console_url));

        EmailMessage {
            to: self.recipient.clone(),
            subject: format!("Pipeline Failed: {} #{}", self.job_name, self.build_number),
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl EmailMessage {
    /// RFC 822 form accepted by `sendmail -t`.
    pub fn to_rfc822(&self) -> String {
        format!(
            "To: {}\nSubject: {}\nContent-Type: text/plain; charset=utf-8\n\n{}",
            self.to, self.subject, self.body
        )
    }
}

// ---------------------------------------------------------------------------
// Notifier — delivery channel
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Pipes the message into `sendmail -t`.
pub struct SendmailNotifier {
    program: String,
}

impl SendmailNotifier {
    pub fn new() -> Self {
        Self {
            program: "sendmail".into(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

impl Default for SendmailNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for SendmailNotifier {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        let mut child = tokio::process::Command::new(&self.program)
            .arg("-t")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| PipelineError::Notification(format!("{}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.to_rfc822().as_bytes())
                .await
                .map_err(|e| PipelineError::Notification(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| PipelineError::Notification(e.to_string()))?;
        if !output.status.success() {
            return Err(PipelineError::Notification(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Writes the message to the log instead of delivering it.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        tracing::info!(to = %message.to, subject = %message.subject, "Notification (not delivered)\n{}", message.body);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NotificationService
// ---------------------------------------------------------------------------

/// `failure` hook that sends one notification per run.
pub struct NotificationService {
    notifier: Arc<dyn Notifier>,
    context: Arc<EnvironmentContext>,
    sent: AtomicBool,
}

impl NotificationService {
    pub fn new(notifier: Arc<dyn Notifier>, context: Arc<EnvironmentContext>) -> Self {
        Self {
            notifier,
            context,
            sent: AtomicBool::new(false),
        }
    }

    /// Compose and deliver a notification for `run` if it failed. Never
    /// errors and never retries.
    pub async fn notify(&self, run: &Run) {
        let Some(event) = NotificationEvent::from_run(run, &self.context) else {
            tracing::debug!(build = run.build_number(), status = %run.status(), "No notification for this status");
            return;
        };
        if self.sent.swap(true, Ordering::SeqCst) {
            tracing::debug!(build = run.build_number(), "Notification already sent for this run");
            return;
        }

        let message = event.to_email();
        match self.notifier.send(&message).await {
            Ok(()) => tracing::info!(
                to = %message.to,
                stage = %event.failing_stage,
                "Failure notification sent"
            ),
            Err(e) => tracing::error!(to = %message.to, error = %e, "❌ Failure notification not delivered"),
        }
    }
}

#[async_trait]
impl Hook for NotificationService {
    fn name(&self) -> &str {
        "notify"
    }

    async fn run(&self, run: &Run) -> Result<()> {
        self.notify(run).await;
        Ok(())
    }
}
