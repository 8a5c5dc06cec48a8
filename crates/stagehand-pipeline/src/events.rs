//! Run event stream for observability.
//!
//! Emits [`RunEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (console reporters, tests) can follow a run without coupling to
//! the orchestrator internals.

use serde::{Deserialize, Serialize};
use stagehand_types::{RunStatus, StageStatus};

/// Events emitted while a run executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    RunStarted {
        job_name: String,
        build_number: u64,
        stage_count: usize,
    },
    StageStarted {
        stage: String,
        index: usize,
    },
    StageCompleted {
        stage: String,
        status: StageStatus,
        duration_ms: u64,
    },
    StageSkipped {
        stage: String,
    },
    RunFinished {
        build_number: u64,
        status: RunStatus,
        failing_stage: Option<String>,
        duration_ms: u64,
    },
    HookFailed {
        hook: String,
        error: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
