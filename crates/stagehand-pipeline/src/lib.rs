//! Stage sequencing engine, post-action hooks, and failure notification.
//!
//! This crate implements the stagehand orchestrator: the stage/step model,
//! the per-stage runner and its PASS / FAIL / FAIL_SOFT classification, the
//! run state machine with its global deadline, post-action dispatch,
//! background service supervision, run records and retention.

pub mod engine;
pub mod events;
pub mod hooks;
pub mod layout;
pub mod metrics;
pub mod notify;
pub mod retention;
pub mod retry;
pub mod run;
pub mod run_record;
pub mod service;
pub mod stage;
pub mod stage_runner;

pub use engine::{
    validate_stages, PipelineOrchestrator, DEFAULT_GLOBAL_TIMEOUT, DEFAULT_KEEP_RUNS,
};
pub use events::{EventEmitter, RunEvent};
pub use hooks::{
    ArchiveHook, DispatchReport, FnHook, Hook, HookInvocation, HookPhase, HookSet,
    PostActionDispatcher,
};
pub use layout::{slugify, RunLayout};
pub use metrics::{parse_record_count, MetricsRecord, MetricsSpec};
pub use notify::{
    EmailMessage, LogNotifier, NotificationEvent, NotificationService, Notifier, SendmailNotifier,
};
pub use retention::{latest_build, list_builds, next_build_number, prune_runs};
pub use retry::{retry_with_backoff, BackoffPolicy};
pub use run::{classify, FailureCause, Run, RunClock, RunFailure};
pub use run_record::{load_run, save_run};
pub use service::{
    CommandHealthCheck, DryRunServiceHost, HealthCheck, LocalServiceHost, ServiceHost,
    ServiceOutcome, ServiceSpec, ServiceSupervisor,
};
pub use stage::{Stage, Step, StepKind, DEFAULT_STEP_TIMEOUT};
pub use stage_runner::StageRunner;
