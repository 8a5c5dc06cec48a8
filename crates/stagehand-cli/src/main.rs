//! CLI binary for running the staged ETL and dashboard pipeline.

mod etl;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use stagehand_exec::{ArtifactArchiver, DryRunRunner, LocalProcessRunner, ProcessRunner};
use stagehand_pipeline::{
    latest_build, load_run, next_build_number, prune_runs, ArchiveHook, DryRunServiceHost, FnHook,
    HookSet, DEFAULT_GLOBAL_TIMEOUT, DEFAULT_KEEP_RUNS, LocalServiceHost, LogNotifier, NotificationService, Notifier, PipelineOrchestrator,
    Run, RunLayout, SendmailNotifier, ServiceHost, StepKind,
};
use stagehand_types::{EnvironmentContext, RunIdentity, RunStatus, StageStatus};
use tracing_subscriber::EnvFilter;

const DEFAULT_RUNS_ROOT: &str = ".stagehand/runs";
const DEFAULT_TIMEOUT_MINS: u64 = DEFAULT_GLOBAL_TIMEOUT.as_secs() / 60;
/// One week.
const MAX_TIMEOUT_MINS: u64 = 7 * 24 * 60;

#[derive(Parser)]
#[command(name = "stagehand", version, about = "Staged build/deploy/visualize runner for the ETL dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Workspace the stages run in
    #[arg(short, long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Where run logs, artifacts and records are kept (relative to the workspace)
    #[arg(long, global = true, default_value = DEFAULT_RUNS_ROOT)]
    runs_root: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage once
    Run {
        /// Global timeout in minutes
        #[arg(
            long,
            default_value_t = DEFAULT_TIMEOUT_MINS,
            value_parser = clap::value_parser!(u64).range(1..=MAX_TIMEOUT_MINS)
        )]
        timeout_mins: u64,

        /// Number of runs to retain
        #[arg(long, default_value_t = DEFAULT_KEEP_RUNS)]
        keep: usize,

        /// Build number (default: $BUILD_NUMBER, else one past the latest run)
        #[arg(long)]
        build: Option<u64>,

        /// Log commands instead of executing them
        #[arg(long)]
        dry_run: bool,
    },

    /// List the stages in execution order
    Stages,

    /// Show the record of a finished run
    Status {
        /// Build number (default: latest)
        build: Option<u64>,
    },

    /// Delete all but the most recent runs
    Prune {
        #[arg(long, default_value_t = DEFAULT_KEEP_RUNS)]
        keep: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let workspace = std::fs::canonicalize(&cli.workspace)?;
    let runs_root = if cli.runs_root.is_absolute() {
        cli.runs_root.clone()
    } else {
        workspace.join(&cli.runs_root)
    };

    match cli.command {
        Commands::Run {
            timeout_mins,
            keep,
            build,
            dry_run,
        } => {
            let status = cmd_run(
                &workspace,
                &runs_root,
                Duration::from_secs(timeout_mins.saturating_mul(60)),
                keep,
                build,
                dry_run,
            )
            .await?;
            std::process::exit(exit_code(status));
        }
        Commands::Stages => cmd_stages(),
        Commands::Status { build } => cmd_status(&runs_root, build).await?,
        Commands::Prune { keep } => {
            let removed = prune_runs(&runs_root, keep).await?;
            println!("Removed {} run(s): {:?}", removed.len(), removed);
        }
    }

    Ok(())
}

fn exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Success => 0,
        RunStatus::Unstable => 2,
        RunStatus::Failure | RunStatus::Pending => 1,
    }
}

/// `--build`, else `$BUILD_NUMBER`, else one past the latest retained run.
async fn resolve_build_number(runs_root: &Path, explicit: Option<u64>) -> anyhow::Result<u64> {
    if let Some(build) = explicit {
        return Ok(build);
    }
    if let Some(build) = std::env::var("BUILD_NUMBER")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Ok(build);
    }
    Ok(next_build_number(runs_root).await?)
}

async fn cmd_run(
    workspace: &Path,
    runs_root: &Path,
    timeout: Duration,
    keep: usize,
    build: Option<u64>,
    dry_run: bool,
) -> anyhow::Result<RunStatus> {
    let build_number = resolve_build_number(runs_root, build).await?;
    let identity = RunIdentity {
        build_number,
        workspace: workspace.to_path_buf(),
    };

    let context = match EnvironmentContext::from_env(identity) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            tracing::error!(error = %e, "❌ Configuration could not be resolved, no stage was started");
            return Ok(RunStatus::Failure);
        }
    };

    let layout = RunLayout::new(runs_root, build_number);
    println!("Running {} #{}", context.job_name(), build_number);
    println!("Workspace: {}", workspace.display());
    println!("Logs: {}", layout.logs_dir().display());
    if dry_run {
        println!("(dry run mode -- commands are logged, not executed)");
    }

    let runner: Arc<dyn ProcessRunner> = if dry_run {
        Arc::new(DryRunRunner::new())
    } else {
        Arc::new(LocalProcessRunner::new(context.clone()))
    };
    let host: Arc<dyn ServiceHost> = if dry_run {
        Arc::new(DryRunServiceHost)
    } else {
        Arc::new(LocalServiceHost::new(context.clone()))
    };
    let notifier: Arc<dyn Notifier> = if dry_run {
        Arc::new(LogNotifier)
    } else {
        Arc::new(SendmailNotifier::new())
    };

    let sweep = ArtifactArchiver::new(workspace, layout.run_artifacts_dir()).exclude(runs_root);
    let hooks = HookSet::new()
        .always(ArchiveHook::new(
            "workspace",
            sweep,
            etl::SWEEP_PATTERNS.iter().map(|p| p.to_string()).collect(),
        ))
        .success(FnHook::new("announce success", |run| {
            println!("\n✅ Pipeline succeeded (build #{})", run.build_number());
            Ok(())
        }))
        .unstable(FnHook::new("announce unstable", |run| {
            println!(
                "\n⚠️ Pipeline unstable (build #{}): a non-fatal stage failed",
                run.build_number()
            );
            Ok(())
        }))
        .failure(FnHook::new("announce failure", |run| {
            println!(
                "\n❌ Pipeline failed (build #{}) in stage {}",
                run.build_number(),
                run.failing_stage().unwrap_or("unknown")
            );
            Ok(())
        }))
        .failure(NotificationService::new(notifier, context.clone()));

    let run = PipelineOrchestrator::new(context, runner, layout)
        .with_stages(etl::stages())
        .with_timeout(timeout)
        .with_hooks(hooks)
        .with_service_host(host)
        .with_retention(keep)
        .run()
        .await?;

    print_summary(&run);
    Ok(run.status())
}

fn cmd_stages() {
    for (i, stage) in etl::stages().iter().enumerate() {
        let policy = if stage.non_fatal { " (non-fatal)" } else { "" };
        println!("{}. {}{}", i + 1, stage.name, policy);
        for step in &stage.steps {
            let what = match &step.kind {
                StepKind::Command(command) => command.clone(),
                StepKind::Service(spec) => format!("ensure service: {}", spec.command),
                StepKind::Metrics(spec) => format!("metrics from: {}", spec.count_command),
            };
            let suffix = if step.best_effort { " || true" } else { "" };
            println!("     - {}: {}{}", step.name, what, suffix);
        }
        if !stage.archive.is_empty() {
            println!("     archive: {}", stage.archive.join(", "));
        }
    }
}

async fn cmd_status(runs_root: &Path, build: Option<u64>) -> anyhow::Result<()> {
    let build = match build {
        Some(b) => b,
        None => match latest_build(runs_root).await? {
            Some(b) => b,
            None => {
                println!("No runs recorded under {}", runs_root.display());
                return Ok(());
            }
        },
    };
    match load_run(runs_root, build).await? {
        Some(run) => print_summary(&run),
        None => println!("Run #{} has no record", build),
    }
    Ok(())
}

fn print_summary(run: &Run) {
    println!("\n{} #{}: {}", run.job_name(), run.build_number(), run.status());
    println!(
        "Started: {}",
        run.started_at().format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(ms) = run.duration_ms() {
        println!("Duration: {:.1}s", ms as f64 / 1000.0);
    }
    for result in run.results() {
        let marker = match result.status {
            StageStatus::Pass => "✅",
            StageStatus::FailSoft => "⚠️",
            StageStatus::Fail => "❌",
        };
        println!(
            "  {} {:<22} {:>9} {:>8}ms",
            marker, result.stage, result.status, result.duration_ms
        );
        if let Some(error) = &result.error {
            println!("       {}", error);
        }
        for warning in &result.warnings {
            println!("       warning: {}", warning);
        }
    }
    for stage in run.skipped() {
        println!("  ⏭ {:<22} {:>9}", stage, "SKIPPED");
    }
    if let Some(failure) = run.failure() {
        println!("Failure: {} ({:?})", failure.stage, failure.cause);
    }
}
