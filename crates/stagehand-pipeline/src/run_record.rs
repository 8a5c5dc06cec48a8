//! Persistence of finished runs.
//!
//! The orchestrator writes each terminal [`Run`] to `<run_dir>/run.json`;
//! `stagehand status` reads it back.

use std::path::{Path, PathBuf};

use stagehand_types::Result;

use crate::layout::RunLayout;
use crate::run::Run;

/// Save `run` as pretty JSON to the layout's record path.
pub async fn save_run(run: &Run, layout: &RunLayout) -> Result<PathBuf> {
    tokio::fs::create_dir_all(layout.run_dir()).await?;
    let path = layout.record_path();
    let json = serde_json::to_string_pretty(run)?;
    tokio::fs::write(&path, json).await?;
    tracing::debug!(path = %path.display(), "Run record saved");
    Ok(path)
}

/// Load the record of `build`. Returns `Ok(None)` when the run has no record.
pub async fn load_run(runs_root: &Path, build: u64) -> Result<Option<Run>> {
    let path = RunLayout::new(runs_root, build).record_path();
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(&path).await?;
    Ok(Some(serde_json::from_str(&json)?))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
