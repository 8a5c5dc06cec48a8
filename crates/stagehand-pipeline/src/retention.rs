//! Build numbering and retention of past runs under the runs root.

use std::path::Path;

use stagehand_types::Result;

/// Build numbers of every retained run, ascending. Non-numeric entries are
/// ignored; a missing runs root has no builds.
pub async fn list_builds(runs_root: &Path) -> Result<Vec<u64>> {
    if !tokio::fs::try_exists(runs_root).await? {
        return Ok(Vec::new());
    }
    let mut builds = Vec::new();
    let mut entries = tokio::fs::read_dir(runs_root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) {
            builds.push(n);
        }
    }
    builds.sort_unstable();
    Ok(builds)
}

pub async fn latest_build(runs_root: &Path) -> Result<Option<u64>> {
    Ok(list_builds(runs_root).await?.last().copied())
}

/// One past the highest retained build, starting at 1.
pub async fn next_build_number(runs_root: &Path) -> Result<u64> {
    Ok(latest_build(runs_root).await?.map_or(1, |n| n + 1))
}

/// Delete all but the `keep` highest-numbered runs. Returns the removed
/// build numbers. Individual removal failures are logged and skipped.
pub async fn prune_runs(runs_root: &Path, keep: usize) -> Result<Vec<u64>> {
    let builds = list_builds(runs_root).await?;
    let excess = builds.len().saturating_sub(keep);
    let mut removed = Vec::with_capacity(excess);
    for build in builds.into_iter().take(excess) {
        let dir = runs_root.join(build.to_string());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(build, "Pruned run");
                removed.push(build);
            }
            Err(e) => {
                tracing::warn!(build, path = %dir.display(), error = %e, "Could not prune run");
            }
        }
    }
    if !removed.is_empty() {
        tracing::info!(removed = removed.len(), keep, "Pruned old runs");
    }
    Ok(removed)
}
