use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use stagehand_types::PipelineError;

/// Files captured into the retained artifact store under one name.
///
/// Empty sets are normal: archiving nothing is not an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub name: String,
    /// Where the files were copied to.
    pub destination: PathBuf,
    /// Archived files, relative to the source root, sorted.
    pub files: Vec<PathBuf>,
    /// Patterns or files that were skipped, with the reason.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ArtifactSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }
}

/// Copies files matching glob patterns from a source tree into a retained
/// artifact directory. Patterns are resolved when [`archive`](Self::archive)
/// is called, never earlier.
#[derive(Debug, Clone)]
pub struct ArtifactArchiver {
    source_root: PathBuf,
    dest_root: PathBuf,
    excluded: Vec<PathBuf>,
}

impl ArtifactArchiver {
    /// `dest_root` is excluded from matching so archives never capture themselves.
    pub fn new(source_root: impl Into<PathBuf>, dest_root: impl Into<PathBuf>) -> Self {
        let dest_root = dest_root.into();
        Self {
            source_root: source_root.into(),
            excluded: vec![dest_root.clone()],
            dest_root,
        }
    }

    /// Never descend into `path` while matching.
    pub fn exclude(mut self, path: impl Into<PathBuf>) -> Self {
        self.excluded.push(path.into());
        self
    }

    pub fn dest_root(&self) -> &Path {
        &self.dest_root
    }

    /// Archive every file under the source root matching any of `patterns`
    /// into `<dest_root>/<name>/`. Best-effort: bad patterns, unreadable
    /// directories and failed copies become warnings on the returned set.
    pub async fn archive(&self, name: &str, patterns: &[String]) -> ArtifactSet {
        let destination = self.dest_root.join(name);
        let mut set = ArtifactSet {
            name: name.to_string(),
            destination: destination.clone(),
            ..Default::default()
        };

        let (globs, mut warnings) = build_globset(patterns);
        set.warnings.append(&mut warnings);
        let Some(globs) = globs else {
            return set;
        };

        let mut matches = if tokio::fs::try_exists(&self.source_root).await.unwrap_or(false) {
            self.collect_matches(&globs, &mut set.warnings).await
        } else {
            Vec::new()
        };
        matches.sort();

        for rel in matches {
            let from = self.source_root.join(&rel);
            let to = destination.join(&rel);
            match copy_file(&from, &to).await {
                Ok(()) => set.files.push(rel),
                Err(e) => {
                    tracing::warn!(file = %from.display(), error = %e, "Could not archive file");
                    set.warnings.push(format!("{}: {}", rel.display(), e));
                }
            }
        }

        tracing::info!(artifacts = %name, files = set.files.len(), "Archived artifacts");
        set
    }

    /// Walk the source tree collecting files (relative to the source root)
    /// that match `set`.
    async fn collect_matches(&self, set: &GlobSet, warnings: &mut Vec<String>) -> Vec<PathBuf> {
        let mut matches = Vec::new();
        let mut pending = vec![self.source_root.clone()];
        while let Some(current) = pending.pop() {
            if self.excluded.iter().any(|ex| current.starts_with(ex)) {
                continue;
            }
            // symlink_metadata so link cycles are never followed
            let meta = match tokio::fs::symlink_metadata(&current).await {
                Ok(m) => m,
                Err(e) => {
                    warnings.push(format!("{}: {}", current.display(), e));
                    continue;
                }
            };
            if meta.is_file() {
                if let Ok(rel) = current.strip_prefix(&self.source_root) {
                    if set.is_match(rel) {
                        matches.push(rel.to_path_buf());
                    }
                }
            } else if meta.is_dir() {
                let mut read_dir = match tokio::fs::read_dir(&current).await {
                    Ok(rd) => rd,
                    Err(e) => {
                        warnings.push(format!("{}: {}", current.display(), e));
                        continue;
                    }
                };
                while let Ok(Some(entry)) = read_dir.next_entry().await {
                    pending.push(entry.path());
                }
            }
        }
        matches
    }
}

/// Compile `patterns`, skipping invalid ones. Returns `None` when nothing
/// usable remains.
fn build_globset(patterns: &[String]) -> (Option<GlobSet>, Vec<String>) {
    let mut warnings = Vec::new();
    let mut builder = GlobSetBuilder::new();
    let mut added = 0usize;
    for pattern in patterns {
        match GlobBuilder::new(pattern).literal_separator(true).build() {
            Ok(glob) => {
                builder.add(glob);
                added += 1;
            }
            Err(e) => {
                let err = PipelineError::Archive {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                };
                tracing::warn!(error = %err, "Skipping artifact pattern");
                warnings.push(err.to_string());
            }
        }
    }
    if added == 0 {
        return (None, warnings);
    }
    match builder.build() {
        Ok(set) => (Some(set), warnings),
        Err(e) => {
            warnings.push(e.to_string());
            (None, warnings)
        }
    }
}

async fn copy_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(from, to).await?;
    Ok(())
}
