//! On-disk layout of one run under the runs root.
//!
//! ```text
//! <runs_root>/<build>/logs/<stage>.log
//! <runs_root>/<build>/artifacts/stage/<stage>/...
//! <runs_root>/<build>/artifacts/run/<set>/...
//! <runs_root>/<build>/run.json
//! <runs_root>/<build>/metrics.txt
//! ```

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RunLayout {
    runs_root: PathBuf,
    build_number: u64,
}

impl RunLayout {
    pub fn new(runs_root: impl Into<PathBuf>, build_number: u64) -> Self {
        Self {
            runs_root: runs_root.into(),
            build_number,
        }
    }

    pub fn runs_root(&self) -> &Path {
        &self.runs_root
    }

    pub fn build_number(&self) -> u64 {
        self.build_number
    }

    pub fn run_dir(&self) -> PathBuf {
        self.runs_root.join(self.build_number.to_string())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.run_dir().join("logs")
    }

    pub fn stage_log(&self, stage_name: &str) -> PathBuf {
        self.logs_dir().join(format!("{}.log", slugify(stage_name)))
    }

    /// Output of a detached background service.
    pub fn service_log(&self, service_name: &str) -> PathBuf {
        self.logs_dir()
            .join(format!("service-{}.log", slugify(service_name)))
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.run_dir().join("artifacts")
    }

    /// Parent of the per-stage artifact sets, one directory per stage slug.
    pub fn stage_artifacts_dir(&self) -> PathBuf {
        self.artifacts_dir().join("stage")
    }

    /// Parent of the artifact sets captured by run-level hooks.
    pub fn run_artifacts_dir(&self) -> PathBuf {
        self.artifacts_dir().join("run")
    }

    pub fn record_path(&self) -> PathBuf {
        self.run_dir().join("run.json")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.run_dir().join("metrics.txt")
    }
}

/// Lowercase `name`, collapsing every run of non-alphanumerics into one `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("stage");
    }
    slug
}
