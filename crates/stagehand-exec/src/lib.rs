//! Process execution and artifact archiving for stagehand stages.
//!
//! Provides the `ProcessRunner` boundary, the `LocalProcessRunner` and
//! `DryRunRunner` implementations, and `ArtifactArchiver` for retaining
//! output directories between and after stages.

pub mod archive;
pub mod dry_run;
pub mod local;
pub mod runner;
pub mod truncation;

pub use archive::{ArtifactArchiver, ArtifactSet};
pub use dry_run::DryRunRunner;
pub use local::LocalProcessRunner;
pub use runner::{append_to_log, open_log, Invocation, ProcessRunner};
pub use truncation::{keep_tail, last_lines, truncate_output};
