//! Plain-text deploy metrics record.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use stagehand_types::Result;

/// How the deploy stage obtains its record count.
#[derive(Debug, Clone)]
pub struct MetricsSpec {
    /// Command printing the record count of the data store on stdout.
    pub count_command: String,
    pub count_timeout: Duration,
}

impl MetricsSpec {
    pub fn new(count_command: impl Into<String>) -> Self {
        Self {
            count_command: count_command.into(),
            count_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsRecord {
    pub build_number: u64,
    pub elapsed_seconds: u64,
    pub record_count: u64,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl MetricsRecord {
    pub fn success(build_number: u64, elapsed: Duration, record_count: u64) -> Self {
        Self {
            build_number,
            elapsed_seconds: elapsed.as_secs(),
            record_count,
            status: "SUCCESS".into(),
            timestamp: Utc::now(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "build_number={}\nelapsed_seconds={}\nrecord_count={}\nstatus={}\ntimestamp={}\n",
            self.build_number,
            self.elapsed_seconds,
            self.record_count,
            self.status,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.render()).await?;
        tracing::info!(path = %path.display(), records = self.record_count, "Metrics record written");
        Ok(())
    }
}

/// First unsigned integer in the count command's output.
pub fn parse_record_count(stdout: &str) -> Option<u64> {
    let re = Regex::new(r"\d+").ok()?;
    re.find(stdout).and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_integer() {
        assert_eq!(parse_record_count("1532\n"), Some(1532));
        assert_eq!(parse_record_count("  count \n-------\n  98\n(1 row)"), Some(98));
        assert_eq!(parse_record_count("no rows"), None);
        assert_eq!(parse_record_count(""), None);
    }

    #[test]
    fn render_has_one_field_per_line() {
        let record = MetricsRecord::success(12, Duration::from_millis(95_400), 1532);
        let text = record.render();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "build_number=12");
        assert_eq!(lines[1], "elapsed_seconds=95");
        assert_eq!(lines[2], "record_count=1532");
        assert_eq!(lines[3], "status=SUCCESS");
        assert!(lines[4].starts_with("timestamp="));
        assert!(lines[4].ends_with('Z'));
    }

    #[tokio::test]
    async fn write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("12/metrics.txt");

        MetricsRecord::success(12, Duration::from_secs(3), 7)
            .write(&path)
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("record_count=7"));
    }
}
