//! Stage catalogue for the ETL and dashboard workload.
//!
//! Every command runs in the workspace with the resolved configuration in
//! its environment, so `$PYTHON` and `$DB_*` expand in the shell.

use std::time::Duration;

use stagehand_pipeline::{MetricsSpec, ServiceSpec, Stage, Step};

/// Swept into the `workspace` artifact set after every run.
pub const SWEEP_PATTERNS: &[&str] = &[
    "logs/**",
    "data/processed/**",
    "reports/**",
    "dashboard/assets/**",
];

const RECORD_COUNT_QUERY: &str = "SELECT COUNT(*) FROM sales_data";
const DASHBOARD_URL: &str = "http://localhost:8050/";

pub fn stages() -> Vec<Stage> {
    vec![
        Stage::new("Setup")
            .step(Step::command(
                "create directories",
                "mkdir -p logs data/processed reports dashboard/assets",
            ))
            .step(Step::command("interpreter", "\"$PYTHON\" --version")),
        Stage::new("Install Dependencies")
            .step(
                Step::command("upgrade pip", "\"$PYTHON\" -m pip install --upgrade pip")
                    .best_effort(),
            )
            .step(
                Step::command(
                    "install requirements",
                    "\"$PYTHON\" -m pip install -r requirements.txt",
                )
                .with_timeout(Duration::from_secs(15 * 60)),
            ),
        Stage::new("Database Setup").step(Step::command(
            "create schema",
            "\"$PYTHON\" scripts/setup_database.py",
        )),
        Stage::new("Run ETL")
            .step(
                Step::command("etl", "\"$PYTHON\" etl/run_etl.py")
                    .with_timeout(Duration::from_secs(30 * 60)),
            )
            .archive(["logs/**", "data/processed/**"]),
        Stage::new("Validate Data")
            .non_fatal()
            .step(Step::command(
                "validate",
                "\"$PYTHON\" scripts/validate_data.py",
            ))
            .archive(["reports/**"]),
        Stage::new("Deploy").step(Step::metrics(
            "record metrics",
            MetricsSpec::new(format!(
                "psql -h \"$DB_HOST\" -p \"$DB_PORT\" -U \"$DB_USER\" -d \"$DB_NAME\" -tAc \"{}\"",
                RECORD_COUNT_QUERY
            )),
        )),
        Stage::new("Refresh Dashboard")
            .non_fatal()
            .step(Step::service(
                "dashboard",
                ServiceSpec::new(
                    "dashboard",
                    "\"$PYTHON\" dashboard/app.py",
                    r"dashboard/app\.py",
                    format!("curl -sf {}", DASHBOARD_URL),
                ),
            ))
            .archive(["dashboard/assets/**"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_pipeline::{validate_stages, StepKind};

    #[test]
    fn catalogue_order_and_policy() {
        let stages = stages();
        let names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Setup",
                "Install Dependencies",
                "Database Setup",
                "Run ETL",
                "Validate Data",
                "Deploy",
                "Refresh Dashboard",
            ]
        );
        let non_fatal: Vec<&str> = stages
            .iter()
            .filter(|s| s.non_fatal)
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(non_fatal, vec!["Validate Data", "Refresh Dashboard"]);
        assert!(validate_stages(&stages).is_ok());
    }

    #[test]
    fn deploy_and_dashboard_use_special_steps() {
        let stages = stages();
        let deploy = stages.iter().find(|s| s.name == "Deploy").unwrap();
        assert!(matches!(deploy.steps[0].kind, StepKind::Metrics(ref m) if m.count_command.contains("COUNT(*)")));

        let dashboard = stages.iter().find(|s| s.name == "Refresh Dashboard").unwrap();
        match &dashboard.steps[0].kind {
            StepKind::Service(spec) => {
                assert_eq!(spec.health_attempts, 3);
                assert!(spec.health_command.contains("8050"));
            }
            other => panic!("expected a service step, got {:?}", other),
        }
    }
}
