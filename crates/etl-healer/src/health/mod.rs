//! Health assessment and the monitoring daemon.

pub(crate) mod checks;
pub mod daemon;

pub use checks::{SysinfoResources, SystemResources};
pub use daemon::MonitorDaemon;

use chrono::{DateTime, Utc};
use etl_config::{HealthConfig, ThresholdConfig};
use notify::Severity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::store::StateStore;

/// Outcome of a single check or of a whole assessment. Ordered by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::Healthy => Severity::Info,
            Self::Warning => Severity::Warning,
            Self::Critical => Severity::Critical,
        }
    }

    /// Grade a metric where larger values are worse.
    #[must_use]
    pub fn grade_high(value: f64, threshold: &ThresholdConfig) -> Self {
        if value >= threshold.critical {
            Self::Critical
        } else if value >= threshold.warning {
            Self::Warning
        } else {
            Self::Healthy
        }
    }

    /// Grade a metric where smaller values are worse.
    #[must_use]
    pub fn grade_low(value: f64, threshold: &ThresholdConfig) -> Self {
        if value <= threshold.critical {
            Self::Critical
        } else if value <= threshold.warning {
            Self::Warning
        } else {
            Self::Healthy
        }
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown health status: {other}")),
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one named check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl CheckResult {
    pub(crate) fn new(name: &str, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            metrics: BTreeMap::new(),
        }
    }

    pub(crate) fn metric(mut self, key: &str, value: f64) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }
}

/// A complete assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub overall: HealthStatus,
    pub checks: Vec<CheckResult>,
    pub recommendations: Vec<String>,
}

impl HealthReport {
    /// Overall status is the worst check.
    #[must_use]
    pub fn from_checks(checked_at: DateTime<Utc>, checks: Vec<CheckResult>) -> Self {
        let overall = checks.iter().map(|c| c.status).max().unwrap_or_default();
        let recommendations = checks
            .iter()
            .filter(|c| c.status != HealthStatus::Healthy)
            .map(recommendation)
            .collect();
        Self {
            checked_at,
            overall,
            checks,
            recommendations,
        }
    }

    /// Non-healthy checks, worst first.
    #[must_use]
    pub fn problems(&self) -> Vec<&CheckResult> {
        let mut problems: Vec<_> = self
            .checks
            .iter()
            .filter(|c| c.status != HealthStatus::Healthy)
            .collect();
        problems.sort_by(|a, b| b.status.cmp(&a.status));
        problems
    }

    /// Plain-text summary used as an alert body.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = format!("Overall status: {}\n", self.overall.as_str().to_uppercase());
        for check in &self.checks {
            out.push_str(&format!("- {} [{}]: {}\n", check.name, check.status, check.message));
        }
        if !self.recommendations.is_empty() {
            out.push_str("\nRecommendations:\n");
            for rec in &self.recommendations {
                out.push_str(&format!("- {rec}\n"));
            }
        }
        out
    }
}

fn recommendation(check: &CheckResult) -> String {
    let action = match check.name.as_str() {
        checks::DATABASE => "verify the state database is reachable and its schema is complete",
        checks::DATA_FRESHNESS => "start a run with `etl-scheduler --manual` and inspect recent failures",
        checks::PERFORMANCE => "investigate slow runs or memory growth in the pipeline",
        checks::ERROR_RATE => "review failures with `etl-recovery status`",
        checks::SYSTEM_RESOURCES => "free disk space with `etl-recovery cleanup` or reduce memory pressure",
        _ => "investigate",
    };
    format!("{}: {} ({})", check.name, action, check.message)
}

/// Runs the five health checks against the state store and host resources.
#[derive(Clone)]
pub struct HealthChecker {
    store: StateStore,
    config: HealthConfig,
    resources: Arc<dyn SystemResources>,
    data_dir: PathBuf,
}

impl HealthChecker {
    #[must_use]
    pub fn new(
        store: StateStore,
        config: HealthConfig,
        resources: Arc<dyn SystemResources>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            config,
            resources,
            data_dir: data_dir.into(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn assess(&self) -> HealthReport {
        self.assess_at(Utc::now())
    }

    /// Run every check. A failing check is reported as critical, never raised.
    pub fn assess_at(&self, now: DateTime<Utc>) -> HealthReport {
        let checks = vec![
            checks::database(&self.store, &self.config),
            checks::data_freshness(&self.store, &self.config, now),
            checks::performance(&self.store, &self.config, now),
            checks::error_rate(&self.store, &self.config, now),
            checks::system_resources(self.resources.as_ref(), &self.config, &self.data_dir),
        ];
        HealthReport::from_checks(now, checks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grading_in_both_directions() {
        let latency = ThresholdConfig::new(500.0, 2000.0);
        assert_eq!(HealthStatus::grade_high(100.0, &latency), HealthStatus::Healthy);
        assert_eq!(HealthStatus::grade_high(500.0, &latency), HealthStatus::Warning);
        assert_eq!(HealthStatus::grade_high(2500.0, &latency), HealthStatus::Critical);

        let disk = ThresholdConfig::new(20.0, 10.0);
        assert_eq!(HealthStatus::grade_low(50.0, &disk), HealthStatus::Healthy);
        assert_eq!(HealthStatus::grade_low(15.0, &disk), HealthStatus::Warning);
        assert_eq!(HealthStatus::grade_low(5.0, &disk), HealthStatus::Critical);
    }

    #[test]
    fn test_overall_is_worst_and_recommendations_per_problem() {
        let report = HealthReport::from_checks(
            Utc::now(),
            vec![
                CheckResult::new(checks::DATABASE, HealthStatus::Healthy, "ok"),
                CheckResult::new(checks::ERROR_RATE, HealthStatus::Warning, "20% failed"),
                CheckResult::new(checks::DATA_FRESHNESS, HealthStatus::Critical, "no success"),
            ],
        );
        assert_eq!(report.overall, HealthStatus::Critical);
        assert_eq!(report.recommendations.len(), 2);
        assert_eq!(report.problems()[0].name, checks::DATA_FRESHNESS);
        assert!(report.summary().contains("Overall status: CRITICAL"));
    }

    #[test]
    fn test_empty_report_is_healthy() {
        let report = HealthReport::from_checks(Utc::now(), vec![]);
        assert_eq!(report.overall, HealthStatus::Healthy);
        assert!(report.recommendations.is_empty());
    }
}
