//! The individual health checks.

use chrono::{DateTime, Duration, Utc};
use etl_config::{HealthConfig, MAX_WINDOW_HOURS};
use std::path::{Path, PathBuf};
use sysinfo::{Disks, System};
use tracing::warn;

use super::{CheckResult, HealthStatus};
use crate::store::StateStore;
use crate::types::RunStatus;

pub const DATABASE: &str = "database";
pub const DATA_FRESHNESS: &str = "data_freshness";
pub const PERFORMANCE: &str = "performance";
pub const ERROR_RATE: &str = "error_rate";
pub const SYSTEM_RESOURCES: &str = "system_resources";

/// Trailing window for run statistics, capped so the subtraction cannot overflow.
fn window(config: &HealthConfig) -> Duration {
    Duration::hours(i64::try_from(config.window_hours.min(MAX_WINDOW_HOURS)).unwrap_or(i64::MAX))
}

/// Host resource readings.
pub trait SystemResources: Send + Sync {
    /// Free space on the filesystem holding `path`, in percent.
    fn disk_free_pct(&self, path: &Path) -> Option<f64>;

    /// Used physical memory, in percent.
    fn memory_used_pct(&self) -> Option<f64>;
}

/// [`SystemResources`] read through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoResources;

impl SystemResources for SysinfoResources {
    fn disk_free_pct(&self, path: &Path) -> Option<f64> {
        let path: PathBuf = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        // Longest mount point that prefixes the path.
        let disk = disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())?;
        let total = disk.total_space();
        if total == 0 {
            return None;
        }
        Some(disk.available_space() as f64 / total as f64 * 100.0)
    }

    fn memory_used_pct(&self) -> Option<f64> {
        let mut sys = System::new();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return None;
        }
        Some(sys.used_memory() as f64 / total as f64 * 100.0)
    }
}

pub(super) fn database(store: &StateStore, config: &HealthConfig) -> CheckResult {
    let latency = match store.ping() {
        Ok(latency) => latency,
        Err(e) => {
            warn!(error = %e, "Database ping failed");
            return CheckResult::new(DATABASE, HealthStatus::Critical, format!("database unreachable: {e}"));
        }
    };
    let latency_ms = latency.as_secs_f64() * 1000.0;

    match store.missing_tables() {
        Ok(missing) if !missing.is_empty() => {
            return CheckResult::new(
                DATABASE,
                HealthStatus::Critical,
                format!("missing tables: {}", missing.join(", ")),
            )
            .metric("latency_ms", latency_ms)
            .metric("missing_tables", missing.len() as f64);
        }
        Ok(_) => {}
        Err(e) => {
            return CheckResult::new(DATABASE, HealthStatus::Critical, format!("schema check failed: {e}"))
                .metric("latency_ms", latency_ms);
        }
    }

    let status = HealthStatus::grade_high(latency_ms, &config.db_latency_ms);
    CheckResult::new(DATABASE, status, format!("query latency {latency_ms:.1} ms"))
        .metric("latency_ms", latency_ms)
}

pub(super) fn data_freshness(store: &StateStore, config: &HealthConfig, now: DateTime<Utc>) -> CheckResult {
    let last = match store.last_successful_run() {
        Ok(last) => last,
        Err(e) => {
            return CheckResult::new(DATA_FRESHNESS, HealthStatus::Critical, format!("query failed: {e}"));
        }
    };
    let Some(completed_at) = last.and_then(|run| run.completed_at) else {
        return CheckResult::new(DATA_FRESHNESS, HealthStatus::Critical, "no successful run recorded");
    };

    let age_hours = (now - completed_at).num_seconds().max(0) as f64 / 3600.0;
    let status = HealthStatus::grade_high(age_hours, &config.freshness_hours);
    CheckResult::new(
        DATA_FRESHNESS,
        status,
        format!("last successful run {age_hours:.1} h ago"),
    )
    .metric("age_hours", age_hours)
}

pub(super) fn performance(store: &StateStore, config: &HealthConfig, now: DateTime<Utc>) -> CheckResult {
    let since = now - window(config);
    let runs = match store.runs_since(since) {
        Ok(runs) => runs,
        Err(e) => return CheckResult::new(PERFORMANCE, HealthStatus::Critical, format!("query failed: {e}")),
    };

    let durations: Vec<f64> = runs.iter().filter_map(|r| r.duration_secs).collect();
    if durations.is_empty() {
        return CheckResult::new(PERFORMANCE, HealthStatus::Healthy, "no completed runs in window")
            .metric("runs", 0.0);
    }
    let avg = durations.iter().sum::<f64>() / durations.len() as f64;
    let max = durations.iter().copied().fold(0.0_f64, f64::max);
    let peak_memory = runs.iter().filter_map(|r| r.memory_peak_mb).fold(0.0_f64, f64::max);

    let status = HealthStatus::grade_high(avg, &config.duration_secs)
        .max(HealthStatus::grade_high(peak_memory, &config.memory_mb));
    CheckResult::new(
        PERFORMANCE,
        status,
        format!("avg duration {avg:.0} s, max {max:.0} s, peak memory {peak_memory:.0} MB"),
    )
    .metric("runs", durations.len() as f64)
    .metric("avg_duration_secs", avg)
    .metric("max_duration_secs", max)
    .metric("peak_memory_mb", peak_memory)
}

pub(super) fn error_rate(store: &StateStore, config: &HealthConfig, now: DateTime<Utc>) -> CheckResult {
    let since = now - window(config);
    let runs = match store.runs_since(since) {
        Ok(runs) => runs,
        Err(e) => return CheckResult::new(ERROR_RATE, HealthStatus::Critical, format!("query failed: {e}")),
    };

    let finished: Vec<_> = runs.iter().filter(|r| r.status.is_terminal()).collect();
    if finished.is_empty() {
        return CheckResult::new(ERROR_RATE, HealthStatus::Healthy, "no finished runs in window")
            .metric("runs", 0.0);
    }
    let failed = finished.iter().filter(|r| r.status == RunStatus::Failed).count();
    let rate = failed as f64 / finished.len() as f64;
    CheckResult::new(
        ERROR_RATE,
        HealthStatus::grade_high(rate, &config.error_rate),
        format!("{failed} of {} runs failed ({:.0}%)", finished.len(), rate * 100.0),
    )
    .metric("runs", finished.len() as f64)
    .metric("failed", failed as f64)
    .metric("error_rate", rate)
}

pub(super) fn system_resources(
    resources: &dyn SystemResources,
    config: &HealthConfig,
    data_dir: &Path,
) -> CheckResult {
    let disk = resources.disk_free_pct(data_dir);
    let memory = resources.memory_used_pct();

    let mut status = HealthStatus::Healthy;
    let mut parts = vec![];
    let mut result_metrics = vec![];

    match disk {
        Some(free) => {
            status = status.max(HealthStatus::grade_low(free, &config.disk_free_pct));
            parts.push(format!("disk {free:.1}% free"));
            result_metrics.push(("disk_free_pct", free));
        }
        None => {
            status = status.max(HealthStatus::Warning);
            parts.push("disk usage unavailable".to_string());
        }
    }
    match memory {
        Some(used) => {
            status = status.max(HealthStatus::grade_high(used, &config.memory_used_pct));
            parts.push(format!("memory {used:.1}% used"));
            result_metrics.push(("memory_used_pct", used));
        }
        None => {
            status = status.max(HealthStatus::Warning);
            parts.push("memory usage unavailable".to_string());
        }
    }

    result_metrics
        .into_iter()
        .fold(CheckResult::new(SYSTEM_RESOURCES, status, parts.join(", ")), |check, (k, v)| {
            check.metric(k, v)
        })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::SystemResources;
    use std::path::Path;

    /// Fixed resource readings.
    pub struct FixedResources {
        pub disk_free_pct: Option<f64>,
        pub memory_used_pct: Option<f64>,
    }

    impl FixedResources {
        pub fn healthy() -> Self {
            Self {
                disk_free_pct: Some(60.0),
                memory_used_pct: Some(40.0),
            }
        }
    }

    impl SystemResources for FixedResources {
        fn disk_free_pct(&self, _path: &Path) -> Option<f64> {
            self.disk_free_pct
        }

        fn memory_used_pct(&self) -> Option<f64> {
            self.memory_used_pct
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FixedResources;
    use super::*;
    use crate::types::{RunCompletion, RunKind};

    fn finish(store: &StateStore, status: RunStatus, started: DateTime<Utc>, secs: i64, memory: f64) {
        let run = store.insert_run(RunKind::Scheduled, 1, "h", started).unwrap();
        let completion = RunCompletion {
            status,
            records_extracted: 0,
            records_saved: 0,
            memory_peak_mb: Some(memory),
            error_message: None,
        };
        store
            .complete_run(run.id, &completion, started + Duration::seconds(secs))
            .unwrap();
    }

    #[test]
    fn test_database_check_flags_missing_tables() {
        let store = StateStore::in_memory().unwrap();
        let config = HealthConfig::default();
        assert_eq!(database(&store, &config).status, HealthStatus::Healthy);

        store
            .with_conn(|conn| conn.execute_batch("DROP TABLE daemon_stats"))
            .unwrap();
        let check = database(&store, &config);
        assert_eq!(check.status, HealthStatus::Critical);
        assert!(check.message.contains("daemon_stats"));
    }

    #[test]
    fn test_freshness_without_success_is_critical() {
        let store = StateStore::in_memory().unwrap();
        let config = HealthConfig::default();
        let now = Utc::now();
        assert_eq!(data_freshness(&store, &config, now).status, HealthStatus::Critical);

        finish(&store, RunStatus::Success, now - Duration::hours(30), 60, 100.0);
        let check = data_freshness(&store, &config, now);
        assert_eq!(check.status, HealthStatus::Warning);
        assert!(check.metrics["age_hours"] > 29.0);
    }

    #[test]
    fn test_performance_and_error_rate_over_window() {
        let store = StateStore::in_memory().unwrap();
        let config = HealthConfig::default();
        let now = Utc::now();
        assert_eq!(performance(&store, &config, now).status, HealthStatus::Healthy);
        assert_eq!(error_rate(&store, &config, now).status, HealthStatus::Healthy);

        finish(&store, RunStatus::Success, now - Duration::hours(3), 2000, 300.0);
        finish(&store, RunStatus::Failed, now - Duration::hours(2), 60, 2500.0);
        // Outside the window, ignored.
        finish(&store, RunStatus::Failed, now - Duration::hours(48), 60, 100.0);

        let perf = performance(&store, &config, now);
        assert_eq!(perf.status, HealthStatus::Critical);
        assert_eq!(perf.metrics["peak_memory_mb"], 2500.0);

        let errors = error_rate(&store, &config, now);
        assert_eq!(errors.status, HealthStatus::Critical);
        assert!((errors.metrics["error_rate"] - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_system_resources_thresholds() {
        let config = HealthConfig::default();
        let dir = Path::new(".");
        assert_eq!(
            system_resources(&FixedResources::healthy(), &config, dir).status,
            HealthStatus::Healthy
        );

        let low_disk = FixedResources {
            disk_free_pct: Some(8.0),
            memory_used_pct: Some(40.0),
        };
        assert_eq!(system_resources(&low_disk, &config, dir).status, HealthStatus::Critical);

        let unknown = FixedResources {
            disk_free_pct: None,
            memory_used_pct: Some(90.0),
        };
        let check = system_resources(&unknown, &config, dir);
        assert_eq!(check.status, HealthStatus::Warning);
        assert!(check.message.contains("unavailable"));
    }
}
