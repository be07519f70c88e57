//! Operator-facing equivalents of the automated recovery actions.
//!
//! Every command reads and writes the same persisted state as the scheduler
//! and the monitor. Commands taking `dry_run` report what they would change
//! without mutating anything.

use chrono::{DateTime, Duration, Utc};
use etl_config::{RecoveryConfig, RetentionConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cleanup::{self, SweepReport};
use crate::error::{HealerError, Result};
use crate::fallback::{FallbackDataStore, RestoreReport};
use crate::health::{HealthChecker, HealthReport};
use crate::lock::{ClearReport, LockManager, LockState};
use crate::pipeline::Loader;
use crate::process::{self, PidMarker, ProcessTable};
use crate::retry::RetryManager;
use crate::store::{days_ago, StateStore, StoredHealthResult};
use crate::types::{CriticalError, DaemonStats, RestartRequest, RetryAttempt, Run, RunId};

/// Resolution recorded on critical errors closed by an operator.
pub const OPERATOR_RESOLUTION: &str = "operator";

const RECENT_RUNS: u32 = 10;

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub lock: LockState,
    pub running_runs: Vec<Run>,
    pub recent_runs: Vec<Run>,
    pub active_retries: Vec<RetryAttempt>,
    pub unresolved_errors: Vec<CriticalError>,
    pub pending_restarts: Vec<RestartRequest>,
    /// Pid of the live health monitor, if any
    pub daemon_pid: Option<u32>,
    pub daemon_stats: DaemonStats,
    pub latest_health: Option<StoredHealthResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearLocksReport {
    pub before: LockState,
    /// `None` on a dry run
    pub cleared: Option<ClearReport>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResetReport {
    pub run_id: Option<RunId>,
    pub attempts_closed: usize,
    pub errors_resolved: usize,
}

/// Rows and files removed (or eligible for removal on a dry run).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CleanupReport {
    pub retry_attempts: usize,
    pub health_results: usize,
    pub alerts: usize,
    pub runs: usize,
    pub critical_errors: usize,
    pub fallback_entries: usize,
    pub log_rows: usize,
    pub temp_files: SweepReport,
    pub log_files: SweepReport,
}

impl CleanupReport {
    #[must_use]
    pub fn total_rows(&self) -> usize {
        self.retry_attempts
            + self.health_results
            + self.alerts
            + self.runs
            + self.critical_errors
            + self.fallback_entries
            + self.log_rows
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmergencyStopReport {
    pub daemon_pid: Option<u32>,
    /// The monitor ignored SIGTERM and was killed
    pub daemon_forced: bool,
    pub failed_runs: Vec<RunId>,
    pub flag_cleared: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForceRestartReport {
    pub stop: EmergencyStopReport,
    pub locks: ClearLocksReport,
    pub reset: ResetReport,
    /// `None` on a dry run
    pub restart: Option<RestartRequest>,
}

// =============================================================================
// Tool
// =============================================================================

/// Filesystem locations used by manual commands.
#[derive(Debug, Clone)]
pub struct ManualPaths {
    pub temp_dir: PathBuf,
    pub log_dir: PathBuf,
    pub daemon_pid_file: PathBuf,
}

pub struct ManualRecovery {
    store: StateStore,
    lock: Arc<dyn LockManager>,
    retry: RetryManager,
    fallback: FallbackDataStore,
    checker: HealthChecker,
    processes: Arc<dyn ProcessTable>,
    daemon: PidMarker,
    paths: ManualPaths,
    retention: RetentionConfig,
    recovery: RecoveryConfig,
    stop_timeout: std::time::Duration,
}

impl ManualRecovery {
    #[must_use]
    pub fn new(
        store: StateStore,
        lock: Arc<dyn LockManager>,
        retry: RetryManager,
        fallback: FallbackDataStore,
        checker: HealthChecker,
        processes: Arc<dyn ProcessTable>,
        paths: ManualPaths,
        retention: RetentionConfig,
        recovery: RecoveryConfig,
    ) -> Self {
        let stop_timeout = std::time::Duration::from_secs(checker.config().stop_timeout_secs);
        Self {
            daemon: PidMarker::new(&paths.daemon_pid_file),
            store,
            lock,
            retry,
            fallback,
            checker,
            processes,
            paths,
            retention,
            recovery,
            stop_timeout,
        }
    }

    /// Snapshot of everything an operator needs to decide on an action.
    pub fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            lock: self.lock.inspect()?,
            running_runs: self.store.running_runs()?,
            recent_runs: self.store.recent_runs(RECENT_RUNS)?,
            active_retries: self.retry.active_attempts()?,
            unresolved_errors: self.store.unresolved_critical_errors(None)?,
            pending_restarts: self.store.pending_restart_requests()?,
            daemon_pid: self.daemon.live_pid(self.processes.as_ref())?,
            daemon_stats: self.store.daemon_stats()?,
            latest_health: self.store.latest_health_result()?,
        })
    }

    pub fn clear_locks(&self, dry_run: bool) -> Result<ClearLocksReport> {
        let before = self.lock.inspect()?;
        if dry_run {
            return Ok(ClearLocksReport { before, cleared: None });
        }
        let cleared = self.lock.force_clear()?;
        info!(
            file_removed = cleared.file_removed,
            flag_cleared = cleared.flag_cleared,
            "Execution lock cleared by operator"
        );
        Ok(ClearLocksReport {
            before,
            cleared: Some(cleared),
        })
    }

    /// Close open retry attempts and resolve unresolved critical errors.
    pub fn reset_failed(&self, run_id: Option<RunId>, dry_run: bool, now: DateTime<Utc>) -> Result<ResetReport> {
        if dry_run {
            return Ok(ResetReport {
                run_id,
                attempts_closed: self.store.open_attempts(run_id)?.len(),
                errors_resolved: self.store.unresolved_critical_errors(run_id)?.len(),
            });
        }
        let attempts_closed = match run_id {
            Some(id) => self.retry.reset_run(id, now)?,
            None => self.retry.reset_all(now)?,
        };
        let errors_resolved = self
            .store
            .resolve_critical_errors(run_id, OPERATOR_RESOLUTION, now)?;
        info!(run_id = ?run_id, attempts_closed, errors_resolved, "Failed state reset by operator");
        Ok(ResetReport {
            run_id,
            attempts_closed,
            errors_resolved,
        })
    }

    /// Retention-based purge of rows and files.
    pub fn cleanup(&self, dry_run: bool, now: DateTime<Utc>) -> Result<CleanupReport> {
        let r = &self.retention;
        let retry_cutoff = days_ago(now, r.retry_days);
        let monitoring_cutoff = days_ago(now, r.monitoring_days);
        let runs_cutoff = days_ago(now, r.runs_days);
        let critical_cutoff = days_ago(now, r.critical_error_days);
        let log_cutoff = days_ago(now, r.log_days);

        let temp_age = std::time::Duration::from_secs(u64::from(r.temp_file_hours) * 3600);
        let log_age = std::time::Duration::from_secs(u64::from(r.log_days) * 86_400);
        let temp_files = cleanup::clear_temp_dir(&self.paths.temp_dir, Some(temp_age), dry_run)?;
        let log_files = cleanup::clear_rotated_logs(&self.paths.log_dir, log_age, dry_run)?;

        let report = if dry_run {
            CleanupReport {
                retry_attempts: self.store.count_purgeable_attempts(retry_cutoff)?,
                health_results: self.store.count_purgeable_health_results(monitoring_cutoff)?,
                alerts: self.store.count_purgeable_alerts(monitoring_cutoff)?,
                runs: self.store.count_purgeable_runs(runs_cutoff)?,
                critical_errors: self.store.count_purgeable_critical_errors(critical_cutoff)?,
                fallback_entries: self.store.count_expired_fallback(now)?,
                log_rows: self.store.count_purgeable_logs(log_cutoff)?,
                temp_files,
                log_files,
            }
        } else {
            CleanupReport {
                retry_attempts: self.retry.cleanup(r.retry_days, now)?,
                health_results: self.store.purge_health_results(monitoring_cutoff)?,
                alerts: self.store.purge_alerts(monitoring_cutoff)?,
                runs: self.store.purge_runs(runs_cutoff)?,
                critical_errors: self.store.purge_resolved_critical_errors(critical_cutoff)?,
                fallback_entries: self.fallback.purge_expired(now)?,
                log_rows: self.store.purge_logs(log_cutoff)?,
                temp_files,
                log_files,
            }
        };
        info!(dry_run, rows = report.total_rows(), temp_files = report.temp_files.removed, "Cleanup finished");
        Ok(report)
    }

    /// Stop the health monitor, fail stalled runs and drop the running flag.
    pub async fn emergency_stop(&self, dry_run: bool, now: DateTime<Utc>) -> Result<EmergencyStopReport> {
        let daemon_pid = self.daemon.live_pid(self.processes.as_ref())?;
        if dry_run {
            return Ok(EmergencyStopReport {
                daemon_pid,
                daemon_forced: false,
                failed_runs: self.store.running_runs()?.iter().map(|r| r.id).collect(),
                flag_cleared: self.store.etl_status()?.is_running,
            });
        }

        let mut daemon_forced = false;
        if let Some(pid) = daemon_pid {
            warn!(pid, "Stopping health monitor");
            daemon_forced = process::stop_process(self.processes.as_ref(), pid, self.stop_timeout).await?;
            if daemon_forced {
                // A killed monitor never records its own shutdown.
                self.store.daemon_stopped(now)?;
            }
        }
        self.daemon.remove()?;

        let failed_runs = self.store.fail_running_runs("stalled: emergency stop", now)?;
        let flag_cleared = self.store.clear_running(None)?;
        warn!(?failed_runs, flag_cleared, "Emergency stop completed");
        Ok(EmergencyStopReport {
            daemon_pid,
            daemon_forced,
            failed_runs,
            flag_cleared,
        })
    }

    /// emergency-stop → clear-locks → reset-failed → queue a restart.
    /// The first failing sub-step aborts and is named in the error.
    pub async fn force_restart(
        &self,
        run_id: Option<RunId>,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<ForceRestartReport> {
        let stop = self
            .emergency_stop(dry_run, now)
            .await
            .map_err(|e| HealerError::step("emergency-stop", e))?;
        let locks = self
            .clear_locks(dry_run)
            .map_err(|e| HealerError::step("clear-locks", e))?;
        let reset = self
            .reset_failed(run_id, dry_run, now)
            .map_err(|e| HealerError::step("reset-failed", e))?;

        let restart = if dry_run {
            None
        } else {
            let run_after = now + Duration::minutes(i64::from(self.recovery.restart_delay_minutes));
            let request = self
                .store
                .insert_restart_request(run_after, "operator force-restart", None, now)
                .map_err(|e| HealerError::step("schedule-restart", e))?;
            info!(request_id = request.id, run_after = %request.run_after, "Restart scheduled by operator");
            Some(request)
        };

        Ok(ForceRestartReport {
            stop,
            locks,
            reset,
            restart,
        })
    }

    /// Replay recent fallback snapshots through `loader`.
    pub async fn restore_fallback(&self, loader: &dyn Loader, dry_run: bool, now: DateTime<Utc>) -> Result<RestoreReport> {
        self.fallback
            .restore(loader, None, self.recovery.fallback_max_age_hours, dry_run, now)
            .await
    }

    pub fn health_check(&self) -> HealthReport {
        self.checker.assess()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::checks::testing::FixedResources;
    use crate::lock::MemoryLockManager;
    use crate::pipeline::StoreLoader;
    use crate::process::testing::FakeProcessTable;
    use crate::types::{ErrorType, NewCriticalError, RunKind, RunStatus};
    use etl_config::{HealthConfig, RetryConfig};
    use serde_json::json;

    const DAEMON_PID: u32 = 4242;

    struct Fixture {
        store: StateStore,
        processes: Arc<FakeProcessTable>,
        lock: Arc<MemoryLockManager>,
        tool: ManualRecovery,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let store = StateStore::in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let processes = Arc::new(FakeProcessTable::with_alive(&[1, DAEMON_PID]));
        let lock = Arc::new(MemoryLockManager::new(1, processes.clone()));
        let paths = ManualPaths {
            temp_dir: dir.path().join("tmp"),
            log_dir: dir.path().join("logs"),
            daemon_pid_file: dir.path().join("health-monitor.pid"),
        };
        let health = HealthConfig {
            stop_timeout_secs: 1,
            ..HealthConfig::default()
        };
        let tool = ManualRecovery::new(
            store.clone(),
            lock.clone(),
            RetryManager::new(store.clone(), &RetryConfig::default()),
            FallbackDataStore::new(store.clone(), 72),
            HealthChecker::new(store.clone(), health, Arc::new(FixedResources::healthy()), dir.path()),
            processes.clone(),
            paths,
            RetentionConfig::default(),
            RecoveryConfig::default(),
        );
        Fixture {
            store,
            processes,
            lock,
            tool,
            dir,
        }
    }

    fn seed_failure(store: &StateStore) -> RunId {
        let run = store.insert_run(RunKind::Scheduled, 1, "host", Utc::now()).unwrap();
        store
            .insert_attempt(run.id, "extract:stock", ErrorType::NetworkTimeout, 3, None, "timeout", false, Utc::now())
            .unwrap();
        store
            .insert_critical_error(
                &NewCriticalError {
                    run_id: Some(run.id),
                    operation_type: "extract:stock".to_string(),
                    error_type: ErrorType::NetworkTimeout,
                    message: "timeout".to_string(),
                },
                Utc::now(),
            )
            .unwrap();
        run.id
    }

    #[test]
    fn test_reset_failed_dry_run_then_apply() {
        let f = fixture();
        let run_id = seed_failure(&f.store);
        let now = Utc::now();

        let preview = f.tool.reset_failed(Some(run_id), true, now).unwrap();
        assert_eq!(preview.attempts_closed, 1);
        assert_eq!(preview.errors_resolved, 1);
        assert_eq!(f.store.open_attempts(Some(run_id)).unwrap().len(), 1);

        let applied = f.tool.reset_failed(Some(run_id), false, now).unwrap();
        assert_eq!(applied.attempts_closed, 1);
        assert_eq!(applied.errors_resolved, 1);
        assert!(f.store.open_attempts(None).unwrap().is_empty());
        assert!(f.store.unresolved_critical_errors(None).unwrap().is_empty());
    }

    #[test]
    fn test_clear_locks_dry_run_keeps_lock() {
        let f = fixture();
        f.lock.acquire().unwrap();

        let preview = f.tool.clear_locks(true).unwrap();
        assert!(preview.before.is_held());
        assert!(preview.cleared.is_none());
        assert!(f.lock.inspect().unwrap().is_held());

        let applied = f.tool.clear_locks(false).unwrap();
        assert!(applied.cleared.is_some());
        assert!(!f.lock.inspect().unwrap().is_held());
    }

    #[tokio::test]
    async fn test_emergency_stop_fails_running_runs() {
        let f = fixture();
        let marker = PidMarker::new(f.dir.path().join("health-monitor.pid"));
        marker.write(DAEMON_PID).unwrap();
        let run = f.store.insert_run(RunKind::Scheduled, 1, "host", Utc::now()).unwrap();
        f.store.set_running(1, "host", Utc::now()).unwrap();

        let report = f.tool.emergency_stop(false, Utc::now()).await.unwrap();
        assert_eq!(report.daemon_pid, Some(DAEMON_PID));
        assert!(!report.daemon_forced);
        assert_eq!(report.failed_runs, vec![run.id]);
        assert!(report.flag_cleared);
        assert!(f.processes.terminated.lock().unwrap().contains(&DAEMON_PID));
        assert!(marker.read().unwrap().is_none());
        assert_eq!(f.store.get_run(run.id).unwrap().unwrap().status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_force_restart_queues_request() {
        let f = fixture();
        let run_id = seed_failure(&f.store);
        let now = Utc::now();

        let report = f.tool.force_restart(None, false, now).await.unwrap();
        assert_eq!(report.stop.failed_runs, vec![run_id]);
        assert_eq!(report.reset.errors_resolved, 1);
        let restart = report.restart.unwrap();
        assert_eq!((restart.run_after - now).num_minutes(), 5);
        assert_eq!(f.store.pending_restart_requests().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_force_restart_dry_run_changes_nothing() {
        let f = fixture();
        seed_failure(&f.store);
        let report = f.tool.force_restart(None, true, Utc::now()).await.unwrap();
        assert!(report.restart.is_none());
        assert_eq!(f.store.running_runs().unwrap().len(), 1);
        assert!(f.store.pending_restart_requests().unwrap().is_empty());
    }

    #[test]
    fn test_cleanup_dry_run_counts_without_deleting() {
        let f = fixture();
        let now = Utc::now();
        let old = now - Duration::days(120);
        let run = f.store.insert_run(RunKind::Scheduled, 1, "host", old).unwrap();
        f.store
            .complete_run(
                run.id,
                &crate::types::RunCompletion {
                    status: RunStatus::Success,
                    records_extracted: 1,
                    records_saved: 1,
                    memory_peak_mb: None,
                    error_message: None,
                },
                old,
            )
            .unwrap();
        std::fs::create_dir_all(&f.tool.paths.temp_dir).unwrap();
        std::fs::write(f.tool.paths.temp_dir.join("fresh.tmp"), "x").unwrap();

        let preview = f.tool.cleanup(true, now).unwrap();
        assert_eq!(preview.runs, 1);
        assert_eq!(preview.temp_files.removed, 0);
        assert!(f.store.get_run(run.id).unwrap().is_some());

        let applied = f.tool.cleanup(false, now).unwrap();
        assert_eq!(applied.runs, 1);
        assert!(f.store.get_run(run.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restore_fallback_honours_dry_run() {
        let f = fixture();
        let now = Utc::now();
        let entry = f
            .store
            .insert_fallback("stock", "2026-10-18", &json!([{"sku": "A"}]), now + Duration::hours(72), now)
            .unwrap();
        let loader = StoreLoader::new(f.store.clone());

        f.tool.restore_fallback(&loader, true, now).await.unwrap();
        assert_eq!(f.store.get_fallback(entry.id).unwrap().unwrap().usage_count, 0);

        let report = f.tool.restore_fallback(&loader, false, now).await.unwrap();
        assert_eq!(report.restored(), 1);
        assert_eq!(f.store.get_fallback(entry.id).unwrap().unwrap().usage_count, 1);
    }

    #[test]
    fn test_status_reports_live_daemon() {
        let f = fixture();
        PidMarker::new(f.dir.path().join("health-monitor.pid")).write(DAEMON_PID).unwrap();
        let status = f.tool.status().unwrap();
        assert_eq!(status.daemon_pid, Some(DAEMON_PID));
        assert!(status.running_runs.is_empty());
        assert!(status.latest_health.is_none());
    }
}
