//! Recovery procedure execution.
//!
//! A critical error is matched to an active procedure by error type, falling
//! back to the `any_error` procedure. Steps run strictly in stored order: a
//! failed non-critical step is logged and skipped past, a failed critical step
//! aborts the procedure. The outcome is recorded on the procedure counters and
//! on the critical error; a failed recovery is reported, never raised.

pub mod procedures;
pub mod steps;

pub use steps::StepAction;

use chrono::{DateTime, Duration, Utc};
use notify::Severity;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::alert::OperatorNotifier;
use crate::cleanup;
use crate::error::Result;
use crate::lock::LockManager;
use crate::retry::RetryManager;
use crate::store::StateStore;
use crate::types::{CriticalError, ErrorType, NewCriticalError, RecoveryProcedure, RecoveryStep};

/// Result of one executed step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub step_type: String,
    pub critical: bool,
    pub success: bool,
    pub message: String,
}

/// Result of a recovery attempt.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOutcome {
    pub critical_error_id: i64,
    pub procedure_name: Option<String>,
    pub success: bool,
    pub steps: Vec<StepReport>,
    /// Index of the critical step that aborted the procedure
    pub aborted_at: Option<usize>,
}

/// Executes recovery procedures for critical errors.
pub struct RecoveryEngine {
    store: StateStore,
    retry: RetryManager,
    lock: Arc<dyn LockManager>,
    notifier: OperatorNotifier,
    temp_dir: PathBuf,
    max_wait: std::time::Duration,
}

impl RecoveryEngine {
    #[must_use]
    pub fn new(
        store: StateStore,
        retry: RetryManager,
        lock: Arc<dyn LockManager>,
        notifier: OperatorNotifier,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            retry,
            lock,
            notifier,
            temp_dir: temp_dir.into(),
            max_wait: std::time::Duration::MAX,
        }
    }

    /// Cap the duration of `wait` steps.
    #[must_use]
    pub fn with_max_wait(mut self, max_wait: std::time::Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Active procedure for `error_type`, else the catch-all procedure.
    pub fn find_procedure(&self, error_type: ErrorType) -> Result<Option<RecoveryProcedure>> {
        if let Some(procedure) = self.store.active_procedure_for(error_type)? {
            return Ok(Some(procedure));
        }
        if error_type == ErrorType::AnyError {
            return Ok(None);
        }
        self.store.active_procedure_for(ErrorType::AnyError)
    }

    /// Record a critical error and run recovery for it.
    pub async fn handle(&self, new: NewCriticalError) -> Result<(CriticalError, RecoveryOutcome)> {
        let now = Utc::now();
        let critical = self.store.insert_critical_error(&new, now)?;
        if let Err(e) = self.store.append_log(
            "error",
            "recovery",
            critical.run_id,
            &format!(
                "critical error in {}: {} ({})",
                critical.operation_type, critical.message, critical.error_type
            ),
            now,
        ) {
            warn!(error = %e, "Failed to mirror critical error into the log table");
        }
        let outcome = self.recover(&critical).await;
        Ok((critical, outcome))
    }

    /// Run the matching procedure for an already recorded critical error.
    pub async fn recover(&self, critical: &CriticalError) -> RecoveryOutcome {
        let procedure = match self.find_procedure(critical.error_type) {
            Ok(procedure) => procedure,
            Err(e) => {
                error!(error = %e, critical_error_id = critical.id, "Procedure lookup failed");
                None
            }
        };

        let Some(procedure) = procedure else {
            warn!(
                critical_error_id = critical.id,
                error_type = %critical.error_type,
                "No recovery procedure available"
            );
            self.finish(critical, None, false, Utc::now());
            self.notify_failure(critical, "no recovery procedure is configured").await;
            return RecoveryOutcome {
                critical_error_id: critical.id,
                procedure_name: None,
                success: false,
                steps: vec![],
                aborted_at: None,
            };
        };

        info!(
            critical_error_id = critical.id,
            procedure = %procedure.name,
            steps = procedure.recovery_steps.len(),
            "Recovery started"
        );
        self.notifier
            .notify(
                Severity::Warning,
                &format!("Recovery started: {}", procedure.name),
                &format!(
                    "Operation {} failed with {}: {}",
                    critical.operation_type, critical.error_type, critical.message
                ),
            )
            .await;

        let mut reports = Vec::with_capacity(procedure.recovery_steps.len());
        let mut aborted_at = None;
        for (index, step) in procedure.recovery_steps.iter().enumerate() {
            let result = self.run_step(step, critical, &procedure.name).await;
            let success = result.is_ok();
            let message = match result {
                Ok(message) => message,
                Err(e) => e.to_string(),
            };

            if success {
                info!(procedure = %procedure.name, index, step = %step.step_type, %message, "Recovery step succeeded");
            } else if step.critical {
                error!(procedure = %procedure.name, index, step = %step.step_type, %message, "Critical recovery step failed");
            } else {
                warn!(procedure = %procedure.name, index, step = %step.step_type, %message, "Recovery step failed, continuing");
            }

            reports.push(StepReport {
                index,
                step_type: step.step_type.clone(),
                critical: step.critical,
                success,
                message,
            });
            if !success && step.critical {
                aborted_at = Some(index);
                break;
            }
        }

        let success = aborted_at.is_none();
        let now = Utc::now();
        if let Err(e) = self.store.record_procedure_result(procedure.id, success, now) {
            error!(error = %e, procedure = %procedure.name, "Failed to update procedure counters");
        }
        self.finish(critical, Some(&procedure.name), success, now);

        if success {
            info!(critical_error_id = critical.id, procedure = %procedure.name, "Recovery succeeded");
        } else {
            let reason = aborted_at
                .and_then(|i| reports.get(i))
                .map(|r| format!("step {} ({}) failed: {}", r.index, r.step_type, r.message))
                .unwrap_or_default();
            self.notify_failure(critical, &reason).await;
        }

        RecoveryOutcome {
            critical_error_id: critical.id,
            procedure_name: Some(procedure.name),
            success,
            steps: reports,
            aborted_at,
        }
    }

    async fn run_step(&self, step: &RecoveryStep, critical: &CriticalError, procedure: &str) -> Result<String> {
        let action = StepAction::parse(step)?;
        let now = Utc::now();
        match action {
            StepAction::Wait { seconds } => {
                let wait = std::time::Duration::from_secs(seconds).min(self.max_wait);
                tokio::time::sleep(wait).await;
                Ok(format!("waited {}s", wait.as_secs()))
            }
            StepAction::SendNotification { message, severity } => {
                let delivered = self
                    .notifier
                    .notify(severity, &format!("Recovery: {procedure}"), &message)
                    .await;
                Ok(if delivered {
                    "notification delivered".to_string()
                } else {
                    "notification not delivered".to_string()
                })
            }
            StepAction::ClearLocks => {
                let report = self.lock.force_clear()?;
                Ok(format!(
                    "lock file removed: {}, running flag cleared: {}",
                    report.file_removed, report.flag_cleared
                ))
            }
            StepAction::RestartEtl { delay_minutes } => {
                let run_after = now + Duration::minutes(i64::from(delay_minutes));
                let reason = format!("recovery {procedure} for {}", critical.error_type);
                let request = self
                    .store
                    .insert_restart_request(run_after, &reason, Some(critical.id), now)?;
                Ok(format!("restart request {} queued for {}", request.id, request.run_after))
            }
            StepAction::CleanupTempData => {
                let swept = cleanup::clear_temp_dir(&self.temp_dir, None, false)?;
                let purged = self.store.purge_expired_fallback(now)?;
                Ok(format!(
                    "removed {} temp entries ({} bytes), purged {purged} expired fallback entries",
                    swept.removed, swept.bytes
                ))
            }
            StepAction::ResetRetryCounters => {
                let closed = match critical.run_id {
                    Some(run_id) => self.retry.reset_run(run_id, now)?,
                    None => self.retry.reset_all(now)?,
                };
                Ok(format!("closed {closed} open retry attempts"))
            }
        }
    }

    fn finish(&self, critical: &CriticalError, procedure: Option<&str>, success: bool, now: DateTime<Utc>) {
        if let Err(e) = self.store.record_recovery_result(critical.id, procedure, success, now) {
            error!(error = %e, critical_error_id = critical.id, "Failed to record recovery result");
        }
        let level = if success { "info" } else { "error" };
        let message = format!(
            "recovery {} for critical error {} ({})",
            if success { "succeeded" } else { "failed" },
            critical.id,
            procedure.unwrap_or("no procedure"),
        );
        if let Err(e) = self.store.append_log(level, "recovery", critical.run_id, &message, now) {
            warn!(error = %e, "Failed to mirror recovery result into the log table");
        }
    }

    async fn notify_failure(&self, critical: &CriticalError, reason: &str) {
        self.notifier
            .notify(
                Severity::Critical,
                &format!("Recovery failed for {}", critical.operation_type),
                &format!(
                    "Critical error {} ({}): {}\n{reason}\nManual intervention required: etl-recovery status",
                    critical.id, critical.error_type, critical.message
                ),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::testing::RecordingSink;
    use crate::error::HealerError;
    use crate::lock::{ClearReport, LockHolder, LockState, MemoryLockManager};
    use crate::process::testing::FakeProcessTable;
    use etl_config::RetryConfig;
    use notify::NotificationSink;
    use serde_json::json;

    struct BrokenLock;

    impl LockManager for BrokenLock {
        fn acquire(&self) -> Result<LockHolder> {
            Err(HealerError::Process("broken".to_string()))
        }
        fn release(&self) -> Result<bool> {
            Ok(false)
        }
        fn force_clear(&self) -> Result<ClearReport> {
            Err(HealerError::Process("lock directory not writable".to_string()))
        }
        fn inspect(&self) -> Result<LockState> {
            Ok(LockState::default())
        }
    }

    struct Fixture {
        store: StateStore,
        sink: Arc<RecordingSink>,
        engine: RecoveryEngine,
        _temp: tempfile::TempDir,
    }

    fn fixture(lock: Arc<dyn LockManager>) -> Fixture {
        let store = StateStore::in_memory().unwrap();
        let sink = Arc::new(RecordingSink::accepting());
        let temp = tempfile::tempdir().unwrap();
        let dyn_sink: Arc<dyn NotificationSink> = sink.clone();
        let engine = RecoveryEngine::new(
            store.clone(),
            RetryManager::new(store.clone(), &RetryConfig::default()),
            lock,
            OperatorNotifier::new(dyn_sink, vec![], "[ETL]"),
            temp.path(),
        )
        .with_max_wait(std::time::Duration::from_millis(10));
        Fixture {
            store,
            sink,
            engine,
            _temp: temp,
        }
    }

    fn memory_lock() -> Arc<dyn LockManager> {
        Arc::new(MemoryLockManager::new(1, Arc::new(FakeProcessTable::with_alive(&[1]))))
    }

    fn error_of(error_type: ErrorType) -> NewCriticalError {
        NewCriticalError {
            run_id: Some(7),
            operation_type: "extract:amazon".to_string(),
            error_type,
            message: "failed".to_string(),
        }
    }

    fn install(store: &StateStore, error_type: ErrorType, steps: Vec<RecoveryStep>) {
        store
            .upsert_procedure(error_type.as_str(), error_type, &steps, true, Utc::now())
            .unwrap();
    }

    #[tokio::test]
    async fn test_critical_failure_aborts_remaining_steps() {
        let f = fixture(Arc::new(BrokenLock));
        f.store.insert_attempt(7, "extract:amazon", ErrorType::AnyError, 2, None, "x", false, Utc::now()).unwrap();
        install(
            &f.store,
            ErrorType::NetworkTimeout,
            vec![
                RecoveryStep::new("no_such_step", json!({}), false, "A"),
                RecoveryStep::new("clear_locks", json!({}), true, "B"),
                RecoveryStep::new("reset_retry_counters", json!({}), false, "C"),
            ],
        );

        let (critical, outcome) = f.engine.handle(error_of(ErrorType::NetworkTimeout)).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(outcome.aborted_at, Some(1));
        // C never ran, so the open attempt survives.
        assert_eq!(f.store.open_attempts(Some(7)).unwrap().len(), 1);

        let stored = f.store.get_critical_error(critical.id).unwrap().unwrap();
        assert!(stored.recovery_attempted);
        assert!(!stored.recovery_successful);
        assert!(stored.resolved_at.is_none());
        assert_eq!(stored.procedure_name.as_deref(), Some("network_timeout"));

        let procedure = f.store.get_procedure("network_timeout").unwrap().unwrap();
        assert_eq!(procedure.failure_count, 1);
        assert_eq!(procedure.success_count, 0);
    }

    #[tokio::test]
    async fn test_non_critical_failure_continues() {
        let f = fixture(memory_lock());
        f.store.insert_attempt(7, "extract:amazon", ErrorType::AnyError, 2, None, "x", false, Utc::now()).unwrap();
        install(
            &f.store,
            ErrorType::NetworkTimeout,
            vec![
                RecoveryStep::new("wait", json!({"seconds": "later"}), false, "A"),
                RecoveryStep::new("reset_retry_counters", json!({}), false, "B"),
            ],
        );

        let (critical, outcome) = f.engine.handle(error_of(ErrorType::NetworkTimeout)).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.steps.len(), 2);
        assert!(!outcome.steps[0].success);
        assert!(outcome.steps[1].success);
        assert!(f.store.open_attempts(Some(7)).unwrap().is_empty());

        let stored = f.store.get_critical_error(critical.id).unwrap().unwrap();
        assert!(stored.recovery_successful);
        assert_eq!(stored.resolution.as_deref(), Some("recovered"));
    }

    #[tokio::test]
    async fn test_falls_back_to_any_error_procedure() {
        let f = fixture(memory_lock());
        let procedure = f.store.get_procedure("network_timeout").unwrap().unwrap();
        f.store
            .upsert_procedure(&procedure.name, procedure.trigger_condition, &procedure.recovery_steps, false, Utc::now())
            .unwrap();

        let (_, outcome) = f.engine.handle(error_of(ErrorType::NetworkTimeout)).await.unwrap();
        assert_eq!(outcome.procedure_name.as_deref(), Some("any_error"));
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_no_procedure_is_unsuccessful_attempt() {
        let f = fixture(memory_lock());
        for name in ["any_error", "api_rate_limit"] {
            let p = f.store.get_procedure(name).unwrap().unwrap();
            f.store
                .upsert_procedure(&p.name, p.trigger_condition, &p.recovery_steps, false, Utc::now())
                .unwrap();
        }

        let (critical, outcome) = f.engine.handle(error_of(ErrorType::ApiRateLimit)).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.procedure_name.is_none());
        let stored = f.store.get_critical_error(critical.id).unwrap().unwrap();
        assert!(stored.recovery_attempted);
        assert!(!stored.recovery_successful);
        // Failure notification still went out.
        assert_eq!(f.sink.count(), 1);
    }

    #[tokio::test]
    async fn test_restart_step_queues_request_instead_of_running() {
        let f = fixture(memory_lock());
        install(
            &f.store,
            ErrorType::ApiRateLimit,
            vec![RecoveryStep::new("restart_etl", json!({"delay_minutes": 15}), false, "")],
        );

        let before = Utc::now();
        let (critical, outcome) = f.engine.handle(error_of(ErrorType::ApiRateLimit)).await.unwrap();
        assert!(outcome.success);
        let pending = f.store.pending_restart_requests().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].critical_error_id, Some(critical.id));
        assert!(pending[0].run_after >= before + Duration::minutes(15));
        assert!(f.store.running_runs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disk_full_cleans_temp_dir() {
        let f = fixture(memory_lock());
        std::fs::write(f.engine.temp_dir.join("partial.csv"), "1,2").unwrap();

        let (_, outcome) = f.engine.handle(error_of(ErrorType::DiskSpaceFull)).await.unwrap();
        assert!(outcome.success);
        assert_eq!(std::fs::read_dir(&f.engine.temp_dir).unwrap().count(), 0);
        // Start, step notification.
        assert_eq!(f.sink.count(), 2);
    }
}
