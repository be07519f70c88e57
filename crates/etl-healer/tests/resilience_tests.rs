//! End-to-end behaviour of the lock, retry, recovery and fallback paths
//! against a real state store.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use etl_config::{HealerConfig, RetryConfig, RetryOverride, SourceConfig};
use etl_healer::lock::LockHolder;
use etl_healer::pipeline::SourceStatus;
use etl_healer::retry::EscalationReason;
use etl_healer::{
    ErrorType, ExtractError, Extractor, FallbackDataStore, FileLockManager, Filters, HealerError, LockManager,
    MemoryLockManager, OperatorNotifier, PipelineRunner, RecoveryEngine, RetryDecision, RetryManager, RunKind,
    RunOptions, RunStatus, ScheduleGate, Services, StateStore, StoreLoader, SystemProcessTable,
};
use notify::NotificationSink;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Doubles
// =============================================================================

#[derive(Default)]
struct CountingSink {
    delivered: AtomicUsize,
}

#[async_trait]
impl NotificationSink for CountingSink {
    async fn deliver(&self, _subject: &str, _body: &str, _recipients: &[String]) -> bool {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        true
    }
}

/// Fails with `error` for the first `failures` calls, then returns `records`.
struct FlakySource {
    name: String,
    failures: usize,
    error: ErrorType,
    records: Vec<Value>,
    calls: AtomicUsize,
}

impl FlakySource {
    fn new(name: &str, failures: usize, error: ErrorType, records: Vec<Value>) -> Self {
        Self {
            name: name.to_string(),
            failures,
            error,
            records,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Extractor for FlakySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn extract(&self, _filters: &Filters) -> Result<Vec<Value>, ExtractError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(ExtractError::new(self.error, format!("{} failure #{}", self.name, call + 1)));
        }
        Ok(self.records.clone())
    }
}

/// Records how many runs are marked running while it extracts.
struct RunningCountSource {
    store: StateStore,
    seen: AtomicUsize,
}

#[async_trait]
impl Extractor for RunningCountSource {
    fn name(&self) -> &str {
        "stock"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn extract(&self, _filters: &Filters) -> Result<Vec<Value>, ExtractError> {
        let running = self.store.running_runs().map_err(|e| ExtractError::classified(e.to_string()))?;
        self.seen.store(running.len(), Ordering::SeqCst);
        Ok(vec![json!({"sku": "A"})])
    }
}

/// Drops the retry table from a second connection, breaking the store mid-run.
struct SchemaBreakingSource {
    db_path: std::path::PathBuf,
}

#[async_trait]
impl Extractor for SchemaBreakingSource {
    fn name(&self) -> &str {
        "stock"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn extract(&self, _filters: &Filters) -> Result<Vec<Value>, ExtractError> {
        let conn = rusqlite::Connection::open(&self.db_path).unwrap();
        conn.execute_batch("DROP TABLE etl_retry_attempts").unwrap();
        Ok(vec![json!({"sku": "A"})])
    }
}

struct OfflineSource;

#[async_trait]
impl Extractor for OfflineSource {
    fn name(&self) -> &str {
        "offline"
    }

    async fn is_available(&self) -> bool {
        false
    }

    async fn extract(&self, _filters: &Filters) -> Result<Vec<Value>, ExtractError> {
        unreachable!("unavailable sources are never extracted")
    }
}

fn instant_retries() -> RetryConfig {
    RetryConfig {
        max_inline_wait_secs: 5,
        overrides: vec![RetryOverride {
            error_type: "network_timeout".to_string(),
            max_attempts: Some(3),
            base_delay_secs: Some(0),
            multiplier: Some(1.0),
            max_delay_secs: Some(0),
        }],
    }
}

fn runner(store: &StateStore, sink: Arc<CountingSink>, sources: Vec<Arc<dyn Extractor>>) -> PipelineRunner {
    let retry = RetryManager::new(store.clone(), &instant_retries());
    let lock: Arc<dyn LockManager> = Arc::new(MemoryLockManager::new(std::process::id(), Arc::new(SystemProcessTable)));
    let temp = std::env::temp_dir().join(format!("etl-healer-test-{}", std::process::id()));
    let recovery = RecoveryEngine::new(
        store.clone(),
        retry.clone(),
        lock,
        OperatorNotifier::new(sink, vec![], "[ETL]"),
        temp,
    )
    .with_max_wait(Duration::from_millis(5));
    PipelineRunner::new(
        store.clone(),
        retry,
        Arc::new(recovery),
        FallbackDataStore::new(store.clone(), 72),
        sources,
    )
}

fn options(dry_run: bool) -> RunOptions {
    RunOptions {
        kind: RunKind::Manual,
        dry_run,
        filters: Filters::default(),
        consume_restarts: false,
    }
}

/// A pid that belonged to a process which has already exited.
fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

// =============================================================================
// Execution lock
// =============================================================================

#[test]
fn test_second_acquire_fails_while_holder_alive() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path().join("state.db")).unwrap();
    let path = dir.path().join("etl.lock");

    let first = FileLockManager::new(&path, store.clone(), Arc::new(SystemProcessTable));
    let second = FileLockManager::new(&path, store.clone(), Arc::new(SystemProcessTable)).with_identity(dead_pid(), "other");

    let holder = first.acquire().unwrap();
    assert_eq!(holder.pid, std::process::id());
    assert!(matches!(second.acquire(), Err(HealerError::LockHeld { .. })));
    assert!(store.etl_status().unwrap().is_running);

    assert!(first.release().unwrap());
    assert!(!first.release().unwrap());
    assert!(!store.etl_status().unwrap().is_running);
    assert!(second.acquire().is_ok());
}

#[test]
fn test_dead_holder_is_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path().join("state.db")).unwrap();
    let path = dir.path().join("etl.lock");
    let stale = LockHolder {
        pid: dead_pid(),
        host: "crashed-host".to_string(),
        started_at: Utc::now(),
    };
    std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();
    store.set_running(stale.pid, &stale.host, stale.started_at).unwrap();

    let lock = FileLockManager::new(&path, store.clone(), Arc::new(SystemProcessTable));
    assert!(lock.inspect().unwrap().is_stale());
    let holder = lock.acquire().unwrap();
    assert_eq!(holder.pid, std::process::id());
    assert_eq!(store.etl_status().unwrap().pid, Some(std::process::id()));
}

// =============================================================================
// Retry budget
// =============================================================================

#[test]
fn test_three_failures_exhaust_and_fourth_escalates() {
    let store = StateStore::in_memory().unwrap();
    let retry = RetryManager::new(store.clone(), &RetryConfig::default());
    let run = store.insert_run(RunKind::Scheduled, 1, "host", Utc::now()).unwrap();
    let now = Utc::now();

    for expected in 1..=2 {
        match retry.record_failure(run.id, "extract:stock", ErrorType::NetworkTimeout, "timeout", now).unwrap() {
            RetryDecision::RetryAt { attempt, .. } => assert_eq!(attempt.attempt_number, expected),
            other => panic!("expected a retry, got {other:?}"),
        }
    }
    match retry.record_failure(run.id, "extract:stock", ErrorType::NetworkTimeout, "timeout", now).unwrap() {
        RetryDecision::Exhausted { attempt } => {
            assert_eq!(attempt.attempt_number, 3);
            assert!(attempt.is_exhausted);
            assert!(!attempt.is_completed);
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert!(matches!(
        retry.record_failure(run.id, "extract:stock", ErrorType::NetworkTimeout, "timeout", now).unwrap(),
        RetryDecision::Escalate(EscalationReason::Exhausted)
    ));
    assert_eq!(store.open_attempts(Some(run.id)).unwrap()[0].attempt_number, 3);
}

// =============================================================================
// Schedule gate
// =============================================================================

#[test]
fn test_gate_window_and_daily_success() {
    let store = StateStore::in_memory().unwrap();
    let target = chrono::NaiveTime::from_hms_opt(6, 0, 0).unwrap();
    let gate = ScheduleGate::new(store.clone(), target, 30);
    let at = |h, m| Utc.with_ymd_and_hms(2026, 10, 19, h, m, 0).unwrap();

    assert!(gate.evaluate_at(false, at(6, 20)).unwrap().should_run);
    assert!(!gate.evaluate_at(false, at(7, 0)).unwrap().should_run);

    let run = store.insert_run(RunKind::Scheduled, 1, "host", at(6, 1)).unwrap();
    store
        .complete_run(
            run.id,
            &etl_healer::types::RunCompletion {
                status: RunStatus::Success,
                records_extracted: 1,
                records_saved: 1,
                memory_peak_mb: None,
                error_message: None,
            },
            at(6, 5),
        )
        .unwrap();
    assert!(!gate.evaluate_at(false, at(6, 10)).unwrap().should_run);
    assert!(gate.evaluate_at(true, at(6, 10)).unwrap().should_run);
}

// =============================================================================
// Pipeline through retry and recovery
// =============================================================================

#[tokio::test]
async fn test_transient_failure_retries_inline_then_succeeds() {
    let store = StateStore::in_memory().unwrap();
    let sink = Arc::new(CountingSink::default());
    let source = Arc::new(FlakySource::new(
        "stock",
        2,
        ErrorType::NetworkTimeout,
        vec![json!({"sku": "A", "qty": 3}), json!({"sku": "B", "qty": 0})],
    ));
    let pipeline = runner(&store, sink.clone(), vec![source.clone() as Arc<dyn Extractor>]);

    let summary = pipeline.run(&options(false)).await.unwrap();
    assert_eq!(summary.run.status, RunStatus::Success);
    assert_eq!(summary.run.records_saved, 2);
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    assert!(store.open_attempts(None).unwrap().is_empty());
    assert!(store.unresolved_critical_errors(None).unwrap().is_empty());
    assert_eq!(store.count_inventory(Some("stock")).unwrap(), 2);
    assert_eq!(sink.delivered.load(Ordering::SeqCst), 0);

    let fallback = FallbackDataStore::new(store.clone(), 72);
    assert_eq!(fallback.entries(Some("stock"), 48, Utc::now()).unwrap().len(), 1);
}

#[tokio::test]
async fn test_terminal_failure_escalates_to_recovery_and_run_is_partial() {
    let store = StateStore::in_memory().unwrap();
    let sink = Arc::new(CountingSink::default());
    let good: Arc<dyn Extractor> = Arc::new(FlakySource::new("stock", 0, ErrorType::AnyError, vec![json!({"sku": "A"})]));
    let bad: Arc<dyn Extractor> = Arc::new(FlakySource::new("sales", usize::MAX, ErrorType::AuthenticationFailed, vec![]));
    let pipeline = runner(&store, sink.clone(), vec![good, bad, Arc::new(OfflineSource) as Arc<dyn Extractor>]);

    let summary = pipeline.run(&options(false)).await.unwrap();
    assert_eq!(summary.run.status, RunStatus::PartialSuccess);
    assert!(summary.run.error_message.unwrap().contains("extract:sales"));
    assert_eq!(summary.sources[2].status, SourceStatus::Unavailable);

    let critical = store.get_critical_error(1).unwrap().unwrap();
    assert_eq!(critical.run_id, Some(summary.run.id));
    assert_eq!(critical.operation_type, "extract:sales");
    assert_eq!(critical.error_type, ErrorType::AuthenticationFailed);
    assert!(critical.recovery_attempted);
    assert_eq!(critical.procedure_name.as_deref(), Some("authentication_failed"));
    // Terminal errors never open a retry attempt.
    assert!(store.open_attempts(None).unwrap().is_empty());
    assert!(sink.delivered.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_exhausted_source_queues_restart() {
    let store = StateStore::in_memory().unwrap();
    let sink = Arc::new(CountingSink::default());
    let flaky = Arc::new(FlakySource::new("stock", usize::MAX, ErrorType::NetworkTimeout, vec![]));
    let pipeline = runner(&store, sink, vec![flaky.clone() as Arc<dyn Extractor>]);

    let summary = pipeline.run(&options(false)).await.unwrap();
    assert_eq!(summary.run.status, RunStatus::Failed);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

    // The network_timeout procedure closes the attempts and queues a restart.
    let pending = store.pending_restart_requests().unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].critical_error_id.is_some());
    assert!(store.open_attempts(None).unwrap().is_empty());
    assert!(store.unresolved_critical_errors(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_run_fails_runs_orphaned_by_dead_holder() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path().join("state.db")).unwrap();
    let path = dir.path().join("etl.lock");

    // A crashed process took the lock and started a run.
    let dead = dead_pid();
    FileLockManager::new(&path, store.clone(), Arc::new(SystemProcessTable))
        .with_identity(dead, "crashed")
        .acquire()
        .unwrap();
    let orphan = store.insert_run(RunKind::Scheduled, dead, "crashed", Utc::now()).unwrap();

    let lock = FileLockManager::new(&path, store.clone(), Arc::new(SystemProcessTable));
    lock.acquire().unwrap();
    assert!(store.running_runs().unwrap().is_empty());

    // A leftover row is also swept by the runner itself.
    let leftover = store.insert_run(RunKind::Scheduled, dead, "crashed", Utc::now()).unwrap();
    let source = Arc::new(RunningCountSource {
        store: store.clone(),
        seen: AtomicUsize::new(0),
    });
    let pipeline = runner(&store, Arc::new(CountingSink::default()), vec![source.clone() as Arc<dyn Extractor>]);
    let summary = pipeline.run(&options(false)).await.unwrap();
    lock.release().unwrap();

    assert_eq!(source.seen.load(Ordering::SeqCst), 1);
    assert_eq!(summary.run.status, RunStatus::Success);
    assert!(store.running_runs().unwrap().is_empty());
    for id in [orphan.id, leftover.id] {
        let run = store.get_run(id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("stalled: holder died"));
    }
}

#[tokio::test]
async fn test_aborted_run_is_completed_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state.db");
    let store = StateStore::open(&db_path).unwrap();
    let source: Arc<dyn Extractor> = Arc::new(SchemaBreakingSource { db_path });
    let pipeline = runner(&store, Arc::new(CountingSink::default()), vec![source]);

    assert!(pipeline.run(&options(false)).await.is_err());

    assert!(store.running_runs().unwrap().is_empty());
    let run = store.recent_runs(1).unwrap().remove(0);
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_message.unwrap().starts_with("aborted:"));
}

#[tokio::test]
async fn test_dry_run_extracts_without_loading() {
    let store = StateStore::in_memory().unwrap();
    let source = Arc::new(FlakySource::new("stock", 0, ErrorType::AnyError, vec![json!({"sku": "A"})]));
    let pipeline = runner(&store, Arc::new(CountingSink::default()), vec![source as Arc<dyn Extractor>]);

    let summary = pipeline.run(&options(true)).await.unwrap();
    assert_eq!(summary.run.status, RunStatus::Success);
    assert_eq!(summary.run.records_extracted, 1);
    assert_eq!(summary.run.records_saved, 0);
    assert_eq!(store.count_inventory(None).unwrap(), 0);
    assert!(FallbackDataStore::new(store.clone(), 72)
        .entries(None, 48, Utc::now())
        .unwrap()
        .is_empty());
}

// =============================================================================
// Fallback restore
// =============================================================================

#[tokio::test]
async fn test_restore_dry_run_and_real_run_usage_counts() {
    let store = StateStore::in_memory().unwrap();
    let fallback = FallbackDataStore::new(store.clone(), 72);
    let now = Utc::now();
    let entry = fallback.save_snapshot("stock", &json!([{"sku": "A"}]), now).unwrap();
    let loader = StoreLoader::new(store.clone());

    fallback.restore(&loader, None, 48, true, now).await.unwrap();
    assert_eq!(store.get_fallback(entry.id).unwrap().unwrap().usage_count, 0);

    fallback.restore(&loader, None, 48, false, now).await.unwrap();
    assert_eq!(store.get_fallback(entry.id).unwrap().unwrap().usage_count, 1);
    assert_eq!(store.count_inventory(Some("stock")).unwrap(), 1);
}

// =============================================================================
// Production wiring
// =============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_services_run_configured_command_source() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = HealerConfig::default();
    config.paths.data_dir = dir.path().to_path_buf();
    config.pipeline.sources = vec![SourceConfig {
        name: "stock".to_string(),
        command: "sh".to_string(),
        args: vec!["-c".to_string(), r#"echo '[{"sku":"A","warehouse":"WH-1"},{"sku":"B","warehouse":"WH-2"}]'"#.to_string()],
        timeout_secs: 10,
    }];
    let services = Services::with_sink(config, Arc::new(CountingSink::default())).unwrap();

    services.lock.acquire().unwrap();
    let options = RunOptions {
        kind: RunKind::Scheduled,
        dry_run: false,
        filters: Filters {
            warehouse: Some("WH-1".to_string()),
            product: None,
        },
        consume_restarts: true,
    };
    let summary = services.pipeline().run(&options).await.unwrap();
    assert!(services.lock.release().unwrap());

    assert_eq!(summary.run.status, RunStatus::Success);
    assert_eq!(summary.run.records_saved, 1);
    assert!(summary.run.duration_secs.is_some());

    let status = services.manual().status().unwrap();
    assert_eq!(status.recent_runs.len(), 1);
    assert!(!status.lock.is_held());
}
