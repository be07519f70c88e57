//! Sequential extract → transform → load → post-process runs.
//!
//! Sources are injected as [`Extractor`]s and the destination as a
//! [`Loader`]. Every stage failure goes through the retry manager; failures
//! that exhaust their budget (or are terminal) become critical errors handed
//! to the recovery engine, and the source is skipped.

use async_trait::async_trait;
use chrono::Utc;
use etl_config::SourceConfig;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::{HealerError, Result};
use crate::fallback::FallbackDataStore;
use crate::lock::STALLED_HOLDER_DIED;
use crate::process::{self, ProcessTable, SystemProcessTable};
use crate::recovery::RecoveryEngine;
use crate::retry::{RetryDecision, RetryManager};
use crate::store::StateStore;
use crate::types::{ErrorType, NewCriticalError, Run, RunCompletion, RunId, RunKind, RunStatus};

// =============================================================================
// Collaborator contracts
// =============================================================================

/// Extraction failure with its category.
#[derive(Debug, Clone, Error)]
#[error("{error_type}: {message}")]
pub struct ExtractError {
    pub error_type: ErrorType,
    pub message: String,
}

impl ExtractError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }

    /// Build from free-form failure text.
    pub fn classified(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorType::classify(&message), message)
    }
}

/// Load failure.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Store(#[from] HealerError),

    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

impl LoadError {
    #[must_use]
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Store(e) => e.error_type(),
            Self::InvalidRecord(_) => ErrorType::AnyError,
        }
    }
}

/// Record filters from `--warehouse` / `--product`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Filters {
    pub warehouse: Option<String>,
    pub product: Option<String>,
}

impl Filters {
    /// Whether `record` passes every set filter. Records without the field pass.
    #[must_use]
    pub fn matches(&self, record: &Value) -> bool {
        let field_ok = |wanted: &Option<String>, keys: &[&str]| match wanted {
            None => true,
            Some(wanted) => keys
                .iter()
                .find_map(|k| record.get(*k))
                .and_then(Value::as_str)
                .is_none_or(|v| v == wanted),
        };
        field_ok(&self.warehouse, &["warehouse", "warehouse_code"])
            && field_ok(&self.product, &["sku", "product", "product_sku"])
    }
}

/// A data source.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    async fn is_available(&self) -> bool;

    async fn extract(&self, filters: &Filters) -> std::result::Result<Vec<Value>, ExtractError>;
}

/// The destination for extracted records.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Write `records` of `data_type`. Returns how many were saved.
    async fn load(&self, data_type: &str, records: &[Value]) -> std::result::Result<u64, LoadError>;
}

// =============================================================================
// Production adapters
// =============================================================================

/// Runs an external command whose stdout is a JSON array of records.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    name: String,
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExtractor {
    #[must_use]
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            timeout,
        }
    }

    #[must_use]
    pub fn from_config(source: &SourceConfig) -> Self {
        Self::new(
            &source.name,
            &source.command,
            source.args.clone(),
            Duration::from_secs(source.timeout_secs),
        )
    }

    fn resolve(&self) -> Option<std::path::PathBuf> {
        let command = Path::new(&self.command);
        if command.components().count() > 1 {
            return command.is_file().then(|| command.to_path_buf());
        }
        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(&self.command))
            .find(|candidate| candidate.is_file())
    }
}

#[async_trait]
impl Extractor for CommandExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        self.resolve().is_some()
    }

    async fn extract(&self, filters: &Filters) -> std::result::Result<Vec<Value>, ExtractError> {
        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(warehouse) = &filters.warehouse {
            cmd.env("ETL_WAREHOUSE", warehouse);
        }
        if let Some(product) = &filters.product {
            cmd.env("ETL_PRODUCT", product);
        }

        debug!(source = %self.name, command = %self.command, "Running extractor command");
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ExtractError::classified(format!("failed to run {}: {e}", self.command)));
            }
            Err(_) => {
                return Err(ExtractError::new(
                    ErrorType::NetworkTimeout,
                    format!("{} timed out after {}s", self.name, self.timeout.as_secs()),
                ));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!("{} exited with {}: {}", self.name, output.status, stderr.trim());
            return Err(ExtractError::classified(message));
        }

        match serde_json::from_slice::<Value>(&output.stdout) {
            Ok(Value::Array(records)) => Ok(records),
            Ok(other) => Err(ExtractError::new(
                ErrorType::AnyError,
                format!("{} printed {} instead of a JSON array", self.name, json_kind(&other)),
            )),
            Err(e) => Err(ExtractError::new(
                ErrorType::AnyError,
                format!("{} printed invalid JSON: {e}", self.name),
            )),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Writes records into the `inventory_records` table.
#[derive(Debug, Clone)]
pub struct StoreLoader {
    store: StateStore,
    run_id: Option<RunId>,
}

impl StoreLoader {
    #[must_use]
    pub fn new(store: StateStore) -> Self {
        Self { store, run_id: None }
    }

    /// Tag written rows with `run_id`.
    #[must_use]
    pub fn for_run(&self, run_id: RunId) -> Self {
        Self {
            store: self.store.clone(),
            run_id: Some(run_id),
        }
    }
}

/// Stable key for a record: its `id`, `sku` or `key` field, else the record text.
fn record_key(record: &Value) -> String {
    ["id", "sku", "key"]
        .iter()
        .find_map(|k| match record.get(*k)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| record.to_string())
}

#[async_trait]
impl Loader for StoreLoader {
    async fn load(&self, data_type: &str, records: &[Value]) -> std::result::Result<u64, LoadError> {
        if let Some(bad) = records.iter().find(|r| !r.is_object()) {
            return Err(LoadError::InvalidRecord(format!("expected an object, got {bad}")));
        }
        let keyed: Vec<(String, Value)> = records.iter().map(|r| (record_key(r), r.clone())).collect();
        let written = self.store.upsert_inventory(data_type, &keyed, self.run_id, Utc::now())?;
        Ok(written as u64)
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Per-invocation options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub kind: RunKind,
    pub dry_run: bool,
    pub filters: Filters,
    /// Mark due restart requests as consumed by this run
    pub consume_restarts: bool,
}

/// How one source fared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Loaded,
    /// Extracted only
    DryRun,
    Failed,
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub name: String,
    pub status: SourceStatus,
    pub extracted: u64,
    pub saved: u64,
    pub error: Option<String>,
}

/// Result of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run: Run,
    pub sources: Vec<SourceReport>,
}

/// A stage failure that left the retry path.
struct Escalated {
    error_type: ErrorType,
    message: String,
}

/// Runs sources one after another through the retry and recovery path.
pub struct PipelineRunner {
    store: StateStore,
    retry: RetryManager,
    recovery: Arc<RecoveryEngine>,
    fallback: FallbackDataStore,
    extractors: Vec<Arc<dyn Extractor>>,
    loader: LoaderChoice,
    processes: Arc<dyn ProcessTable>,
    max_inline_wait: Duration,
}

/// The default loader is bound to the run id once the run exists.
enum LoaderChoice {
    Store(StoreLoader),
    Custom(Arc<dyn Loader>),
}

impl PipelineRunner {
    #[must_use]
    pub fn new(
        store: StateStore,
        retry: RetryManager,
        recovery: Arc<RecoveryEngine>,
        fallback: FallbackDataStore,
        extractors: Vec<Arc<dyn Extractor>>,
    ) -> Self {
        Self {
            loader: LoaderChoice::Store(StoreLoader::new(store.clone())),
            store,
            retry,
            recovery,
            fallback,
            extractors,
            processes: Arc::new(SystemProcessTable),
            max_inline_wait: Duration::from_secs(900),
        }
    }

    /// Replace the default store loader.
    #[must_use]
    pub fn with_loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = LoaderChoice::Custom(loader);
        self
    }

    /// Liveness source used to fail runs orphaned by dead processes.
    #[must_use]
    pub fn with_process_table(mut self, processes: Arc<dyn ProcessTable>) -> Self {
        self.processes = processes;
        self
    }

    /// Longest backoff slept through inline; longer delays escalate.
    #[must_use]
    pub fn with_max_inline_wait(mut self, max_inline_wait: Duration) -> Self {
        self.max_inline_wait = max_inline_wait;
        self
    }

    /// Execute one run end to end.
    ///
    /// The caller holds the execution lock. A run that aborts with an error is
    /// still completed as `failed` before the error is returned.
    pub async fn run(&self, options: &RunOptions) -> Result<RunSummary> {
        let started = Utc::now();
        let orphaned = self
            .store
            .fail_orphaned_runs(|pid| self.processes.is_alive(pid), STALLED_HOLDER_DIED, started)?;
        if !orphaned.is_empty() {
            warn!(runs = ?orphaned, "Failed runs left behind by dead processes");
        }

        let run = self
            .store
            .insert_run(options.kind, process::current_pid(), &process::host_name(), started)?;
        info!(
            run_id = run.id,
            kind = options.kind.as_str(),
            dry_run = options.dry_run,
            sources = self.extractors.len(),
            "Pipeline run started"
        );

        match self.execute(run.id, options).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!(run_id = run.id, error = %e, "Pipeline run aborted");
                let aborted = RunCompletion {
                    status: RunStatus::Failed,
                    records_extracted: 0,
                    records_saved: 0,
                    memory_peak_mb: process::current_memory_mb(),
                    error_message: Some(format!("aborted: {e}")),
                };
                if let Err(complete_err) = self.store.complete_run(run.id, &aborted, Utc::now()) {
                    warn!(run_id = run.id, error = %complete_err, "Failed to mark aborted run as failed");
                }
                Err(e)
            }
        }
    }

    async fn execute(&self, run_id: RunId, options: &RunOptions) -> Result<RunSummary> {
        let started = Utc::now();
        self.store.set_running_run(run_id)?;
        if options.consume_restarts {
            let consumed = self.store.consume_due_restart_requests(run_id, started)?;
            debug!(run_id, consumed, "Consumed due restart requests");
        }

        let loader: Arc<dyn Loader> = match &self.loader {
            LoaderChoice::Store(store_loader) => Arc::new(store_loader.for_run(run_id)),
            LoaderChoice::Custom(loader) => loader.clone(),
        };

        let mut peak_memory = process::current_memory_mb();
        let mut reports = Vec::with_capacity(self.extractors.len());
        for extractor in &self.extractors {
            let report = self.run_source(run_id, extractor.as_ref(), loader.as_ref(), options).await?;
            peak_memory = max_opt(peak_memory, process::current_memory_mb());
            reports.push(report);
        }

        let completion = completion(&reports, peak_memory);
        let run = self.store.complete_run(run_id, &completion, Utc::now())?;
        match run.status {
            RunStatus::Success => info!(
                run_id = run.id,
                extracted = run.records_extracted,
                saved = run.records_saved,
                duration_secs = ?run.duration_secs,
                "Pipeline run succeeded"
            ),
            status => warn!(
                run_id = run.id,
                %status,
                error = ?run.error_message,
                "Pipeline run did not fully succeed"
            ),
        }
        Ok(RunSummary { run, sources: reports })
    }

    async fn run_source(
        &self,
        run_id: RunId,
        extractor: &dyn Extractor,
        loader: &dyn Loader,
        options: &RunOptions,
    ) -> Result<SourceReport> {
        let name = extractor.name().to_string();
        let mut report = SourceReport {
            name: name.clone(),
            status: SourceStatus::Failed,
            extracted: 0,
            saved: 0,
            error: None,
        };

        if !extractor.is_available().await {
            warn!(source = %name, "Source unavailable, skipping");
            report.status = SourceStatus::Unavailable;
            return Ok(report);
        }

        // Extract
        let operation = format!("extract:{name}");
        let extracted = self
            .with_retry(run_id, &operation, || async {
                extractor
                    .extract(&options.filters)
                    .await
                    .map_err(|e| (e.error_type, e.message))
            })
            .await?;
        let records = match extracted {
            Ok(records) => records,
            Err(escalated) => {
                report.error = Some(format!("{operation}: {}", escalated.message));
                return Ok(report);
            }
        };

        // Transform
        let total = records.len();
        let records: Vec<Value> = records.into_iter().filter(|r| options.filters.matches(r)).collect();
        report.extracted = records.len() as u64;
        debug!(source = %name, total, kept = records.len(), "Applied filters");

        if options.dry_run {
            info!(source = %name, records = records.len(), "Dry run, skipping load");
            report.status = SourceStatus::DryRun;
            return Ok(report);
        }

        // Load
        let operation = format!("load:{name}");
        let loaded = self
            .with_retry(run_id, &operation, || async {
                loader
                    .load(&name, &records)
                    .await
                    .map_err(|e| (e.error_type(), e.to_string()))
            })
            .await?;
        match loaded {
            Ok(saved) => report.saved = saved,
            Err(escalated) => {
                report.error = Some(format!("{operation}: {}", escalated.message));
                return Ok(report);
            }
        }

        // Post-process
        if let Err(e) = self
            .fallback
            .save_snapshot(&name, &Value::Array(records), Utc::now())
        {
            warn!(source = %name, error = %e, "Failed to save fallback snapshot");
        }

        report.status = SourceStatus::Loaded;
        info!(source = %name, extracted = report.extracted, saved = report.saved, "Source loaded");
        Ok(report)
    }

    /// Run `op` until it succeeds, sleeping through short backoffs.
    /// Escalations are recorded and recovered before returning `Err`.
    async fn with_retry<T, F, Fut>(
        &self,
        run_id: RunId,
        operation: &str,
        mut op: F,
    ) -> Result<std::result::Result<T, Escalated>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, (ErrorType, String)>>,
    {
        loop {
            let (error_type, message) = match op().await {
                Ok(value) => {
                    self.retry.mark_succeeded(run_id, operation, Utc::now())?;
                    return Ok(Ok(value));
                }
                Err(failure) => failure,
            };

            warn!(run_id, operation, error_type = %error_type, %message, "Operation failed");
            if let Err(e) = self.store.append_log(
                "error",
                "pipeline",
                Some(run_id),
                &format!("{operation} failed ({error_type}): {message}"),
                Utc::now(),
            ) {
                warn!(error = %e, "Failed to mirror failure into the log table");
            }

            let now = Utc::now();
            match self.retry.record_failure(run_id, operation, error_type, &message, now)? {
                RetryDecision::RetryAt { attempt, next_retry_at } => {
                    let wait = (next_retry_at - now).to_std().unwrap_or(Duration::ZERO);
                    if wait > self.max_inline_wait {
                        warn!(
                            run_id,
                            operation,
                            wait_secs = wait.as_secs(),
                            "Backoff exceeds inline wait limit, escalating"
                        );
                    } else {
                        info!(
                            run_id,
                            operation,
                            attempt = attempt.attempt_number,
                            max_attempts = attempt.max_attempts,
                            wait_secs = wait.as_secs(),
                            "Retrying after backoff"
                        );
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                }
                RetryDecision::Exhausted { .. } | RetryDecision::Escalate(_) => {}
            }

            return Ok(Err(self.escalate(run_id, operation, error_type, message).await?));
        }
    }

    async fn escalate(
        &self,
        run_id: RunId,
        operation: &str,
        error_type: ErrorType,
        message: String,
    ) -> Result<Escalated> {
        self.retry.mark_exhausted(run_id, operation, Utc::now())?;
        let new = NewCriticalError {
            run_id: Some(run_id),
            operation_type: operation.to_string(),
            error_type,
            message: message.clone(),
        };
        let (critical, outcome) = self.recovery.handle(new).await?;
        if outcome.success {
            info!(critical_error_id = critical.id, procedure = ?outcome.procedure_name, "Recovery completed");
        } else {
            error!(critical_error_id = critical.id, procedure = ?outcome.procedure_name, "Recovery failed");
        }
        Ok(Escalated { error_type, message })
    }
}

fn max_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn completion(reports: &[SourceReport], memory_peak_mb: Option<f64>) -> RunCompletion {
    let attempted: Vec<_> = reports
        .iter()
        .filter(|r| r.status != SourceStatus::Unavailable)
        .collect();
    let ok = attempted
        .iter()
        .filter(|r| matches!(r.status, SourceStatus::Loaded | SourceStatus::DryRun))
        .count();

    let status = if attempted.is_empty() || ok == 0 {
        RunStatus::Failed
    } else if ok == attempted.len() {
        RunStatus::Success
    } else {
        RunStatus::PartialSuccess
    };

    let mut errors: Vec<String> = reports.iter().filter_map(|r| r.error.clone()).collect();
    if attempted.is_empty() {
        errors.push("no sources available".to_string());
    }

    RunCompletion {
        status,
        records_extracted: reports.iter().map(|r| r.extracted).sum(),
        records_saved: reports.iter().map(|r| r.saved).sum(),
        memory_peak_mb,
        error_message: (!errors.is_empty()).then(|| errors.join("; ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filters_match_known_fields() {
        let filters = Filters {
            warehouse: Some("WH-1".to_string()),
            product: None,
        };
        assert!(filters.matches(&json!({"warehouse": "WH-1", "sku": "A"})));
        assert!(!filters.matches(&json!({"warehouse": "WH-2"})));
        assert!(filters.matches(&json!({"sku": "A"})));
        assert!(Filters::default().matches(&json!({"anything": 1})));

        let product = Filters {
            warehouse: None,
            product: Some("A".to_string()),
        };
        assert!(product.matches(&json!({"sku": "A"})));
        assert!(!product.matches(&json!({"product_sku": "B"})));
    }

    #[test]
    fn test_record_key_prefers_identifiers() {
        assert_eq!(record_key(&json!({"id": 7, "sku": "A"})), "7");
        assert_eq!(record_key(&json!({"sku": "A"})), "A");
        assert_eq!(record_key(&json!({"qty": 1})), r#"{"qty":1}"#);
    }

    #[test]
    fn test_completion_status_rules() {
        let report = |status| SourceReport {
            name: "s".to_string(),
            status,
            extracted: 2,
            saved: 1,
            error: None,
        };
        let all = completion(&[report(SourceStatus::Loaded), report(SourceStatus::Loaded)], None);
        assert_eq!(all.status, RunStatus::Success);
        assert_eq!(all.records_extracted, 4);

        let some = completion(&[report(SourceStatus::Loaded), report(SourceStatus::Failed)], None);
        assert_eq!(some.status, RunStatus::PartialSuccess);

        let none = completion(&[report(SourceStatus::Failed)], None);
        assert_eq!(none.status, RunStatus::Failed);

        let unavailable = completion(&[report(SourceStatus::Unavailable)], None);
        assert_eq!(unavailable.status, RunStatus::Failed);
        assert_eq!(unavailable.error_message.as_deref(), Some("no sources available"));
    }

    #[tokio::test]
    async fn test_store_loader_rejects_non_objects() {
        let store = StateStore::in_memory().unwrap();
        let loader = StoreLoader::new(store.clone()).for_run(3);
        assert_eq!(loader.load("stock", &[json!({"sku": "A"}), json!({"sku": "B"})]).await.unwrap(), 2);
        assert!(matches!(
            loader.load("stock", &[json!(42)]).await,
            Err(LoadError::InvalidRecord(_))
        ));
        assert_eq!(store.count_inventory(Some("stock")).unwrap(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_extractor_parses_stdout() {
        let ok = CommandExtractor::new(
            "stock",
            "sh",
            vec!["-c".to_string(), r#"echo '[{"sku":"A"},{"sku":"B"}]'"#.to_string()],
            Duration::from_secs(10),
        );
        assert!(ok.is_available().await);
        assert_eq!(ok.extract(&Filters::default()).await.unwrap().len(), 2);

        let failing = CommandExtractor::new(
            "sales",
            "sh",
            vec!["-c".to_string(), "echo 'HTTP 429 Too Many Requests' >&2; exit 3".to_string()],
            Duration::from_secs(10),
        );
        let err = failing.extract(&Filters::default()).await.unwrap_err();
        assert_eq!(err.error_type, ErrorType::ApiRateLimit);

        let missing = CommandExtractor::new("x", "definitely-not-a-real-binary", vec![], Duration::from_secs(1));
        assert!(!missing.is_available().await);
    }
}
