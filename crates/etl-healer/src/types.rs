//! Persisted domain types shared by every component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Primary key of an ETL run.
pub type RunId = i64;

// =============================================================================
// Runs
// =============================================================================

/// How a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Scheduled,
    Manual,
    /// Started from a queued restart request
    Restart,
}

impl RunKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
            Self::Restart => "restart",
        }
    }
}

impl FromStr for RunKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            "restart" => Ok(Self::Restart),
            other => Err(format!("unknown run kind: {other}")),
        }
    }
}

/// Lifecycle state of a run. Transitions exactly once out of `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    PartialSuccess,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "partial_success" => Ok(Self::PartialSuccess),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub kind: RunKind,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub records_extracted: u64,
    pub records_saved: u64,
    pub memory_peak_mb: Option<f64>,
    pub error_message: Option<String>,
    pub pid: u32,
    pub host: String,
}

/// Terminal values written when a run finishes.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub records_extracted: u64,
    pub records_saved: u64,
    pub memory_peak_mb: Option<f64>,
    pub error_message: Option<String>,
}

// =============================================================================
// Error taxonomy
// =============================================================================

/// Broad class of an [`ErrorType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Likely to succeed on retry
    Transient,
    /// Retrying without intervention is pointless
    Terminal,
    /// Shared infrastructure (database) went away
    Infrastructure,
    /// Unclassified
    CatchAll,
}

/// Failure categories understood by retry policies and recovery procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    NetworkTimeout,
    ApiRateLimit,
    AuthenticationFailed,
    DatabaseConnectionLost,
    FileDownloadFailed,
    ReportGenerationTimeout,
    MemoryExhausted,
    DiskSpaceFull,
    AnyError,
}

impl ErrorType {
    /// Every known error type.
    pub const ALL: [Self; 9] = [
        Self::NetworkTimeout,
        Self::ApiRateLimit,
        Self::AuthenticationFailed,
        Self::DatabaseConnectionLost,
        Self::FileDownloadFailed,
        Self::ReportGenerationTimeout,
        Self::MemoryExhausted,
        Self::DiskSpaceFull,
        Self::AnyError,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network_timeout",
            Self::ApiRateLimit => "api_rate_limit",
            Self::AuthenticationFailed => "authentication_failed",
            Self::DatabaseConnectionLost => "database_connection_lost",
            Self::FileDownloadFailed => "file_download_failed",
            Self::ReportGenerationTimeout => "report_generation_timeout",
            Self::MemoryExhausted => "memory_exhausted",
            Self::DiskSpaceFull => "disk_space_full",
            Self::AnyError => "any_error",
        }
    }

    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::NetworkTimeout
            | Self::ApiRateLimit
            | Self::FileDownloadFailed
            | Self::ReportGenerationTimeout => ErrorCategory::Transient,
            Self::AuthenticationFailed | Self::MemoryExhausted | Self::DiskSpaceFull => {
                ErrorCategory::Terminal
            }
            Self::DatabaseConnectionLost => ErrorCategory::Infrastructure,
            Self::AnyError => ErrorCategory::CatchAll,
        }
    }

    /// Terminal errors skip the retry budget and go straight to recovery.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Terminal)
    }

    /// Map free-form failure text onto a category.
    #[must_use]
    pub fn classify(message: &str) -> Self {
        let msg = message.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

        if has(&["429", "rate limit", "too many requests", "quota"]) {
            Self::ApiRateLimit
        } else if has(&["401", "403", "unauthorized", "forbidden", "authentication", "invalid api key", "credentials"]) {
            Self::AuthenticationFailed
        } else if has(&["no space left", "disk full", "disk space", "enospc"]) {
            Self::DiskSpaceFull
        } else if has(&["out of memory", "memory exhausted", "cannot allocate", "oomkilled"]) {
            Self::MemoryExhausted
        } else if has(&["report"]) && has(&["timeout", "timed out", "not ready"]) {
            Self::ReportGenerationTimeout
        } else if has(&["download"]) {
            Self::FileDownloadFailed
        } else if has(&["database", "sqlite", "connection refused", "connection reset", "server has gone away"]) {
            Self::DatabaseConnectionLost
        } else if has(&["timeout", "timed out", "dns", "unreachable"]) {
            Self::NetworkTimeout
        } else {
            Self::AnyError
        }
    }
}

impl FromStr for ErrorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown error type: {s}"))
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Retry attempts and critical errors
// =============================================================================

/// Failure history of one operation within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub id: i64,
    pub run_id: RunId,
    pub operation_type: String,
    pub error_type: ErrorType,
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Budget used up; the caller must escalate
    pub is_exhausted: bool,
    pub is_completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A failure that needs recovery-procedure evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalError {
    pub id: i64,
    pub run_id: Option<RunId>,
    pub operation_type: String,
    pub error_type: ErrorType,
    pub message: String,
    pub recovery_attempted: bool,
    pub recovery_successful: bool,
    pub procedure_name: Option<String>,
    /// `recovered` or `operator`
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Input for recording a critical error.
#[derive(Debug, Clone)]
pub struct NewCriticalError {
    pub run_id: Option<RunId>,
    pub operation_type: String,
    pub error_type: ErrorType,
    pub message: String,
}

// =============================================================================
// Recovery procedures
// =============================================================================

/// One stored remediation step. Parsed into a `StepAction` at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStep {
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Abort the procedure if this step fails
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub description: String,
}

impl RecoveryStep {
    pub fn new(step_type: &str, params: serde_json::Value, critical: bool, description: &str) -> Self {
        Self {
            step_type: step_type.to_string(),
            params,
            critical,
            description: description.to_string(),
        }
    }
}

/// A named, ordered remediation bound to a trigger error type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryProcedure {
    pub id: i64,
    pub name: String,
    pub trigger_condition: ErrorType,
    pub recovery_steps: Vec<RecoveryStep>,
    pub is_active: bool,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Running flag, restart queue, daemon statistics
// =============================================================================

/// Persisted half of the execution lock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EtlStatus {
    pub is_running: bool,
    pub pid: Option<u32>,
    pub host: Option<String>,
    pub run_id: Option<RunId>,
    pub started_at: Option<DateTime<Utc>>,
}

/// A durable request to start a run later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartRequest {
    pub id: i64,
    pub requested_at: DateTime<Utc>,
    pub run_after: DateTime<Utc>,
    pub reason: String,
    pub critical_error_id: Option<i64>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub consumed_by_run: Option<RunId>,
}

/// Singleton statistics row written by the health monitor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonStats {
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub checks_performed: u64,
    pub alerts_sent: u64,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl DaemonStats {
    /// Uptime if the daemon is marked as started and not stopped.
    #[must_use]
    pub fn uptime(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        match (self.started_at, self.stopped_at) {
            (Some(started), None) => Some(now - started),
            _ => None,
        }
    }
}

// =============================================================================
// Alerts, fallback data, logs
// =============================================================================

/// A dispatched alert, used for cooldown suppression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: i64,
    pub alert_type: String,
    pub level: String,
    pub message: String,
    pub delivered: bool,
    pub created_at: DateTime<Utc>,
}

/// A cached snapshot of previously good output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackEntry {
    pub id: i64,
    pub data_type: String,
    pub data_key: String,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub usage_count: u64,
}

/// Persisted log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub logged_at: DateTime<Utc>,
    pub level: String,
    pub component: String,
    pub run_id: Option<RunId>,
    pub message: String,
}
