//! Self-healing core of the inventory ETL pipeline.
//!
//! This crate provides:
//! - A liveness-checked single-writer execution lock and the daily schedule gate
//! - Per-operation retry bookkeeping with exponential backoff
//! - Declarative recovery procedures executed for critical errors
//! - A periodic health monitor with cooldown-limited alerting
//! - Operator commands mirroring the automated actions
//! - A fallback cache of recent good data for degraded-mode restores
//! - The sequential pipeline runner tying sources into the retry path
//!
//! All components share one SQLite [`StateStore`], so the scheduler, the
//! monitor and the operator tool can run as separate processes.

pub mod alert;
pub mod audit;
pub mod cleanup;
pub mod error;
pub mod fallback;
pub mod health;
pub mod lock;
pub mod logging;
pub mod manual;
pub mod pipeline;
pub mod process;
pub mod recovery;
pub mod retry;
pub mod schedule;
pub mod services;
pub mod store;
pub mod types;

pub use alert::{AlertGate, AlertOutcome, OperatorNotifier};
pub use audit::{AuditLog, AuditRecord};
pub use error::{HealerError, Result};
pub use fallback::{FallbackDataStore, RestoreReport};
pub use health::{HealthChecker, HealthReport, HealthStatus, MonitorDaemon};
pub use lock::{FileLockManager, LockHolder, LockManager, LockState, MemoryLockManager};
pub use manual::{ManualPaths, ManualRecovery};
pub use pipeline::{
    CommandExtractor, ExtractError, Extractor, Filters, LoadError, Loader, PipelineRunner, RunOptions, RunSummary,
    StoreLoader,
};
pub use process::{PidMarker, ProcessTable, SystemProcessTable};
pub use recovery::{RecoveryEngine, RecoveryOutcome, StepAction};
pub use retry::{RetryDecision, RetryManager, RetryPolicy};
pub use schedule::{GateDecision, GateReason, ScheduleGate};
pub use services::Services;
pub use store::StateStore;
pub use types::{ErrorType, Run, RunId, RunKind, RunStatus};
