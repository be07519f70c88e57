//! SQLite-backed persisted state shared by the scheduler, the health monitor
//! and the manual recovery tool.
//!
//! All three binaries open the same database file. WAL mode plus a busy
//! timeout lets them interleave short transactions without a server.

mod critical;
mod fallback;
mod logs;
mod monitoring;
mod procedures;
mod retries;
mod runs;
mod status;

pub use monitoring::StoredHealthResult;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, Transaction};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{HealerError, Result};

/// Tables every component expects to exist.
pub const REQUIRED_TABLES: &[&str] = &[
    "etl_runs",
    "etl_retry_attempts",
    "etl_critical_errors",
    "etl_recovery_procedures",
    "etl_status",
    "etl_restart_requests",
    "health_check_results",
    "alert_records",
    "fallback_data",
    "daemon_stats",
    "etl_logs",
    "inventory_records",
];

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS etl_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    duration_secs REAL,
    records_extracted INTEGER NOT NULL DEFAULT 0,
    records_saved INTEGER NOT NULL DEFAULT 0,
    memory_peak_mb REAL,
    error_message TEXT,
    pid INTEGER NOT NULL,
    host TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_etl_runs_status ON etl_runs (status, started_at);

CREATE TABLE IF NOT EXISTS etl_retry_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL,
    operation_type TEXT NOT NULL,
    error_type TEXT NOT NULL,
    attempt_number INTEGER NOT NULL,
    max_attempts INTEGER NOT NULL,
    next_retry_at TEXT,
    last_error TEXT,
    is_exhausted INTEGER NOT NULL DEFAULT 0,
    is_completed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    CHECK (is_completed = 1 OR attempt_number <= max_attempts)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_retry_open
    ON etl_retry_attempts (run_id, operation_type) WHERE is_completed = 0;

CREATE TABLE IF NOT EXISTS etl_critical_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER,
    operation_type TEXT NOT NULL,
    error_type TEXT NOT NULL,
    message TEXT NOT NULL,
    recovery_attempted INTEGER NOT NULL DEFAULT 0,
    recovery_successful INTEGER NOT NULL DEFAULT 0,
    procedure_name TEXT,
    resolution TEXT,
    created_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE TABLE IF NOT EXISTS etl_recovery_procedures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    trigger_condition TEXT NOT NULL,
    recovery_steps TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    last_executed_at TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS etl_status (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    is_running INTEGER NOT NULL DEFAULT 0,
    pid INTEGER,
    host TEXT,
    run_id INTEGER,
    started_at TEXT
);
INSERT OR IGNORE INTO etl_status (id, is_running) VALUES (1, 0);

CREATE TABLE IF NOT EXISTS etl_restart_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    requested_at TEXT NOT NULL,
    run_after TEXT NOT NULL,
    reason TEXT NOT NULL,
    critical_error_id INTEGER,
    consumed_at TEXT,
    consumed_by_run INTEGER
);

CREATE TABLE IF NOT EXISTS health_check_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    checked_at TEXT NOT NULL,
    overall_status TEXT NOT NULL,
    checks TEXT NOT NULL,
    recommendations TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS alert_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_type TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    delivered INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alert_records_type_level
    ON alert_records (alert_type, level, created_at);

CREATE TABLE IF NOT EXISTS fallback_data (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    data_type TEXT NOT NULL,
    data_key TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 0,
    UNIQUE (data_type, data_key)
);

CREATE TABLE IF NOT EXISTS daemon_stats (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    pid INTEGER,
    started_at TEXT,
    last_check_at TEXT,
    last_status TEXT,
    checks_performed INTEGER NOT NULL DEFAULT 0,
    alerts_sent INTEGER NOT NULL DEFAULT 0,
    stopped_at TEXT
);
INSERT OR IGNORE INTO daemon_stats (id) VALUES (1);

CREATE TABLE IF NOT EXISTS etl_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    logged_at TEXT NOT NULL,
    level TEXT NOT NULL,
    component TEXT NOT NULL,
    run_id INTEGER,
    message TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS inventory_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    data_type TEXT NOT NULL,
    record_key TEXT NOT NULL,
    payload TEXT NOT NULL,
    run_id INTEGER,
    loaded_at TEXT NOT NULL,
    UNIQUE (data_type, record_key)
);
";

/// Handle to the state database. Cheap to clone.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").field("path", &self.path).finish()
    }
}

impl StateStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| HealerError::io(parent, e))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "Configured journal mode");
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        };
        store.bootstrap()?;
        info!(path = %path.display(), "State store opened");
        Ok(store)
    }

    /// Open a private in-memory database (tests, dry runs).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        };
        store.bootstrap()?;
        Ok(store)
    }

    /// Database file location, `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn bootstrap(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch(SCHEMA))?;
        let seeded = self.seed_default_procedures(Utc::now())?;
        if seeded > 0 {
            debug!(seeded, "Seeded default recovery procedures");
        }
        Ok(())
    }

    /// Run `f` against the connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock().map_err(|_| HealerError::Poisoned)?;
        Ok(f(&conn)?)
    }

    /// Run `f` inside a transaction, committing on success.
    pub(crate) fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().map_err(|_| HealerError::Poisoned)?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Round-trip a trivial query and report its latency.
    pub fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))?;
        Ok(started.elapsed())
    }

    /// Required tables that are absent from the schema.
    pub fn missing_tables(&self) -> Result<Vec<&'static str>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
            let mut missing = vec![];
            for table in REQUIRED_TABLES {
                let count: i64 = stmt.query_row([table], |row| row.get(0))?;
                if count == 0 {
                    missing.push(*table);
                }
            }
            Ok(missing)
        })
    }
}

/// Read a text column and parse it with `FromStr`.
pub(crate) fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// Read a JSON text column.
pub(crate) fn json_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Cutoff timestamp `days` before `now`.
#[must_use]
pub fn days_ago(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    now - chrono::Duration::days(i64::from(days))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_store_has_full_schema() {
        let store = StateStore::in_memory().unwrap();
        assert!(store.missing_tables().unwrap().is_empty());
        assert!(store.ping().unwrap() < Duration::from_secs(1));
    }

    #[test]
    fn test_open_creates_parent_dirs_and_is_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state.db");
        {
            let store = StateStore::open(&path).unwrap();
            assert_eq!(store.path(), Some(path.as_path()));
        }
        let store = StateStore::open(&path).unwrap();
        assert!(store.missing_tables().unwrap().is_empty());
    }

    #[test]
    fn test_missing_table_is_reported() {
        let store = StateStore::in_memory().unwrap();
        store
            .with_conn(|conn| conn.execute_batch("DROP TABLE alert_records"))
            .unwrap();
        assert_eq!(store.missing_tables().unwrap(), vec!["alert_records"]);
    }
}
