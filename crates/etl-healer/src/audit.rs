//! Append-only record of operator actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{HealerError, Result};
use crate::store::StateStore;

/// One line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub operator: String,
    pub command: String,
    pub flags: serde_json::Value,
    /// `ok`, `dry_run`, `aborted` or `failed: <reason>`
    pub outcome: String,
}

impl AuditRecord {
    #[must_use]
    pub fn new(command: &str, flags: serde_json::Value, outcome: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            timestamp: now,
            operator: operator(),
            command: command.to_string(),
            flags,
            outcome: outcome.into(),
        }
    }
}

/// Login name of the invoking user.
#[must_use]
pub fn operator() -> String {
    ["SUDO_USER", "USER", "USERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// JSONL audit file mirrored into the persisted log.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    store: Option<StateStore>,
}

impl AuditLog {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, store: StateStore) -> Self {
        Self {
            path: path.into(),
            store: Some(store),
        }
    }

    /// Audit log without the persisted mirror, for when the store is unavailable.
    #[must_use]
    pub fn file_only(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            store: None,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `record`. The file write must succeed; the log mirror is best effort.
    pub fn append(&self, record: &AuditRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HealerError::io(parent, e))?;
        }
        let line = serde_json::to_string(record)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| HealerError::io(&self.path, e))?;
        writeln!(file, "{line}").map_err(|e| HealerError::io(&self.path, e))?;

        let Some(store) = &self.store else {
            return Ok(());
        };
        let message = format!("{} ran {}: {}", record.operator, record.command, record.outcome);
        if let Err(e) = store.append_log("info", "manual_recovery", None, &message, record.timestamp) {
            warn!(error = %e, "Failed to mirror audit record into the log table");
        }
        Ok(())
    }

    /// Every record in the file, skipping unreadable lines.
    pub fn read_all(&self) -> Result<Vec<AuditRecord>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(raw.lines().filter_map(|l| serde_json::from_str(l).ok()).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(HealerError::io(&self.path, e)),
        }
    }
}
