//! Error types for the healer core.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::{ErrorType, RunId};

/// Errors raised by the healer library.
#[derive(Debug, Error)]
pub enum HealerError {
    /// Another live process holds the execution lock
    #[error("execution lock held by pid {pid} on {host} since {started_at}")]
    LockHeld {
        pid: u32,
        host: String,
        started_at: DateTime<Utc>,
    },

    /// SQLite error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem error with the path that caused it
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration problem
    #[error(transparent)]
    Config(#[from] etl_config::ConfigError),

    /// A thread panicked while holding the store connection
    #[error("state store connection poisoned")]
    Poisoned,

    /// Stored recovery step could not be interpreted
    #[error("invalid recovery step: {0}")]
    InvalidStep(String),

    /// Run is not in the `running` state
    #[error("run {0} is not running")]
    NotRunning(RunId),

    /// Row that may not be overwritten already exists
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Missing row or artifact
    #[error("{0} not found")]
    NotFound(String),

    /// A named sub-step of a composite operation failed
    #[error("{step} failed: {message}")]
    StepFailed { step: String, message: String },

    /// Process control failure (signal delivery, spawn)
    #[error("process error: {0}")]
    Process(String),
}

impl HealerError {
    /// Wrap an I/O error with the path that produced it.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Wrap an error as a failed composite step.
    pub fn step(step: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::StepFailed {
            step: step.into(),
            message: err.to_string(),
        }
    }

    /// Classify for the retry and recovery path.
    #[must_use]
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Database(_) => ErrorType::DatabaseConnectionLost,
            other => ErrorType::classify(&other.to_string()),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HealerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_errors_classify() {
        let db = HealerError::Database(rusqlite::Error::InvalidQuery);
        assert_eq!(db.error_type(), ErrorType::DatabaseConnectionLost);
        let disk = HealerError::io("/data/etl.lock", std::io::Error::other("No space left on device"));
        assert_eq!(disk.error_type(), ErrorType::DiskSpaceFull);
        assert_eq!(HealerError::Process("weird".to_string()).error_type(), ErrorType::AnyError);
    }
}
