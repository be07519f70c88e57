//! Retry attempt rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{parse_col, StateStore};
use crate::error::{HealerError, Result};
use crate::types::{ErrorType, RetryAttempt, RunId};

const ATTEMPT_COLUMNS: &str = "id, run_id, operation_type, error_type, attempt_number, max_attempts, \
     next_retry_at, last_error, is_exhausted, is_completed, created_at, updated_at, completed_at";

fn map_attempt(row: &Row<'_>) -> rusqlite::Result<RetryAttempt> {
    Ok(RetryAttempt {
        id: row.get(0)?,
        run_id: row.get(1)?,
        operation_type: row.get(2)?,
        error_type: parse_col(row, 3)?,
        attempt_number: row.get(4)?,
        max_attempts: row.get(5)?,
        next_retry_at: row.get(6)?,
        last_error: row.get(7)?,
        is_exhausted: row.get(8)?,
        is_completed: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        completed_at: row.get(12)?,
    })
}

impl StateStore {
    /// The open attempt for `(run_id, operation_type)`, if any.
    pub fn open_attempt(&self, run_id: RunId, operation_type: &str) -> Result<Option<RetryAttempt>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM etl_retry_attempts
                     WHERE run_id = ?1 AND operation_type = ?2 AND is_completed = 0"
                ),
                params![run_id, operation_type],
                map_attempt,
            )
            .optional()
        })
    }

    pub fn get_attempt(&self, id: i64) -> Result<Option<RetryAttempt>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {ATTEMPT_COLUMNS} FROM etl_retry_attempts WHERE id = ?1"),
                [id],
                map_attempt,
            )
            .optional()
        })
    }

    /// Insert the first attempt of an operation.
    pub fn insert_attempt(
        &self,
        run_id: RunId,
        operation_type: &str,
        error_type: ErrorType,
        max_attempts: u32,
        next_retry_at: Option<DateTime<Utc>>,
        last_error: &str,
        is_exhausted: bool,
        now: DateTime<Utc>,
    ) -> Result<RetryAttempt> {
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO etl_retry_attempts
                    (run_id, operation_type, error_type, attempt_number, max_attempts,
                     next_retry_at, last_error, is_exhausted, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    run_id,
                    operation_type,
                    error_type.as_str(),
                    max_attempts,
                    next_retry_at,
                    last_error,
                    is_exhausted,
                    now
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get_attempt(id)?
            .ok_or_else(|| HealerError::NotFound(format!("retry attempt {id}")))
    }

    /// Bump an open attempt to `attempt_number`.
    pub fn advance_attempt(
        &self,
        id: i64,
        attempt_number: u32,
        error_type: ErrorType,
        next_retry_at: Option<DateTime<Utc>>,
        last_error: &str,
        is_exhausted: bool,
        now: DateTime<Utc>,
    ) -> Result<RetryAttempt> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE etl_retry_attempts
                 SET attempt_number = ?2, error_type = ?3, next_retry_at = ?4,
                     last_error = ?5, is_exhausted = ?6, updated_at = ?7
                 WHERE id = ?1 AND is_completed = 0",
                params![
                    id,
                    attempt_number,
                    error_type.as_str(),
                    next_retry_at,
                    last_error,
                    is_exhausted,
                    now
                ],
            )
        })?;
        self.get_attempt(id)?
            .ok_or_else(|| HealerError::NotFound(format!("retry attempt {id}")))
    }

    /// Close an open attempt. Returns false if it was already closed.
    pub fn close_attempt(&self, id: i64, exhausted: bool, now: DateTime<Utc>) -> Result<bool> {
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE etl_retry_attempts
                 SET is_completed = 1, is_exhausted = (is_exhausted OR ?2),
                     next_retry_at = NULL, completed_at = ?3, updated_at = ?3
                 WHERE id = ?1 AND is_completed = 0",
                params![id, exhausted, now],
            )
        })?;
        Ok(updated > 0)
    }

    /// Close every open attempt, optionally scoped to one run.
    pub fn close_open_attempts(&self, run_id: Option<RunId>, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE etl_retry_attempts
                 SET is_completed = 1, next_retry_at = NULL, completed_at = ?2, updated_at = ?2
                 WHERE is_completed = 0 AND (?1 IS NULL OR run_id = ?1)",
                params![run_id, now],
            )
        })
    }

    /// Open attempts, optionally scoped to one run.
    pub fn open_attempts(&self, run_id: Option<RunId>) -> Result<Vec<RetryAttempt>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ATTEMPT_COLUMNS} FROM etl_retry_attempts
                 WHERE is_completed = 0 AND (?1 IS NULL OR run_id = ?1)
                 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![run_id], map_attempt)?;
            rows.collect()
        })
    }

    /// Delete closed attempts whose last update is older than `cutoff`.
    pub fn purge_closed_attempts(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM etl_retry_attempts WHERE is_completed = 1 AND updated_at < ?1",
                params![cutoff],
            )
        })
    }

    pub fn count_purgeable_attempts(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM etl_retry_attempts WHERE is_completed = 1 AND updated_at < ?1",
                params![cutoff],
                |row| row.get(0),
            )
        })?;
        Ok(count as usize)
    }
}
