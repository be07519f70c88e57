//! Critical error rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{parse_col, StateStore};
use crate::error::{HealerError, Result};
use crate::types::{CriticalError, NewCriticalError, RunId};

const CRITICAL_COLUMNS: &str = "id, run_id, operation_type, error_type, message, recovery_attempted, \
     recovery_successful, procedure_name, resolution, created_at, resolved_at";

fn map_critical(row: &Row<'_>) -> rusqlite::Result<CriticalError> {
    Ok(CriticalError {
        id: row.get(0)?,
        run_id: row.get(1)?,
        operation_type: row.get(2)?,
        error_type: parse_col(row, 3)?,
        message: row.get(4)?,
        recovery_attempted: row.get(5)?,
        recovery_successful: row.get(6)?,
        procedure_name: row.get(7)?,
        resolution: row.get(8)?,
        created_at: row.get(9)?,
        resolved_at: row.get(10)?,
    })
}

impl StateStore {
    pub fn insert_critical_error(
        &self,
        new: &NewCriticalError,
        now: DateTime<Utc>,
    ) -> Result<CriticalError> {
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO etl_critical_errors (run_id, operation_type, error_type, message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    new.run_id,
                    new.operation_type,
                    new.error_type.as_str(),
                    new.message,
                    now
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get_critical_error(id)?
            .ok_or_else(|| HealerError::NotFound(format!("critical error {id}")))
    }

    pub fn get_critical_error(&self, id: i64) -> Result<Option<CriticalError>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {CRITICAL_COLUMNS} FROM etl_critical_errors WHERE id = ?1"),
                [id],
                map_critical,
            )
            .optional()
        })
    }

    /// Record the outcome of a recovery attempt. Resolves the error only on success.
    pub fn record_recovery_result(
        &self,
        id: i64,
        procedure_name: Option<&str>,
        successful: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE etl_critical_errors
                 SET recovery_attempted = 1,
                     recovery_successful = ?2,
                     procedure_name = ?3,
                     resolution = CASE WHEN ?2 THEN 'recovered' ELSE resolution END,
                     resolved_at = CASE WHEN ?2 THEN ?4 ELSE resolved_at END
                 WHERE id = ?1",
                params![id, successful, procedure_name, now],
            )
        })?;
        Ok(())
    }

    /// Unresolved critical errors, newest first.
    pub fn unresolved_critical_errors(&self, run_id: Option<RunId>) -> Result<Vec<CriticalError>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CRITICAL_COLUMNS} FROM etl_critical_errors
                 WHERE resolved_at IS NULL AND (?1 IS NULL OR run_id = ?1)
                 ORDER BY created_at DESC, id DESC"
            ))?;
            let rows = stmt.query_map(params![run_id], map_critical)?;
            rows.collect()
        })
    }

    /// Operator resolution of every unresolved error, optionally scoped to one run.
    pub fn resolve_critical_errors(
        &self,
        run_id: Option<RunId>,
        resolution: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE etl_critical_errors SET resolution = ?2, resolved_at = ?3
                 WHERE resolved_at IS NULL AND (?1 IS NULL OR run_id = ?1)",
                params![run_id, resolution, now],
            )
        })
    }

    /// Delete resolved errors created before `cutoff`.
    pub fn purge_resolved_critical_errors(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM etl_critical_errors WHERE resolved_at IS NOT NULL AND created_at < ?1",
                params![cutoff],
            )
        })
    }

    pub fn count_purgeable_critical_errors(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM etl_critical_errors WHERE resolved_at IS NOT NULL AND created_at < ?1",
                params![cutoff],
                |row| row.get(0),
            )
        })?;
        Ok(count as usize)
    }
}
