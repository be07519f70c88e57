//! Run history.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{parse_col, StateStore};
use crate::error::{HealerError, Result};
use crate::types::{Run, RunCompletion, RunId, RunKind, RunStatus};

const RUN_COLUMNS: &str = "id, kind, status, started_at, completed_at, duration_secs, \
     records_extracted, records_saved, memory_peak_mb, error_message, pid, host";

fn map_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        kind: parse_col(row, 1)?,
        status: parse_col(row, 2)?,
        started_at: row.get(3)?,
        completed_at: row.get(4)?,
        duration_secs: row.get(5)?,
        records_extracted: row.get(6)?,
        records_saved: row.get(7)?,
        memory_peak_mb: row.get(8)?,
        error_message: row.get(9)?,
        pid: row.get(10)?,
        host: row.get(11)?,
    })
}

impl StateStore {
    /// Insert a new run in the `running` state.
    pub fn insert_run(
        &self,
        kind: RunKind,
        pid: u32,
        host: &str,
        started_at: DateTime<Utc>,
    ) -> Result<Run> {
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO etl_runs (kind, status, started_at, pid, host) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![kind.as_str(), RunStatus::Running.as_str(), started_at, pid, host],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.get_run(id)?
            .ok_or_else(|| HealerError::NotFound(format!("run {id}")))
    }

    /// Move a running run to its terminal status. Fails if it already left `running`.
    pub fn complete_run(
        &self,
        id: RunId,
        completion: &RunCompletion,
        completed_at: DateTime<Utc>,
    ) -> Result<Run> {
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE etl_runs
                 SET status = ?2,
                     completed_at = ?3,
                     duration_secs = (julianday(?3) - julianday(started_at)) * 86400.0,
                     records_extracted = ?4,
                     records_saved = ?5,
                     memory_peak_mb = ?6,
                     error_message = ?7
                 WHERE id = ?1 AND status = 'running'",
                params![
                    id,
                    completion.status.as_str(),
                    completed_at,
                    completion.records_extracted,
                    completion.records_saved,
                    completion.memory_peak_mb,
                    completion.error_message,
                ],
            )
        })?;
        if updated == 0 {
            return Err(HealerError::NotRunning(id));
        }
        self.get_run(id)?
            .ok_or_else(|| HealerError::NotFound(format!("run {id}")))
    }

    pub fn get_run(&self, id: RunId) -> Result<Option<Run>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {RUN_COLUMNS} FROM etl_runs WHERE id = ?1"),
                [id],
                map_run,
            )
            .optional()
        })
    }

    /// Runs currently marked `running`.
    pub fn running_runs(&self) -> Result<Vec<Run>> {
        self.query_runs(
            &format!("SELECT {RUN_COLUMNS} FROM etl_runs WHERE status = 'running' ORDER BY id"),
            params![],
        )
    }

    /// Most recent runs, newest first.
    pub fn recent_runs(&self, limit: u32) -> Result<Vec<Run>> {
        self.query_runs(
            &format!("SELECT {RUN_COLUMNS} FROM etl_runs ORDER BY started_at DESC, id DESC LIMIT ?1"),
            params![limit],
        )
    }

    /// Runs started at or after `since`, oldest first.
    pub fn runs_since(&self, since: DateTime<Utc>) -> Result<Vec<Run>> {
        self.query_runs(
            &format!("SELECT {RUN_COLUMNS} FROM etl_runs WHERE started_at >= ?1 ORDER BY started_at"),
            params![since],
        )
    }

    /// The newest run that completed with status `success`.
    pub fn last_successful_run(&self) -> Result<Option<Run>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM etl_runs WHERE status = 'success'
                     ORDER BY completed_at DESC LIMIT 1"
                ),
                [],
                map_run,
            )
            .optional()
        })
    }

    /// Whether any run completed successfully at or after `since`.
    pub fn has_success_since(&self, since: DateTime<Utc>) -> Result<bool> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM etl_runs WHERE status = 'success' AND completed_at >= ?1",
                params![since],
                |row| row.get(0),
            )
        })?;
        Ok(count > 0)
    }

    /// Mark every running run as failed. Returns the affected ids.
    pub fn fail_running_runs(&self, reason: &str, now: DateTime<Utc>) -> Result<Vec<RunId>> {
        self.with_tx(|tx| {
            let ids = {
                let mut stmt = tx.prepare("SELECT id FROM etl_runs WHERE status = 'running'")?;
                let rows = stmt.query_map([], |row| row.get::<_, RunId>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            tx.execute(
                "UPDATE etl_runs
                 SET status = 'failed',
                     completed_at = ?1,
                     duration_secs = (julianday(?1) - julianday(started_at)) * 86400.0,
                     error_message = ?2
                 WHERE status = 'running'",
                params![now, reason],
            )?;
            Ok(ids)
        })
    }

    /// Fail running runs whose recorded pid is no longer alive.
    pub fn fail_orphaned_runs(
        &self,
        is_alive: impl Fn(u32) -> bool,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<RunId>> {
        let orphaned: Vec<RunId> = self
            .running_runs()?
            .into_iter()
            .filter(|run| !is_alive(run.pid))
            .map(|run| run.id)
            .collect();
        if orphaned.is_empty() {
            return Ok(orphaned);
        }
        self.with_tx(|tx| {
            for id in &orphaned {
                tx.execute(
                    "UPDATE etl_runs
                     SET status = 'failed',
                         completed_at = ?2,
                         duration_secs = (julianday(?2) - julianday(started_at)) * 86400.0,
                         error_message = ?3
                     WHERE id = ?1 AND status = 'running'",
                    params![id, now, reason],
                )?;
            }
            Ok(())
        })?;
        Ok(orphaned)
    }

    /// Delete finished runs started before `cutoff`.
    pub fn purge_runs(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM etl_runs WHERE status != 'running' AND started_at < ?1",
                params![cutoff],
            )
        })
    }

    /// Count finished runs started before `cutoff` (dry-run preview).
    pub fn count_purgeable_runs(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM etl_runs WHERE status != 'running' AND started_at < ?1",
                params![cutoff],
                |row| row.get(0),
            )
        })?;
        Ok(count as usize)
    }

    fn query_runs(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Run>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, map_run)?;
            rows.collect()
        })
    }
}
