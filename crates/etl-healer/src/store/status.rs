//! The persisted running flag and the restart-request queue.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::StateStore;
use crate::error::{HealerError, Result};
use crate::types::{EtlStatus, RestartRequest, RunId};

const RESTART_COLUMNS: &str =
    "id, requested_at, run_after, reason, critical_error_id, consumed_at, consumed_by_run";

fn map_restart(row: &Row<'_>) -> rusqlite::Result<RestartRequest> {
    Ok(RestartRequest {
        id: row.get(0)?,
        requested_at: row.get(1)?,
        run_after: row.get(2)?,
        reason: row.get(3)?,
        critical_error_id: row.get(4)?,
        consumed_at: row.get(5)?,
        consumed_by_run: row.get(6)?,
    })
}

impl StateStore {
    pub fn etl_status(&self) -> Result<EtlStatus> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT is_running, pid, host, run_id, started_at FROM etl_status WHERE id = 1",
                [],
                |row| {
                    Ok(EtlStatus {
                        is_running: row.get(0)?,
                        pid: row.get(1)?,
                        host: row.get(2)?,
                        run_id: row.get(3)?,
                        started_at: row.get(4)?,
                    })
                },
            )
        })
    }

    /// Raise the running flag for `pid`.
    pub fn set_running(&self, pid: u32, host: &str, started_at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE etl_status
                 SET is_running = 1, pid = ?1, host = ?2, run_id = NULL, started_at = ?3
                 WHERE id = 1",
                params![pid, host, started_at],
            )
        })?;
        Ok(())
    }

    /// Attach the current run to the running flag.
    pub fn set_running_run(&self, run_id: RunId) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE etl_status SET run_id = ?1 WHERE id = 1 AND is_running = 1",
                [run_id],
            )
        })?;
        Ok(())
    }

    /// Clear the running flag. With `only_pid`, clears only if that pid set it.
    /// Returns whether the flag was cleared.
    pub fn clear_running(&self, only_pid: Option<u32>) -> Result<bool> {
        let updated = self.with_conn(|conn| {
            conn.execute(
                "UPDATE etl_status
                 SET is_running = 0, pid = NULL, host = NULL, run_id = NULL, started_at = NULL
                 WHERE id = 1 AND is_running = 1 AND (?1 IS NULL OR pid = ?1)",
                params![only_pid],
            )
        })?;
        Ok(updated > 0)
    }

    // =========================================================================
    // Restart requests
    // =========================================================================

    pub fn insert_restart_request(
        &self,
        run_after: DateTime<Utc>,
        reason: &str,
        critical_error_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<RestartRequest> {
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO etl_restart_requests (requested_at, run_after, reason, critical_error_id)
                 VALUES (?1, ?2, ?3, ?4)",
                params![now, run_after, reason, critical_error_id],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {RESTART_COLUMNS} FROM etl_restart_requests WHERE id = ?1"),
                [id],
                map_restart,
            )
            .optional()
        })?
        .ok_or_else(|| HealerError::NotFound(format!("restart request {id}")))
    }

    /// Unconsumed requests, earliest first.
    pub fn pending_restart_requests(&self) -> Result<Vec<RestartRequest>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RESTART_COLUMNS} FROM etl_restart_requests
                 WHERE consumed_at IS NULL ORDER BY run_after, id"
            ))?;
            let rows = stmt.query_map([], map_restart)?;
            rows.collect()
        })
    }

    /// The earliest unconsumed request whose `run_after` has passed.
    pub fn due_restart_request(&self, now: DateTime<Utc>) -> Result<Option<RestartRequest>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {RESTART_COLUMNS} FROM etl_restart_requests
                     WHERE consumed_at IS NULL AND run_after <= ?1
                     ORDER BY run_after, id LIMIT 1"
                ),
                params![now],
                map_restart,
            )
            .optional()
        })
    }

    /// Mark every due request consumed by `run_id`. Returns how many were consumed.
    pub fn consume_due_restart_requests(&self, run_id: RunId, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE etl_restart_requests SET consumed_at = ?1, consumed_by_run = ?2
                 WHERE consumed_at IS NULL AND run_after <= ?1",
                params![now, run_id],
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_running_flag_owned_by_pid() {
        let store = StateStore::in_memory().unwrap();
        assert!(!store.etl_status().unwrap().is_running);

        store.set_running(100, "etl-1", Utc::now()).unwrap();
        store.set_running_run(5).unwrap();
        let status = store.etl_status().unwrap();
        assert!(status.is_running);
        assert_eq!(status.pid, Some(100));
        assert_eq!(status.run_id, Some(5));

        assert!(!store.clear_running(Some(200)).unwrap());
        assert!(store.clear_running(Some(100)).unwrap());
        assert!(!store.clear_running(None).unwrap());
        assert!(!store.etl_status().unwrap().is_running);
    }

    #[test]
    fn test_restart_requests_become_due_and_are_consumed_once() {
        let store = StateStore::in_memory().unwrap();
        let now = Utc::now();
        store
            .insert_restart_request(now + Duration::minutes(5), "rate limited", Some(3), now)
            .unwrap();

        assert!(store.due_restart_request(now).unwrap().is_none());
        assert_eq!(store.pending_restart_requests().unwrap().len(), 1);

        let later = now + Duration::minutes(6);
        let due = store.due_restart_request(later).unwrap().unwrap();
        assert_eq!(due.critical_error_id, Some(3));

        assert_eq!(store.consume_due_restart_requests(9, later).unwrap(), 1);
        assert_eq!(store.consume_due_restart_requests(10, later).unwrap(), 0);
        assert!(store.pending_restart_requests().unwrap().is_empty());
    }
}
