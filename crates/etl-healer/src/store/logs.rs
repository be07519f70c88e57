//! Persisted log mirror and the live inventory table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::StateStore;
use crate::error::Result;
use crate::types::{LogEntry, RunId};

fn map_log(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    Ok(LogEntry {
        id: row.get(0)?,
        logged_at: row.get(1)?,
        level: row.get(2)?,
        component: row.get(3)?,
        run_id: row.get(4)?,
        message: row.get(5)?,
    })
}

impl StateStore {
    pub fn append_log(
        &self,
        level: &str,
        component: &str,
        run_id: Option<RunId>,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO etl_logs (logged_at, level, component, run_id, message)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![now, level, component, run_id, message],
            )
        })?;
        Ok(())
    }

    /// Newest log lines first, optionally for one component.
    pub fn recent_logs(&self, component: Option<&str>, limit: u32) -> Result<Vec<LogEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, logged_at, level, component, run_id, message FROM etl_logs
                 WHERE (?1 IS NULL OR component = ?1)
                 ORDER BY logged_at DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![component, limit], map_log)?;
            rows.collect()
        })
    }

    pub fn purge_logs(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| conn.execute("DELETE FROM etl_logs WHERE logged_at < ?1", params![cutoff]))
    }

    pub fn count_purgeable_logs(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM etl_logs WHERE logged_at < ?1",
                params![cutoff],
                |row| row.get(0),
            )
        })?;
        Ok(count as usize)
    }

    // =========================================================================
    // Inventory records
    // =========================================================================

    /// Upsert records keyed by `(data_type, key)`. Returns how many rows were written.
    pub fn upsert_inventory(
        &self,
        data_type: &str,
        records: &[(String, serde_json::Value)],
        run_id: Option<RunId>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO inventory_records (data_type, record_key, payload, run_id, loaded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (data_type, record_key) DO UPDATE SET
                    payload = excluded.payload,
                    run_id = excluded.run_id,
                    loaded_at = excluded.loaded_at",
            )?;
            let mut written = 0;
            for (key, payload) in records {
                let encoded = serde_json::to_string(payload)?;
                written += stmt.execute(params![data_type, key, encoded, run_id, now])?;
            }
            Ok(written)
        })
    }

    pub fn count_inventory(&self, data_type: Option<&str>) -> Result<usize> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM inventory_records WHERE (?1 IS NULL OR data_type = ?1)",
                params![data_type],
                |row| row.get(0),
            )
        })?;
        Ok(count as usize)
    }
}
