//! Fallback snapshot rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{json_col, StateStore};
use crate::error::{HealerError, Result};
use crate::types::FallbackEntry;

const FALLBACK_COLUMNS: &str = "id, data_type, data_key, content, created_at, expires_at, usage_count";

fn map_fallback(row: &Row<'_>) -> rusqlite::Result<FallbackEntry> {
    Ok(FallbackEntry {
        id: row.get(0)?,
        data_type: row.get(1)?,
        data_key: row.get(2)?,
        content: json_col(row, 3)?,
        created_at: row.get(4)?,
        expires_at: row.get(5)?,
        usage_count: row.get(6)?,
    })
}

impl StateStore {
    /// Store a snapshot. Entries are immutable: an existing
    /// `(data_type, data_key)` is left untouched and reported as
    /// [`HealerError::AlreadyExists`].
    pub fn insert_fallback(
        &self,
        data_type: &str,
        data_key: &str,
        content: &serde_json::Value,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<FallbackEntry> {
        let encoded = serde_json::to_string(content)?;
        let inserted = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO fallback_data (data_type, data_key, content, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (data_type, data_key) DO NOTHING",
                params![data_type, data_key, encoded, now, expires_at],
            )?;
            Ok((conn.changes() > 0).then(|| conn.last_insert_rowid()))
        })?;
        let Some(id) = inserted else {
            return Err(HealerError::AlreadyExists(format!("fallback {data_type}/{data_key}")));
        };
        self.get_fallback(id)?
            .ok_or_else(|| HealerError::NotFound(format!("fallback {id}")))
    }

    /// Non-expired entries created at or after `since`, optionally filtered by type.
    pub fn fallback_entries(
        &self,
        data_type: Option<&str>,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<FallbackEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FALLBACK_COLUMNS} FROM fallback_data
                 WHERE expires_at > ?1 AND created_at >= ?2 AND (?3 IS NULL OR data_type = ?3)
                 ORDER BY created_at, id"
            ))?;
            let rows = stmt.query_map(params![now, since, data_type], map_fallback)?;
            rows.collect()
        })
    }

    pub fn get_fallback(&self, id: i64) -> Result<Option<FallbackEntry>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {FALLBACK_COLUMNS} FROM fallback_data WHERE id = ?1"),
                [id],
                map_fallback,
            )
            .optional()
        })
    }

    pub fn increment_fallback_usage(&self, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE fallback_data SET usage_count = usage_count + 1 WHERE id = ?1",
                [id],
            )
        })?;
        Ok(())
    }

    pub fn purge_expired_fallback(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM fallback_data WHERE expires_at <= ?1", params![now])
        })
    }

    pub fn count_expired_fallback(&self, now: DateTime<Utc>) -> Result<usize> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM fallback_data WHERE expires_at <= ?1",
                params![now],
                |row| row.get(0),
            )
        })?;
        Ok(count as usize)
    }
}
