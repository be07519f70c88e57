//! Health results, alert records and the daemon statistics row.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{json_col, parse_col, StateStore};
use crate::error::{HealerError, Result};
use crate::health::{CheckResult, HealthStatus};
use crate::types::{AlertRecord, DaemonStats};

/// A persisted health assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredHealthResult {
    pub id: i64,
    pub checked_at: DateTime<Utc>,
    pub overall_status: HealthStatus,
    pub checks: Vec<CheckResult>,
    pub recommendations: Vec<String>,
}

fn map_health(row: &Row<'_>) -> rusqlite::Result<StoredHealthResult> {
    Ok(StoredHealthResult {
        id: row.get(0)?,
        checked_at: row.get(1)?,
        overall_status: parse_col(row, 2)?,
        checks: json_col(row, 3)?,
        recommendations: json_col(row, 4)?,
    })
}

fn map_alert(row: &Row<'_>) -> rusqlite::Result<AlertRecord> {
    Ok(AlertRecord {
        id: row.get(0)?,
        alert_type: row.get(1)?,
        level: row.get(2)?,
        message: row.get(3)?,
        delivered: row.get(4)?,
        created_at: row.get(5)?,
    })
}

impl StateStore {
    // =========================================================================
    // Health results
    // =========================================================================

    pub fn insert_health_result(
        &self,
        checked_at: DateTime<Utc>,
        overall: HealthStatus,
        checks: &[CheckResult],
        recommendations: &[String],
    ) -> Result<i64> {
        let checks = serde_json::to_string(checks)?;
        let recommendations = serde_json::to_string(recommendations)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO health_check_results (checked_at, overall_status, checks, recommendations)
                 VALUES (?1, ?2, ?3, ?4)",
                params![checked_at, overall.as_str(), checks, recommendations],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn latest_health_result(&self) -> Result<Option<StoredHealthResult>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, checked_at, overall_status, checks, recommendations
                 FROM health_check_results ORDER BY checked_at DESC, id DESC LIMIT 1",
                [],
                map_health,
            )
            .optional()
        })
    }

    pub fn purge_health_results(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM health_check_results WHERE checked_at < ?1",
                params![cutoff],
            )
        })
    }

    pub fn count_purgeable_health_results(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.count_before("health_check_results", "checked_at", cutoff)
    }

    // =========================================================================
    // Alerts
    // =========================================================================

    pub fn insert_alert(
        &self,
        alert_type: &str,
        level: &str,
        message: &str,
        delivered: bool,
        now: DateTime<Utc>,
    ) -> Result<AlertRecord> {
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO alert_records (alert_type, level, message, delivered, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![alert_type, level, message, delivered, now],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, alert_type, level, message, delivered, created_at
                 FROM alert_records WHERE id = ?1",
                [id],
                map_alert,
            )
            .optional()
        })?
        .ok_or_else(|| HealerError::NotFound(format!("alert record {id}")))
    }

    /// Most recent alert of the given type and level.
    pub fn last_alert(&self, alert_type: &str, level: &str) -> Result<Option<AlertRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, alert_type, level, message, delivered, created_at
                 FROM alert_records WHERE alert_type = ?1 AND level = ?2
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![alert_type, level],
                map_alert,
            )
            .optional()
        })
    }

    pub fn recent_alerts(&self, limit: u32) -> Result<Vec<AlertRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, alert_type, level, message, delivered, created_at
                 FROM alert_records ORDER BY created_at DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], map_alert)?;
            rows.collect()
        })
    }

    pub fn purge_alerts(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM alert_records WHERE created_at < ?1", params![cutoff])
        })
    }

    pub fn count_purgeable_alerts(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.count_before("alert_records", "created_at", cutoff)
    }

    // =========================================================================
    // Daemon statistics
    // =========================================================================

    pub fn daemon_stats(&self) -> Result<DaemonStats> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT pid, started_at, last_check_at, last_status, checks_performed,
                        alerts_sent, stopped_at
                 FROM daemon_stats WHERE id = 1",
                [],
                |row| {
                    Ok(DaemonStats {
                        pid: row.get(0)?,
                        started_at: row.get(1)?,
                        last_check_at: row.get(2)?,
                        last_status: row.get(3)?,
                        checks_performed: row.get(4)?,
                        alerts_sent: row.get(5)?,
                        stopped_at: row.get(6)?,
                    })
                },
            )
        })
    }

    /// Reset the statistics row for a freshly started daemon.
    pub fn daemon_started(&self, pid: u32, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE daemon_stats
                 SET pid = ?1, started_at = ?2, last_check_at = NULL, last_status = NULL,
                     checks_performed = 0, alerts_sent = 0, stopped_at = NULL
                 WHERE id = 1",
                params![pid, now],
            )
        })?;
        Ok(())
    }

    /// Count one completed cycle.
    pub fn record_check(&self, status: HealthStatus, alert_delivered: bool, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE daemon_stats
                 SET last_check_at = ?1, last_status = ?2,
                     checks_performed = checks_performed + 1,
                     alerts_sent = alerts_sent + CASE WHEN ?3 THEN 1 ELSE 0 END
                 WHERE id = 1",
                params![now, status.as_str(), alert_delivered],
            )
        })?;
        Ok(())
    }

    pub fn daemon_stopped(&self, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE daemon_stats SET stopped_at = ?1 WHERE id = 1", params![now])
        })?;
        Ok(())
    }

    fn count_before(&self, table: &str, column: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let count: i64 = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE {column} < ?1"),
                params![cutoff],
                |row| row.get(0),
            )
        })?;
        Ok(count as usize)
    }
}
