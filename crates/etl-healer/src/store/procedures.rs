//! Recovery procedure definitions and their execution counters.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{json_col, parse_col, StateStore};
use crate::error::Result;
use crate::recovery::procedures::default_procedures;
use crate::types::{ErrorType, RecoveryProcedure, RecoveryStep};

const PROCEDURE_COLUMNS: &str = "id, name, trigger_condition, recovery_steps, is_active, \
     success_count, failure_count, last_executed_at, updated_at";

fn map_procedure(row: &Row<'_>) -> rusqlite::Result<RecoveryProcedure> {
    Ok(RecoveryProcedure {
        id: row.get(0)?,
        name: row.get(1)?,
        trigger_condition: parse_col(row, 2)?,
        recovery_steps: json_col(row, 3)?,
        is_active: row.get(4)?,
        success_count: row.get(5)?,
        failure_count: row.get(6)?,
        last_executed_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl StateStore {
    /// Insert the built-in procedures that are not present yet. Existing rows,
    /// including operator edits, are left untouched.
    pub fn seed_default_procedures(&self, now: DateTime<Utc>) -> Result<usize> {
        let defaults = default_procedures();
        self.with_tx(|tx| {
            let mut inserted = 0;
            for seed in &defaults {
                let steps = serde_json::to_string(&seed.steps)?;
                inserted += tx.execute(
                    "INSERT OR IGNORE INTO etl_recovery_procedures
                        (name, trigger_condition, recovery_steps, is_active, updated_at)
                     VALUES (?1, ?2, ?3, 1, ?4)",
                    params![seed.name, seed.trigger.as_str(), steps, now],
                )?;
            }
            Ok(inserted)
        })
    }

    /// Insert or replace the steps of a named procedure.
    pub fn upsert_procedure(
        &self,
        name: &str,
        trigger: ErrorType,
        steps: &[RecoveryStep],
        is_active: bool,
        now: DateTime<Utc>,
    ) -> Result<RecoveryProcedure> {
        let encoded = serde_json::to_string(steps)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO etl_recovery_procedures
                    (name, trigger_condition, recovery_steps, is_active, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (name) DO UPDATE SET
                    trigger_condition = excluded.trigger_condition,
                    recovery_steps = excluded.recovery_steps,
                    is_active = excluded.is_active,
                    updated_at = excluded.updated_at",
                params![name, trigger.as_str(), encoded, is_active, now],
            )?;
            conn.query_row(
                &format!("SELECT {PROCEDURE_COLUMNS} FROM etl_recovery_procedures WHERE name = ?1"),
                [name],
                map_procedure,
            )
        })
    }

    /// The active procedure whose trigger matches `error_type` exactly.
    pub fn active_procedure_for(&self, error_type: ErrorType) -> Result<Option<RecoveryProcedure>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {PROCEDURE_COLUMNS} FROM etl_recovery_procedures
                     WHERE trigger_condition = ?1 AND is_active = 1
                     ORDER BY id LIMIT 1"
                ),
                [error_type.as_str()],
                map_procedure,
            )
            .optional()
        })
    }

    pub fn get_procedure(&self, name: &str) -> Result<Option<RecoveryProcedure>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {PROCEDURE_COLUMNS} FROM etl_recovery_procedures WHERE name = ?1"),
                [name],
                map_procedure,
            )
            .optional()
        })
    }

    pub fn list_procedures(&self) -> Result<Vec<RecoveryProcedure>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROCEDURE_COLUMNS} FROM etl_recovery_procedures ORDER BY name"
            ))?;
            let rows = stmt.query_map([], map_procedure)?;
            rows.collect()
        })
    }

    /// Bump the success or failure counter after an execution.
    pub fn record_procedure_result(&self, id: i64, success: bool, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE etl_recovery_procedures
                 SET success_count = success_count + CASE WHEN ?2 THEN 1 ELSE 0 END,
                     failure_count = failure_count + CASE WHEN ?2 THEN 0 ELSE 1 END,
                     last_executed_at = ?3
                 WHERE id = ?1",
                params![id, success, now],
            )
        })?;
        Ok(())
    }
}
