//! Degraded-mode data: snapshots of the last good output per source and their
//! replay into live tables.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{HealerError, Result};
use crate::pipeline::Loader;
use crate::store::StateStore;
use crate::types::FallbackEntry;

/// Outcome of replaying one entry.
#[derive(Debug, Clone, Serialize)]
pub struct RestoredEntry {
    pub id: i64,
    pub data_type: String,
    pub data_key: String,
    pub records: usize,
    pub saved: u64,
    pub error: Option<String>,
}

/// Result of a restore pass.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub dry_run: bool,
    pub entries: Vec<RestoredEntry>,
}

impl RestoreReport {
    /// Entries that were replayed without error.
    #[must_use]
    pub fn restored(&self) -> usize {
        if self.dry_run {
            return 0;
        }
        self.entries.iter().filter(|e| e.error.is_none()).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.entries.iter().filter(|e| e.error.is_some()).count()
    }
}

/// Bound on key suffixes tried when snapshots share a timestamp.
const MAX_SNAPSHOT_SUFFIX: u32 = 64;

/// Persisted cache of recent good data.
#[derive(Debug, Clone)]
pub struct FallbackDataStore {
    store: StateStore,
    ttl: Duration,
}

impl FallbackDataStore {
    #[must_use]
    pub fn new(store: StateStore, ttl_hours: u32) -> Self {
        Self {
            store,
            ttl: Duration::hours(i64::from(ttl_hours)),
        }
    }

    /// Store `content` under `(data_type, data_key)`, expiring after the TTL.
    /// Existing entries are never rewritten.
    pub fn save(&self, data_type: &str, data_key: &str, content: &Value, now: DateTime<Utc>) -> Result<FallbackEntry> {
        self.store
            .insert_fallback(data_type, data_key, content, now + self.ttl, now)
    }

    /// Snapshot a source's records under a new key derived from `now`.
    /// Snapshots taken at the same instant get a `#n` suffix.
    pub fn save_snapshot(&self, data_type: &str, records: &Value, now: DateTime<Utc>) -> Result<FallbackEntry> {
        let stamp = now.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string();
        let mut key = stamp.clone();
        for n in 2..=MAX_SNAPSHOT_SUFFIX + 1 {
            match self.save(data_type, &key, records, now) {
                Err(HealerError::AlreadyExists(_)) => key = format!("{stamp}#{n}"),
                other => return other,
            }
        }
        Err(HealerError::AlreadyExists(format!("fallback {data_type}/{stamp}")))
    }

    /// Non-expired entries created within the last `max_age_hours`, oldest first.
    pub fn entries(&self, data_type: Option<&str>, max_age_hours: u32, now: DateTime<Utc>) -> Result<Vec<FallbackEntry>> {
        let since = now - Duration::hours(i64::from(max_age_hours));
        self.store.fallback_entries(data_type, since, now)
    }

    pub fn mark_used(&self, id: i64) -> Result<()> {
        self.store.increment_fallback_usage(id)
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.store.purge_expired_fallback(now)
    }

    /// Replay recent entries through `loader`, oldest first so the newest
    /// snapshot of a source wins. A dry run only lists what would be replayed.
    ///
    /// Usage is counted only for entries the loader accepted.
    pub async fn restore(
        &self,
        loader: &dyn Loader,
        data_type: Option<&str>,
        max_age_hours: u32,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<RestoreReport> {
        let entries = self.entries(data_type, max_age_hours, now)?;
        let mut restored = Vec::with_capacity(entries.len());

        for entry in entries {
            let records = match &entry.content {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            let mut outcome = RestoredEntry {
                id: entry.id,
                data_type: entry.data_type.clone(),
                data_key: entry.data_key.clone(),
                records: records.len(),
                saved: 0,
                error: None,
            };

            if dry_run {
                restored.push(outcome);
                continue;
            }

            match loader.load(&entry.data_type, &records).await {
                Ok(saved) => {
                    self.mark_used(entry.id)?;
                    outcome.saved = saved;
                    info!(
                        id = entry.id,
                        data_type = %entry.data_type,
                        data_key = %entry.data_key,
                        saved,
                        "Replayed fallback entry"
                    );
                }
                Err(e) => {
                    warn!(id = entry.id, data_type = %entry.data_type, error = %e, "Fallback replay failed");
                    outcome.error = Some(e.to_string());
                }
            }
            restored.push(outcome);
        }

        Ok(RestoreReport {
            dry_run,
            entries: restored,
        })
    }
}
