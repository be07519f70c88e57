//! Single-writer execution lock.
//!
//! The production lock has two halves: a lock file created with an exclusive
//! create (holder pid, host and start time as JSON) and the persisted running
//! flag in the state store. A holder only counts if its pid is still alive;
//! dead or unreadable holders are reclaimed by the next `acquire`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{HealerError, Result};
use crate::process::{self, ProcessTable};
use crate::store::StateStore;
use crate::types::EtlStatus;

/// Failure message for runs whose process died without completing them.
pub const STALLED_HOLDER_DIED: &str = "stalled: holder died";

/// Identity recorded by the process holding the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub host: String,
    pub started_at: DateTime<Utc>,
}

impl LockHolder {
    fn held_error(&self) -> HealerError {
        HealerError::LockHeld {
            pid: self.pid,
            host: self.host.clone(),
            started_at: self.started_at,
        }
    }
}

/// Snapshot of both lock halves.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LockState {
    /// Holder recorded in the lock artifact
    pub holder: Option<LockHolder>,
    /// The artifact exists but could not be parsed
    pub corrupt: bool,
    pub holder_alive: bool,
    /// Persisted running flag
    pub flag: EtlStatus,
    pub flag_holder_alive: bool,
}

impl LockState {
    /// Whether a live process currently holds the lock.
    #[must_use]
    pub fn is_held(&self) -> bool {
        (self.holder.is_some() && self.holder_alive) || (self.flag.is_running && self.flag_holder_alive)
    }

    /// Whether any artifact is present whose holder is gone.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.corrupt
            || (self.holder.is_some() && !self.holder_alive)
            || (self.flag.is_running && !self.flag_holder_alive)
    }
}

/// What `force_clear` removed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClearReport {
    pub file_removed: bool,
    pub flag_cleared: bool,
    pub previous_holder: Option<LockHolder>,
}

/// Mutual exclusion across pipeline invocations.
pub trait LockManager: Send + Sync {
    /// Take the lock, reclaiming it from a dead holder if needed.
    fn acquire(&self) -> Result<LockHolder>;

    /// Release the lock if this process holds it. Returns false when there was
    /// nothing to release.
    fn release(&self) -> Result<bool>;

    /// Remove the lock regardless of holder.
    fn force_clear(&self) -> Result<ClearReport>;

    fn inspect(&self) -> Result<LockState>;
}

// =============================================================================
// File + persisted flag
// =============================================================================

enum FileHolder {
    Missing,
    Corrupt,
    Present(LockHolder),
}

/// Production lock: lock file plus the `etl_status` flag.
pub struct FileLockManager {
    path: PathBuf,
    store: StateStore,
    processes: Arc<dyn ProcessTable>,
    pid: u32,
    host: String,
}

impl FileLockManager {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, store: StateStore, processes: Arc<dyn ProcessTable>) -> Self {
        Self {
            path: path.into(),
            store,
            processes,
            pid: process::current_pid(),
            host: process::host_name(),
        }
    }

    /// Act as `pid` instead of the calling process.
    #[must_use]
    pub fn with_identity(mut self, pid: u32, host: impl Into<String>) -> Self {
        self.pid = pid;
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_holder(&self) -> Result<FileHolder> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(serde_json::from_str(&raw).map_or(FileHolder::Corrupt, FileHolder::Present)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileHolder::Missing),
            Err(e) => Err(HealerError::io(&self.path, e)),
        }
    }

    fn remove_file(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(HealerError::io(&self.path, e)),
        }
    }

    fn create_exclusive(&self, holder: &LockHolder) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HealerError::io(parent, e))?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Lost the race to another acquirer.
                return Err(match self.read_holder()? {
                    FileHolder::Present(other) => other.held_error(),
                    _ => holder.held_error(),
                });
            }
            Err(e) => return Err(HealerError::io(&self.path, e)),
        };
        let body = serde_json::to_vec_pretty(holder)?;
        file.write_all(&body)
            .and_then(|()| file.sync_all())
            .map_err(|e| HealerError::io(&self.path, e))?;
        Ok(())
    }
}

impl LockManager for FileLockManager {
    fn acquire(&self) -> Result<LockHolder> {
        match self.read_holder()? {
            FileHolder::Present(holder) if self.processes.is_alive(holder.pid) => {
                return Err(holder.held_error());
            }
            FileHolder::Present(holder) => {
                warn!(pid = holder.pid, host = %holder.host, "Reclaiming stale lock from dead holder");
                self.remove_file()?;
            }
            FileHolder::Corrupt => {
                warn!(path = %self.path.display(), "Reclaiming unreadable lock file");
                self.remove_file()?;
            }
            FileHolder::Missing => {}
        }

        let flag = self.store.etl_status()?;
        if flag.is_running {
            match flag.pid {
                Some(pid) if pid != self.pid && self.processes.is_alive(pid) => {
                    return Err(HealerError::LockHeld {
                        pid,
                        host: flag.host.unwrap_or_default(),
                        started_at: flag.started_at.unwrap_or_else(Utc::now),
                    });
                }
                _ => {
                    warn!(pid = ?flag.pid, "Clearing stale running flag");
                    self.store.clear_running(None)?;
                }
            }
        }

        let holder = LockHolder {
            pid: self.pid,
            host: self.host.clone(),
            started_at: Utc::now(),
        };
        self.create_exclusive(&holder)?;
        if let Err(e) = self.store.set_running(holder.pid, &holder.host, holder.started_at) {
            // Do not leave a file without its flag.
            let _ = self.remove_file();
            return Err(e);
        }
        let orphaned = self.store.fail_orphaned_runs(
            |pid| self.processes.is_alive(pid),
            STALLED_HOLDER_DIED,
            holder.started_at,
        )?;
        if !orphaned.is_empty() {
            warn!(runs = ?orphaned, "Failed runs left behind by dead holders");
        }
        info!(pid = holder.pid, path = %self.path.display(), "Execution lock acquired");
        Ok(holder)
    }

    fn release(&self) -> Result<bool> {
        let removed = match self.read_holder()? {
            FileHolder::Present(holder) if holder.pid == self.pid => self.remove_file()?,
            FileHolder::Present(holder) => {
                debug!(holder_pid = holder.pid, "Lock held by another process, not releasing file");
                false
            }
            FileHolder::Corrupt | FileHolder::Missing => false,
        };
        let cleared = self.store.clear_running(Some(self.pid))?;
        if removed || cleared {
            info!(pid = self.pid, "Execution lock released");
        }
        Ok(removed || cleared)
    }

    fn force_clear(&self) -> Result<ClearReport> {
        let previous_holder = match self.read_holder()? {
            FileHolder::Present(holder) => Some(holder),
            _ => None,
        };
        let file_removed = self.remove_file()?;
        let flag_cleared = self.store.clear_running(None)?;
        warn!(
            file_removed,
            flag_cleared,
            previous_pid = ?previous_holder.as_ref().map(|h| h.pid),
            "Execution lock force-cleared"
        );
        Ok(ClearReport {
            file_removed,
            flag_cleared,
            previous_holder,
        })
    }

    fn inspect(&self) -> Result<LockState> {
        let (holder, corrupt) = match self.read_holder()? {
            FileHolder::Present(holder) => (Some(holder), false),
            FileHolder::Corrupt => (None, true),
            FileHolder::Missing => (None, false),
        };
        let holder_alive = holder.as_ref().is_some_and(|h| self.processes.is_alive(h.pid));
        let flag = self.store.etl_status()?;
        let flag_holder_alive = flag.is_running && flag.pid.is_some_and(|pid| self.processes.is_alive(pid));
        Ok(LockState {
            holder,
            corrupt,
            holder_alive,
            flag,
            flag_holder_alive,
        })
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local lock for tests and dry runs. Liveness still goes through the process table.
pub struct MemoryLockManager {
    slot: Mutex<Option<LockHolder>>,
    processes: Arc<dyn ProcessTable>,
    pid: u32,
}

impl MemoryLockManager {
    #[must_use]
    pub fn new(pid: u32, processes: Arc<dyn ProcessTable>) -> Self {
        Self {
            slot: Mutex::new(None),
            processes,
            pid,
        }
    }

    /// Install a holder as if another process had taken the lock.
    pub fn seed_holder(&self, holder: LockHolder) -> Result<()> {
        *self.slot.lock().map_err(|_| HealerError::Poisoned)? = Some(holder);
        Ok(())
    }
}

impl LockManager for MemoryLockManager {
    fn acquire(&self) -> Result<LockHolder> {
        let mut slot = self.slot.lock().map_err(|_| HealerError::Poisoned)?;
        if let Some(holder) = slot.as_ref() {
            if self.processes.is_alive(holder.pid) {
                return Err(holder.held_error());
            }
        }
        let holder = LockHolder {
            pid: self.pid,
            host: "memory".to_string(),
            started_at: Utc::now(),
        };
        *slot = Some(holder.clone());
        Ok(holder)
    }

    fn release(&self) -> Result<bool> {
        let mut slot = self.slot.lock().map_err(|_| HealerError::Poisoned)?;
        if slot.as_ref().is_some_and(|h| h.pid == self.pid) {
            *slot = None;
            return Ok(true);
        }
        Ok(false)
    }

    fn force_clear(&self) -> Result<ClearReport> {
        let previous_holder = self.slot.lock().map_err(|_| HealerError::Poisoned)?.take();
        Ok(ClearReport {
            file_removed: previous_holder.is_some(),
            flag_cleared: false,
            previous_holder,
        })
    }

    fn inspect(&self) -> Result<LockState> {
        let holder = self.slot.lock().map_err(|_| HealerError::Poisoned)?.clone();
        let holder_alive = holder.as_ref().is_some_and(|h| self.processes.is_alive(h.pid));
        Ok(LockState {
            holder,
            holder_alive,
            ..LockState::default()
        })
    }
}
