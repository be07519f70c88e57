//! Filesystem housekeeping shared by recovery steps and manual cleanup.

use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::error::{HealerError, Result};

/// What a directory sweep removed (or would remove).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub removed: usize,
    pub bytes: u64,
}

/// Remove entries directly under `dir` that match `filter` and are older than
/// `older_than` (all entries when `None`). A missing directory is empty.
/// With `dry_run` nothing is deleted.
pub fn sweep_dir(
    dir: &Path,
    older_than: Option<Duration>,
    dry_run: bool,
    filter: impl Fn(&Path) -> bool,
) -> Result<SweepReport> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SweepReport::default()),
        Err(e) => return Err(HealerError::io(dir, e)),
    };
    let cutoff = older_than.and_then(|age| SystemTime::now().checked_sub(age));

    let mut report = SweepReport::default();
    for entry in entries {
        let entry = entry.map_err(|e| HealerError::io(dir, e))?;
        let path = entry.path();
        if !filter(&path) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if let Some(cutoff) = cutoff {
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if modified > cutoff {
                continue;
            }
        }

        if !dry_run {
            let removed = if meta.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = removed {
                warn!(path = %path.display(), error = %e, "Failed to remove entry");
                continue;
            }
        }
        debug!(path = %path.display(), dry_run, "Swept entry");
        report.removed += 1;
        report.bytes += meta.len();
    }
    Ok(report)
}

/// Every entry under the temp directory.
pub fn clear_temp_dir(dir: &Path, older_than: Option<Duration>, dry_run: bool) -> Result<SweepReport> {
    sweep_dir(dir, older_than, dry_run, |_| true)
}

/// Daily log files (`<name>.log.<date>`) under `dir` older than `older_than`.
/// Other files, including the audit log, are left alone.
pub fn clear_rotated_logs(dir: &Path, older_than: Duration, dry_run: bool) -> Result<SweepReport> {
    sweep_dir(dir, Some(older_than), dry_run, |path| {
        path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.contains(".log.") && !name.ends_with(".jsonl"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let report = clear_temp_dir(&dir.path().join("nope"), None, false).unwrap();
        assert_eq!(report.removed, 0);
    }

    #[test]
    fn test_clear_temp_dir_and_dry_run() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.csv"), "1,2,3").unwrap();
        std::fs::create_dir(dir.path().join("batch")).unwrap();
        std::fs::write(dir.path().join("batch/b.json"), "[]").unwrap();

        let preview = clear_temp_dir(dir.path(), None, true).unwrap();
        assert_eq!(preview.removed, 2);
        assert!(dir.path().join("a.csv").exists());

        let report = clear_temp_dir(dir.path(), None, false).unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_recent_files_survive_age_filter() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fresh.tmp"), "x").unwrap();
        let report = clear_temp_dir(dir.path(), Some(Duration::from_secs(3600)), false).unwrap();
        assert_eq!(report.removed, 0);
        assert!(dir.path().join("fresh.tmp").exists());
    }

    #[test]
    fn test_only_rotated_logs_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("etl-scheduler.log.2026-01-01"), "old").unwrap();
        std::fs::write(dir.path().join("recovery-audit.jsonl"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        let report = clear_rotated_logs(dir.path(), Duration::ZERO, false).unwrap();
        assert_eq!(report.removed, 1);
        assert!(dir.path().join("recovery-audit.jsonl").exists());
        assert!(dir.path().join("notes.txt").exists());
    }
}
