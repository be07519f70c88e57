//! Process liveness, signalling and PID markers.
//!
//! Everything that touches other processes goes through [`ProcessTable`] so
//! the lock and daemon logic can be tested with a fake.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tracing::{debug, info, warn};

use crate::error::{HealerError, Result};

/// Liveness and signalling for arbitrary pids.
pub trait ProcessTable: Send + Sync {
    /// Whether `pid` refers to a running (non-zombie) process.
    fn is_alive(&self, pid: u32) -> bool;

    /// Ask the process to exit (SIGTERM). Returns false if it could not be signalled.
    fn terminate(&self, pid: u32) -> bool;

    /// Kill the process outright.
    fn kill(&self, pid: u32) -> bool;
}

/// [`ProcessTable`] backed by the operating system process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl SystemProcessTable {
    fn with_process<T>(pid: u32, f: impl FnOnce(&sysinfo::Process) -> T) -> Option<T> {
        let pid = Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        sys.process(pid).map(f)
    }
}

impl ProcessTable for SystemProcessTable {
    fn is_alive(&self, pid: u32) -> bool {
        Self::with_process(pid, |p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            .unwrap_or(false)
    }

    fn terminate(&self, pid: u32) -> bool {
        Self::with_process(pid, |p| p.kill_with(Signal::Term).unwrap_or_else(|| p.kill()))
            .unwrap_or(false)
    }

    fn kill(&self, pid: u32) -> bool {
        Self::with_process(pid, sysinfo::Process::kill).unwrap_or(false)
    }
}

/// Pid of the calling process.
#[must_use]
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Host name, `localhost` when it cannot be determined.
#[must_use]
pub fn host_name() -> String {
    System::host_name().unwrap_or_else(|| "localhost".to_string())
}

/// Resident memory of the calling process in MB.
#[must_use]
pub fn current_memory_mb() -> Option<f64> {
    let pid = Pid::from_u32(current_pid());
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.memory() as f64 / (1024.0 * 1024.0))
}

// =============================================================================
// PID marker
// =============================================================================

/// A file holding the pid of a long-lived process.
#[derive(Debug, Clone)]
pub struct PidMarker {
    path: PathBuf,
}

impl PidMarker {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `pid`, replacing any previous marker.
    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HealerError::io(parent, e))?;
        }
        std::fs::write(&self.path, format!("{pid}\n")).map_err(|e| HealerError::io(&self.path, e))?;
        debug!(pid, path = %self.path.display(), "Wrote PID marker");
        Ok(())
    }

    /// The recorded pid. Unparseable content reads as `None`.
    pub fn read(&self) -> Result<Option<u32>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(raw.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HealerError::io(&self.path, e)),
        }
    }

    /// Remove the marker. Missing markers are fine.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HealerError::io(&self.path, e)),
        }
    }

    /// The recorded pid if that process is still alive.
    pub fn live_pid(&self, processes: &dyn ProcessTable) -> Result<Option<u32>> {
        Ok(self.read()?.filter(|pid| processes.is_alive(*pid)))
    }
}

/// Re-spawn the current executable with `args`, detached from this terminal.
pub fn spawn_detached(args: &[String]) -> Result<u32> {
    let exe = std::env::current_exe().map_err(|e| HealerError::Process(format!("current_exe: {e}")))?;
    let mut cmd = Command::new(&exe);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd
        .spawn()
        .map_err(|e| HealerError::Process(format!("failed to spawn {}: {e}", exe.display())))?;
    info!(pid = child.id(), exe = %exe.display(), "Spawned detached process");
    Ok(child.id())
}

/// Send SIGTERM, wait up to `timeout` for exit, then kill.
/// Returns true when the process had to be force-killed.
pub async fn stop_process(
    processes: &dyn ProcessTable,
    pid: u32,
    timeout: std::time::Duration,
) -> Result<bool> {
    if !processes.is_alive(pid) {
        return Ok(false);
    }
    if !processes.terminate(pid) {
        warn!(pid, "SIGTERM could not be delivered");
    }

    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !processes.is_alive(pid) {
            info!(pid, "Process exited after SIGTERM");
            return Ok(false);
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }

    warn!(pid, timeout_secs = timeout.as_secs(), "Process still alive, killing");
    if !processes.kill(pid) && processes.is_alive(pid) {
        return Err(HealerError::Process(format!("failed to kill pid {pid}")));
    }
    Ok(true)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::ProcessTable;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Process table with a fixed set of live pids. `terminate` makes a pid exit
    /// unless it was registered as stubborn.
    #[derive(Default)]
    pub struct FakeProcessTable {
        pub alive: Mutex<HashSet<u32>>,
        pub stubborn: Mutex<HashSet<u32>>,
        pub terminated: Mutex<Vec<u32>>,
        pub killed: Mutex<Vec<u32>>,
    }

    impl FakeProcessTable {
        pub fn with_alive(pids: &[u32]) -> Self {
            let processes = Self::default();
            processes.alive.lock().unwrap().extend(pids);
            processes
        }
    }

    impl ProcessTable for FakeProcessTable {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }

        fn terminate(&self, pid: u32) -> bool {
            self.terminated.lock().unwrap().push(pid);
            if !self.stubborn.lock().unwrap().contains(&pid) {
                self.alive.lock().unwrap().remove(&pid);
            }
            true
        }

        fn kill(&self, pid: u32) -> bool {
            self.killed.lock().unwrap().push(pid);
            self.alive.lock().unwrap().remove(&pid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeProcessTable;
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_system_table_sees_current_process() {
        assert!(SystemProcessTable.is_alive(current_pid()));
        assert!(!SystemProcessTable.is_alive(u32::MAX - 1));
    }

    #[test]
    fn test_pid_marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let marker = PidMarker::new(dir.path().join("run/daemon.pid"));
        assert_eq!(marker.read().unwrap(), None);

        marker.write(4242).unwrap();
        assert_eq!(marker.read().unwrap(), Some(4242));

        let processes = FakeProcessTable::with_alive(&[4242]);
        assert_eq!(marker.live_pid(&processes).unwrap(), Some(4242));
        assert_eq!(marker.live_pid(&FakeProcessTable::default()).unwrap(), None);

        marker.remove().unwrap();
        marker.remove().unwrap();
        assert_eq!(marker.read().unwrap(), None);
    }

    #[test]
    fn test_garbage_marker_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, "not a pid").unwrap();
        assert_eq!(PidMarker::new(path).read().unwrap(), None);
    }

    #[tokio::test]
    async fn test_stop_process_graceful() {
        let processes = FakeProcessTable::with_alive(&[10]);
        let forced = stop_process(&processes, 10, Duration::from_secs(1)).await.unwrap();
        assert!(!forced);
        assert!(processes.killed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_process_escalates_to_kill() {
        let processes = FakeProcessTable::with_alive(&[11]);
        processes.stubborn.lock().unwrap().insert(11);
        let forced = stop_process(&processes, 11, Duration::from_millis(300)).await.unwrap();
        assert!(forced);
        assert_eq!(*processes.killed.lock().unwrap(), vec![11]);
    }
}
