//! Child process tracking and two-phase process-group termination.
//!
//! Every subprocess the gateway owns (provider children, the sandbox host) is
//! registered here by PID. Termination is two-phase: a polite TERM to the
//! whole process group, a short grace window, then a hard KILL that reaches
//! children and grandchildren. On POSIX the group is addressed via
//! `killpg`; on Windows `taskkill /T /F` walks the process tree.

use std::time::Duration;

use dashmap::DashSet;
use tracing::{debug, warn};

/// Grace window between the polite and the hard kill.
pub const KILL_GRACE: Duration = Duration::from_millis(500);

/// Registry of live child PIDs owned by the gateway.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    pids: DashSet<u32>,
}

impl ProcessRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            pids: DashSet::new(),
        }
    }

    /// Track a spawned child by PID
    pub fn track(&self, pid: u32) {
        debug!(pid, "Tracking child process");
        self.pids.insert(pid);
    }

    /// Stop tracking a PID (after it has been reaped)
    pub fn untrack(&self, pid: u32) {
        self.pids.remove(&pid);
    }

    /// Snapshot of currently tracked PIDs
    #[must_use]
    pub fn tracked(&self) -> Vec<u32> {
        self.pids.iter().map(|p| *p).collect()
    }

    /// Terminate one tracked process group and stop tracking it.
    pub async fn terminate(&self, pid: u32) {
        self.pids.remove(&pid);
        terminate_group(pid).await;
    }

    /// Terminate every tracked process group concurrently.
    pub async fn terminate_all(&self) {
        let pids = self.tracked();
        self.pids.clear();
        futures::future::join_all(pids.into_iter().map(terminate_group)).await;
    }
}

/// Two-phase termination of the process group led by `pid`.
///
/// Best-effort: a group that is already gone is not an error.
pub async fn terminate_group(pid: u32) {
    if pid == 0 {
        // PID 0 would address our own process group.
        return;
    }
    signal_group(pid, false);
    tokio::time::sleep(KILL_GRACE).await;
    if group_alive(pid) {
        warn!(pid, "Process group survived polite termination, hard-killing");
        signal_group(pid, true);
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, hard: bool) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::{Pid, getpgid};

    let pid = Pid::from_raw(i32::try_from(pid).unwrap_or(0));
    let Ok(pgid) = getpgid(Some(pid)) else {
        return;
    };
    let signal = if hard { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = killpg(pgid, signal) {
        if e != nix::errno::Errno::ESRCH {
            debug!(?e, "killpg failed");
        }
    }
}

#[cfg(unix)]
fn group_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Signal 0 probes for existence without delivering anything.
    kill(Pid::from_raw(i32::try_from(pid).unwrap_or(0)), None).is_ok()
}

#[cfg(windows)]
fn signal_group(pid: u32, hard: bool) {
    // taskkill /T recurses the process tree; /F is the hard variant.
    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/PID", &pid.to_string(), "/T"]);
    if hard {
        cmd.arg("/F");
    }
    if let Err(e) = cmd.output() {
        debug!(?e, "taskkill failed");
    }
}

#[cfg(windows)]
fn group_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}")])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
fn signal_group(_pid: u32, _hard: bool) {}

#[cfg(not(any(unix, windows)))]
fn group_alive(_pid: u32) -> bool {
    false
}
