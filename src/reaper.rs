//! Crash-recovery sweep over processes left behind by a previous run.

use std::collections::BTreeSet;

/// Result of asking the OS to terminate one process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SignalOutcome {
    /// The termination signal was delivered.
    Delivered,
    /// The process no longer exists or belongs to someone else.
    AlreadyGone,
    /// Any other OS failure.
    Failed(String),
}

/// OS seam used by the recovery sweep.
pub trait ProcessReaper: Send + Sync {
    /// Whether a process with this identifier currently exists.
    fn is_alive(&self, pid: u32) -> bool;

    /// Send a termination signal to the process.
    fn terminate(&self, pid: u32) -> SignalOutcome;
}

/// Summary of one recovery sweep.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SweepReport {
    /// Number of identifiers found in the registry.
    pub tracked: usize,
    /// Identifiers that were alive and received a termination signal.
    pub signalled: Vec<u32>,
    /// Identifiers that were already gone (or not ours to signal).
    pub already_gone: Vec<u32>,
    /// Identifiers whose signal failed for an unexpected reason.
    pub failed: Vec<u32>,
}

/// Terminate every still-alive process in `pids`.
///
/// Never fails: unexpected OS errors are logged and recorded in the report.
pub fn sweep(reaper: &dyn ProcessReaper, pids: &BTreeSet<u32>) -> SweepReport {
    let mut report = SweepReport {
        tracked: pids.len(),
        ..SweepReport::default()
    };

    for &pid in pids {
        if !reaper.is_alive(pid) {
            report.already_gone.push(pid);
            continue;
        }
        match reaper.terminate(pid) {
            SignalOutcome::Delivered => {
                tracing::info!(pid, "terminated orphaned session process");
                report.signalled.push(pid);
            }
            SignalOutcome::AlreadyGone => report.already_gone.push(pid),
            SignalOutcome::Failed(error) => {
                tracing::warn!(pid, error = %error, "failed to terminate orphaned process");
                report.failed.push(pid);
            }
        }
    }

    report
}

/// [`ProcessReaper`] backed by the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsReaper;

#[cfg(unix)]
impl ProcessReaper for OsReaper {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;

        let Some(pid) = to_nix_pid(pid) else {
            return false;
        };
        // Signal 0 checks existence; EPERM means it exists under another user.
        matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM))
    }

    fn terminate(&self, pid: u32) -> SignalOutcome {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, killpg, Signal};

        let Some(pid) = to_nix_pid(pid) else {
            return SignalOutcome::AlreadyGone;
        };
        let outcome = match kill(pid, Signal::SIGTERM) {
            Ok(()) => SignalOutcome::Delivered,
            Err(Errno::ESRCH | Errno::EPERM) => SignalOutcome::AlreadyGone,
            Err(e) => SignalOutcome::Failed(e.to_string()),
        };
        if outcome == SignalOutcome::Delivered {
            // Session shells lead their own process group and ignore SIGTERM
            // when interactive; hang up the whole group as well.
            let _ = killpg(pid, Signal::SIGHUP);
        }
        outcome
    }
}

#[cfg(unix)]
fn to_nix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(nix::unistd::Pid::from_raw)
}

#[cfg(windows)]
impl ProcessReaper for OsReaper {
    fn is_alive(&self, pid: u32) -> bool {
        let mut system = sysinfo::System::new();
        system.refresh_process(sysinfo::Pid::from_u32(pid))
    }

    fn terminate(&self, pid: u32) -> SignalOutcome {
        let pid = sysinfo::Pid::from_u32(pid);
        let mut system = sysinfo::System::new();
        if !system.refresh_process(pid) {
            return SignalOutcome::AlreadyGone;
        }
        match system.process(pid) {
            Some(process) => {
                let delivered = process
                    .kill_with(sysinfo::Signal::Term)
                    .unwrap_or_else(|| process.kill());
                if delivered {
                    SignalOutcome::Delivered
                } else {
                    SignalOutcome::Failed("process refused termination".to_string())
                }
            }
            None => SignalOutcome::AlreadyGone,
        }
    }
}
