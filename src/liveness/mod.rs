use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::debug;

/// Lightweight identity of an OS process, captured right after launch.
///
/// A recycled PID belongs to a process with a different start time (and usually
/// a different name), so comparing both tells our worker apart from a stranger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIdentity {
    /// Seconds since the Unix epoch
    pub start_time: u64,
    pub name: String,
}

/// Answers "is the worker we launched still running?"
///
/// Both calls inspect the OS process table and may block briefly.
pub trait LivenessMonitor: Send + Sync {
    fn identify(&self, pid: u32) -> Option<ProcessIdentity>;

    /// True when `pid` exists, is not a zombie, and matches `hint` if one is given
    fn is_alive(&self, pid: u32, hint: Option<&ProcessIdentity>) -> bool;
}

/// [`LivenessMonitor`] backed by `sysinfo`
pub struct SystemMonitor {
    system: Mutex<System>,
}

impl SystemMonitor {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn inspect(&self, pid: u32) -> Option<(ProcessIdentity, ProcessStatus)> {
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing(),
        );
        let process = system.process(pid)?;
        let identity = ProcessIdentity {
            start_time: process.start_time(),
            name: process.name().to_string_lossy().into_owned(),
        };
        Some((identity, process.status()))
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessMonitor for SystemMonitor {
    fn identify(&self, pid: u32) -> Option<ProcessIdentity> {
        self.inspect(pid).map(|(identity, _)| identity)
    }

    fn is_alive(&self, pid: u32, hint: Option<&ProcessIdentity>) -> bool {
        let (identity, status) = match self.inspect(pid) {
            Some(found) => found,
            None => return false,
        };

        if matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead) {
            debug!("PID {} is a {:?} process", pid, status);
            return false;
        }

        match hint {
            Some(expected) if expected != &identity => {
                debug!(
                    "PID {} was reused: expected {:?}, found {:?}",
                    pid, expected, identity
                );
                false
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        let monitor = SystemMonitor::new();
        let pid = std::process::id();

        let identity = monitor.identify(pid).expect("own process must be visible");
        assert!(monitor.is_alive(pid, None));
        assert!(monitor.is_alive(pid, Some(&identity)));
    }

    #[test]
    fn test_identity_mismatch_reports_dead() {
        let monitor = SystemMonitor::new();
        let pid = std::process::id();
        let identity = monitor.identify(pid).unwrap();

        let reused = ProcessIdentity {
            start_time: identity.start_time.saturating_sub(3600),
            name: identity.name.clone(),
        };
        assert!(!monitor.is_alive(pid, Some(&reused)));

        let renamed = ProcessIdentity {
            start_time: identity.start_time,
            name: "definitely-not-us".to_string(),
        };
        assert!(!monitor.is_alive(pid, Some(&renamed)));
    }

    #[test]
    fn test_missing_pid_is_dead() {
        let monitor = SystemMonitor::new();
        // Above the kernel's pid_max
        assert!(!monitor.is_alive(i32::MAX as u32 - 1, None));
        assert!(monitor.identify(i32::MAX as u32 - 1).is_none());
    }
}
