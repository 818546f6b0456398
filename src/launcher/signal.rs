use std::io;

/// Signals the orchestrator sends to a worker's process group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Kill,
}

/// Deliver `signal` to the process group led by `pid`.
///
/// Returns `Ok(false)` when the group no longer exists.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: StopSignal) -> io::Result<bool> {
    let sig = match signal {
        StopSignal::Terminate => libc::SIGTERM,
        StopSignal::Kill => libc::SIGKILL,
    };
    let pgid = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    if pgid <= 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal process group {pgid}"),
        ));
    }

    // SAFETY: kill has no memory-safety preconditions
    let rc = unsafe { libc::kill(-pgid, sig) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _signal: StopSignal) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process group signals need a unix host",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_refuses_special_groups() {
        assert!(signal_group(0, StopSignal::Terminate).is_err());
        assert!(signal_group(1, StopSignal::Kill).is_err());
        assert!(signal_group(u32::MAX, StopSignal::Kill).is_err());
    }

    #[test]
    fn test_missing_group_reports_gone() {
        // Above the kernel's pid_max
        assert!(!signal_group(i32::MAX as u32 - 1, StopSignal::Terminate).unwrap());
    }
}
