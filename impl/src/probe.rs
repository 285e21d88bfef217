//! Non-destructive liveness probe for recorded pids.
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Result of probing a recorded pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The process exists and this principal may signal it.
    Alive,
    /// No such process.
    Dead,
    /// The process exists but is owned by another user.
    ///
    /// Treated as alive for control purposes; the supervisor must never
    /// claim a foreign process is dead merely because it cannot signal
    /// it.
    Foreign,
}

impl Liveness {
    /// Whether the probed pid refers to a running process.
    pub fn is_running(self) -> bool {
        matches!(self, Liveness::Alive | Liveness::Foreign)
    }
}

/// Probe a pid with a zero-effect signal delivery.
///
/// `probe(None)` is `Dead`.
pub fn probe(pid: Option<u32>) -> Liveness {
    let pid = match pid {
        Some(pid) => pid,
        None => return Liveness::Dead,
    };
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => Liveness::Alive,
        Err(Errno::EPERM) => Liveness::Foreign,
        Err(_) => Liveness::Dead,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_pid_is_dead() {
        assert_eq!(probe(None), Liveness::Dead);
        assert!(!probe(None).is_running());
    }

    #[test]
    fn own_pid_is_alive() {
        let probed = probe(Some(std::process::id()));
        assert_eq!(probed, Liveness::Alive);
        assert!(probed.is_running());
    }

    #[test]
    fn foreign_counts_as_running() {
        assert!(Liveness::Foreign.is_running());
        assert!(Liveness::Alive.is_running());
        assert!(!Liveness::Dead.is_running());
    }
}
