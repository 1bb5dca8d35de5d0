//! Module host supervision through the session's host pid field.

use rtx_shared_memory::Session;
use rtx_shared_memory::platform::is_process_alive;

/// What the last check saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    /// No host has registered yet.
    Absent,
    /// Host `pid` is alive.
    Running(u32),
    /// Host `pid` cleared its pid field on the way out.
    Exited(u32),
    /// Host `pid` is gone but its pid field is still set.
    Died(u32),
}

impl HostStatus {
    /// The daemon should shut down.
    pub fn ends_session(self) -> bool {
        matches!(self, HostStatus::Exited(_) | HostStatus::Died(_))
    }
}

/// Tracks the host pid between checks.
#[derive(Debug, Default)]
pub struct HostWatch {
    last_pid: u32,
}

impl HostWatch {
    /// Watch with no host seen yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last host pid observed, `0` if none.
    pub fn last_pid(&self) -> u32 {
        self.last_pid
    }

    /// Inspect the host pid of `session`.
    pub fn check(&mut self, session: &Session) -> HostStatus {
        self.observe(session.host_pid(), is_process_alive)
    }

    fn observe(&mut self, pid: u32, alive: impl Fn(u32) -> bool) -> HostStatus {
        match (pid, self.last_pid) {
            (0, 0) => HostStatus::Absent,
            (0, last) => HostStatus::Exited(last),
            (pid, _) if !alive(pid) => HostStatus::Died(pid),
            (pid, _) => {
                self.last_pid = pid;
                HostStatus::Running(pid)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_of_a_host() {
        let mut watch = HostWatch::new();
        assert_eq!(watch.observe(0, |_| true), HostStatus::Absent);
        assert_eq!(watch.observe(42, |_| true), HostStatus::Running(42));
        assert_eq!(watch.last_pid(), 42);
        assert_eq!(watch.observe(0, |_| true), HostStatus::Exited(42));
        assert!(HostStatus::Exited(42).ends_session());
        assert!(!HostStatus::Running(42).ends_session());
    }

    #[test]
    fn dead_pid_is_reported() {
        let mut watch = HostWatch::new();
        assert_eq!(watch.observe(7, |_| false), HostStatus::Died(7));
        assert!(HostStatus::Died(7).ends_session());
    }
}
