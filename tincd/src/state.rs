// SPDX-License-Identifier: MIT

//! The process-wide `DaemonState` singleton (§3). Constructed once in `main`,
//! mutated only by the main loop; the signal dispatcher writes exclusively to the
//! pending-events bitset owned by [`crate::signals::PendingEvents`], never here.

use std::ffi::OsString;
use std::time::Instant;

/// Process-wide state threaded through the main loop. Collects what the teacher's
/// `daemon-unix.c`-derived ancestor kept as free-standing global variables (§9
/// "Global mutable state" redesign note) into one owned value.
pub struct DaemonState {
    /// 0..=5, raised by repeated `-d`.
    pub debug_level: u8,
    pub detached: bool,
    pub running: bool,
    pub start_time: Instant,
    /// Original command-line argv, captured before `Daemonize::run` forks (§3 data
    /// model: "original argv copy for re-exec"). `crash::install` keeps its own copy
    /// for use inside signal-handler context; this one is for anything else that
    /// needs it (diagnostics, a future non-signal re-exec path).
    pub original_argv: Vec<OsString>,
    /// The monitor process's pid when `--monitor` forked one (§3 data model:
    /// "parent PID of the supervisor"). `None` when running undetached or without a
    /// monitor.
    pub supervisor_pid: Option<i32>,
}

impl DaemonState {
    pub fn new(
        debug_level: u8,
        detached: bool,
        original_argv: Vec<OsString>,
        supervisor_pid: Option<i32>,
    ) -> Self {
        DaemonState {
            debug_level,
            detached,
            running: true,
            start_time: Instant::now(),
            original_argv,
            supervisor_pid,
        }
    }

    pub fn request_shutdown(&mut self) {
        self.running = false;
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running_until_shutdown_requested() {
        let mut state = DaemonState::new(0, false, Vec::new(), None);
        assert!(state.running);
        state.request_shutdown();
        assert!(!state.running);
    }
}
