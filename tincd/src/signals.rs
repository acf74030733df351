// SPDX-License-Identifier: MIT

//! The signal dispatcher (C2, §4.2). Signals are edge-triggered flags; the only
//! thing that ever runs in actual signal-handler context is the self-pipe write
//! performed internally by `signal-hook`. Everything named in `bind` below runs in
//! normal thread context, once per main-loop iteration, after `SignalSource::drain`.
//!
//! `signal-hook-mio` is what makes this a poll-registered source rather than a
//! separately-spawned thread (§9's redesign note): it implements `mio::event::Source`
//! directly over the same self-pipe `signal-hook` already uses, so C7 registers it
//! next to the meta sockets and the control listener with no additional thread.

use mio::{Interest, Registry, Token};
use signal_hook::consts::signal::*;
use signal_hook_mio::v0_8::Signals;
use std::io;

/// The edge-triggered pending-events bitset of §3/§4.2. One bit per signal kind the
/// daemon binds; `chld`/`segv` are handled by dedicated subsystems (reaping scripts,
/// C8) but still flow through this same bitset so the main loop has one place to look.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PendingEvents {
    pub term: bool,
    pub quit: bool,
    pub int: bool,
    pub hup: bool,
    pub alrm: bool,
    pub usr1: bool,
    pub usr2: bool,
    pub chld: bool,
}

impl PendingEvents {
    /// Any of `term`/`quit`/`int` requests graceful shutdown (§4.2).
    pub fn shutdown_requested(&self) -> bool {
        self.term || self.quit || self.int
    }
}

/// Registers for, and drains, the signals §6 says the daemon accepts (SEGV/BUS are
/// handled by `crate::crash` installing its own `sigaction`, not through this path,
/// since the second-strike guard in C8 must run in genuine signal-handler context).
pub struct SignalSource {
    signals: Signals,
}

const HANDLED: &[libc::c_int] = &[
    SIGTERM, SIGQUIT, SIGINT, SIGHUP, SIGALRM, SIGUSR1, SIGUSR2, SIGCHLD, SIGPIPE,
];

impl SignalSource {
    pub fn new() -> io::Result<Self> {
        let signals = Signals::new(HANDLED.iter().copied())?;
        Ok(SignalSource { signals })
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.signals, token, Interest::READABLE)
    }

    /// Drains every signal delivered since the last call and folds them into a
    /// [`PendingEvents`] bitset. SIGPIPE is accepted (§6) but intentionally has no
    /// bit: it's ignored, which falling off this match arm accomplishes.
    pub fn drain(&mut self) -> PendingEvents {
        let mut events = PendingEvents::default();
        for signal in self.signals.pending() {
            match signal {
                SIGTERM => events.term = true,
                SIGQUIT => events.quit = true,
                SIGINT => events.int = true,
                SIGHUP => events.hup = true,
                SIGALRM => events.alrm = true,
                SIGUSR1 => events.usr1 = true,
                SIGUSR2 => events.usr2 = true,
                SIGCHLD => events.chld = true,
                SIGPIPE => {}
                other => {
                    tracing::warn!(signal = other, "unhandled signal delivered, ignoring");
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_requested_true_for_term_quit_int_only() {
        let mut ev = PendingEvents::default();
        assert!(!ev.shutdown_requested());
        ev.hup = true;
        assert!(!ev.shutdown_requested());
        ev.term = true;
        assert!(ev.shutdown_requested());
    }
}
