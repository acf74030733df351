// SPDX-License-Identifier: MIT

//! The error taxonomy of §7: a small closed set of kinds that the main loop and
//! connection handlers branch on, wrapped so that `?` still works against `anyhow`
//! at call sites that just want to propagate and log.

use std::io;

/// One of the error kinds named in the specification's error-handling design.
///
/// Variants carry just enough context to log a useful message; they are not meant
/// to be pattern-matched deeply by callers beyond "which policy bucket does this
/// fall into" (see the doc comment on each variant for its handling policy).
#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    /// A read/write/accept/connect syscall failed. Closes the connection it occurred
    /// on; does not bring down the daemon.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A meta-protocol line violated framing or dispatch rules (too long, embedded
    /// NUL, wrong arity, wrong state). Closes the connection.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Handshake authentication failed (bad hash, unknown peer name, decrypt
    /// failure). Closes the connection; outgoing connections are retried with backoff.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The crypto collaborator (`CipherSuite`) returned an error.
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),

    /// Configuration could not be parsed. Fatal at startup; logged and ignored on
    /// SIGHUP reload (§7).
    #[error("configuration error: {0}")]
    Config(String),

    /// Another instance already holds the pidfile lock for this net.
    #[error("{path}: already running as pid {pid}")]
    AlreadyRunning { path: String, pid: i32 },

    /// A connection or handshake exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// An operation that requires uniqueness (registry insert, subnet claim)
    /// collided with an existing entry.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A peer advertised a meta-protocol version newer than ours.
    #[error("incompatible protocol version: peer={peer}, ours={ours}")]
    IncompatibleVersion { peer: u32, ours: u32 },

    /// Unrecoverable: memory exhaustion, fork failure during init, etc. Always
    /// followed by `exit(1)` after best-effort cleanup.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl DaemonError {
    /// Whether this error, when it occurs on a single connection, should merely
    /// close that connection and keep the daemon running (§7 policy table).
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            DaemonError::Io(_)
                | DaemonError::Protocol(_)
                | DaemonError::Auth(_)
                | DaemonError::Crypto(_)
                | DaemonError::Timeout(_)
                | DaemonError::IncompatibleVersion { .. }
                | DaemonError::Duplicate(_)
        )
    }
}

/// A `(file, line)` pair recorded at a function boundary, surfaced in fatal-error
/// logs per §7. Cheap enough to construct unconditionally via the `checkpoint!` macro.
#[derive(Clone, Copy, Debug)]
pub struct Checkpoint {
    pub file: &'static str,
    pub line: u32,
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Expands to a [`Checkpoint`] for the call site.
#[macro_export]
macro_rules! checkpoint {
    () => {
        $crate::error::Checkpoint {
            file: file!(),
            line: line!(),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_scoped_classification() {
        assert!(DaemonError::Timeout("ping".into()).is_connection_scoped());
        assert!(!DaemonError::AlreadyRunning {
            path: "/var/run/tincd.pid".into(),
            pid: 123
        }
        .is_connection_scoped());
        assert!(!DaemonError::Fatal("oom".into()).is_connection_scoped());
    }

    #[test]
    fn checkpoint_formats_as_file_colon_line() {
        let cp = checkpoint!();
        assert!(cp.to_string().contains("error.rs"));
    }
}
