// SPDX-License-Identifier: MIT

//! Derives filesystem names from a net identifier and acquires the single-instance
//! pidfile lock (C1, §4.1). Distinct from `daemon::Daemonizing::make_pidfile`: that
//! routine uses an `fcntl` lock on a side file, which is fine for the detach/monitor
//! fork dance but doesn't give us the "read the old pid, `kill(pid, 0)` it, print a
//! human message" flow scenario 1 and 2 in §8 ask for, so C1 owns a small pidfile
//! protocol of its own built directly on `libc`.

use crate::error::DaemonError;
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{event, Level};

/// Compile-time defaults; real installs normally override these via `-c`/`-n`.
pub const DEFAULT_CONFDIR: &str = "/etc/tinc";
pub const DEFAULT_RUNDIR: &str = "/var/run";

/// The four filesystem names derived from an optional net name (§4.1).
#[derive(Debug, Clone)]
pub struct NetIdentity {
    pub net_name: Option<String>,
    pub confdir: PathBuf,
    pub rundir: PathBuf,
}

impl NetIdentity {
    pub fn new(net_name: Option<String>, confdir: PathBuf, rundir: PathBuf) -> Self {
        NetIdentity {
            net_name,
            confdir,
            rundir,
        }
    }

    fn suffix(&self) -> String {
        match &self.net_name {
            Some(name) => format!(".{name}"),
            None => String::new(),
        }
    }

    /// `<CONFDIR>/tinc[/<netname>]`
    pub fn config_base_dir(&self) -> PathBuf {
        match &self.net_name {
            Some(name) => self.confdir.join("tinc").join(name),
            None => self.confdir.join("tinc"),
        }
    }

    /// `<CONFDIR>/tinc[/<netname>]/tincd.conf`
    pub fn config_file(&self) -> PathBuf {
        self.config_base_dir().join("tincd.conf")
    }

    /// `/var/run/tincd[.<netname>].pid`
    pub fn pid_file(&self) -> PathBuf {
        self.rundir.join(format!("tincd{}.pid", self.suffix()))
    }

    /// `tincd[.<netname>]`
    pub fn syslog_ident(&self) -> String {
        format!("tincd{}", self.suffix())
    }
}

/// Returns `true` if `pid` names a live process, per the `kill(pid, 0)` convention:
/// success or any errno other than `ESRCH` means "still there" (e.g. `EPERM` means
/// it's alive but owned by someone else).
fn pid_is_alive(pid: i32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

fn read_pid_file(path: &Path) -> Result<Option<i32>> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let pid: i32 = contents
                .trim()
                .parse()
                .with_context(|| format!("{}: not a valid pid", path.display()))?;
            Ok(Some(pid))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("{}: read failed", path.display())),
    }
}

/// Acquires the single-instance lock for `identity`: if an existing pidfile names a
/// live process, returns `DaemonError::AlreadyRunning`; otherwise atomically
/// create-exclusives the pidfile with our own pid (invariant 4 and 1 in §3/§8).
pub fn acquire_pid_lock(identity: &NetIdentity) -> Result<PathBuf> {
    let path = identity.pid_file();

    if let Some(pid) = read_pid_file(&path)? {
        if pid_is_alive(pid) {
            return Err(DaemonError::AlreadyRunning {
                path: path.display().to_string(),
                pid,
            }
            .into());
        }
        event!(Level::WARN, "{}: stale pidfile for dead pid {pid}, replacing", path.display());
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("{}: could not create directory", parent.display()))?;
    }

    let mut file = File::options()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .with_context(|| format!("{}: create failed", path.display()))?;
    writeln!(file, "{}", std::process::id())
        .with_context(|| format!("{}: write failed", path.display()))?;
    Ok(path)
}

/// Releases the lock taken by [`acquire_pid_lock`]. Invariant 6 in §8: after any
/// graceful shutdown path, the pidfile is absent.
pub fn release_pid_lock(identity: &NetIdentity) {
    let path = identity.pid_file();
    if let Err(e) = fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            event!(Level::WARN, "{}: could not remove pidfile ({e})", path.display());
        }
    }
}

/// `--kill`: send SIGTERM to whatever pid the pidfile names and unlink it. Scenario 2
/// in §8: a stale (dead-pid) pidfile is still removed, with the documented message.
///
/// Preserves the source's cosmetic quirk (§9 Open Questions): "Removing stale lock
/// file." is printed both when the pid turned out to be dead (ESRCH) *and* after a
/// successful kill, not only on the stale-lock path.
pub fn kill_other(identity: &NetIdentity) -> Result<()> {
    let path = identity.pid_file();
    let pid = match read_pid_file(&path)? {
        Some(pid) => pid,
        None => {
            anyhow::bail!("{}: no such file, no tincd running for this net", path.display());
        }
    };

    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        eprintln!("Removing stale lock file.");
    } else {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            eprintln!("Removing stale lock file.");
        } else {
            return Err(err).with_context(|| format!("could not signal pid {pid}"));
        }
    }

    fs::remove_file(&path).or_else(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Ok(())
        } else {
            Err(e)
        }
    })
    .with_context(|| format!("{}: could not remove", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn identity(dir: &Path) -> NetIdentity {
        NetIdentity::new(Some("v1".into()), dir.join("etc"), dir.join("run"))
    }

    #[test]
    fn derives_netname_scoped_paths() {
        let dir = tempdir().unwrap();
        let id = identity(dir.path());
        assert_eq!(
            id.pid_file(),
            dir.path().join("run").join("tincd.v1.pid")
        );
        assert_eq!(id.syslog_ident(), "tincd.v1");
        assert!(id.config_file().ends_with("tinc/v1/tincd.conf"));
    }

    #[test]
    fn default_identity_has_no_suffix() {
        let dir = tempdir().unwrap();
        let id = NetIdentity::new(None, dir.path().join("etc"), dir.path().join("run"));
        assert_eq!(id.pid_file(), dir.path().join("run").join("tincd.pid"));
        assert_eq!(id.syslog_ident(), "tincd");
    }

    #[test]
    fn acquire_then_release_round_trips() {
        let dir = tempdir().unwrap();
        let id = identity(dir.path());
        let path = acquire_pid_lock(&id).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
        release_pid_lock(&id);
        assert!(!path.exists());
    }

    #[test]
    fn acquire_fails_if_pid_still_alive() {
        let dir = tempdir().unwrap();
        let id = identity(dir.path());
        fs::create_dir_all(id.pid_file().parent().unwrap()).unwrap();
        fs::write(id.pid_file(), format!("{}\n", std::process::id())).unwrap();
        let err = acquire_pid_lock(&id).unwrap_err();
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn acquire_replaces_stale_pidfile() {
        let dir = tempdir().unwrap();
        let id = identity(dir.path());
        fs::create_dir_all(id.pid_file().parent().unwrap()).unwrap();
        // A pid essentially guaranteed not to be alive in a test sandbox.
        fs::write(id.pid_file(), "999999\n").unwrap();
        acquire_pid_lock(&id).unwrap();
        let contents = fs::read_to_string(id.pid_file()).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    fn kill_other_removes_stale_lock() {
        let dir = tempdir().unwrap();
        let id = identity(dir.path());
        fs::create_dir_all(id.pid_file().parent().unwrap()).unwrap();
        fs::write(id.pid_file(), "999999\n").unwrap();
        kill_other(&id).unwrap();
        assert!(!id.pid_file().exists());
    }
}
