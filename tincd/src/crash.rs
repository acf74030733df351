// SPDX-License-Identifier: MIT

//! The crash-restart handler (C8, §4.8): installs a real `sigaction` for SIGSEGV and
//! SIGBUS, distinct from the [`crate::signals`] self-pipe path, because the recovery
//! it performs — unlink the pidfile, re-exec the original argv — must run from
//! actual signal-handler context before the corrupted process can do anything else.
//! Modeled on the fork/re-exec mechanics of daemon reload handlers, adapted here
//! from "reload requested" to "we just segfaulted."

use crate::names::NetIdentity;
use std::ffi::CString;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// Set once, before installing the handler, so it can find the pidfile to unlink
/// and the argv to re-exec without allocating inside signal-handler context.
static STATE: AtomicPtr<CrashState> = AtomicPtr::new(std::ptr::null_mut());

/// Guards against a crash loop: if the re-exec'd process faults again before
/// clearing this flag, the handler re-raises the signal with its default
/// disposition instead of re-exec'ing forever (§4.8 "second strike" rule).
static STRUCK_ONCE: AtomicBool = AtomicBool::new(false);

struct CrashState {
    pidfile_path: CString,
    argv: Vec<CString>,
    /// One past the highest fd to try closing before re-exec, from `sysconf` at
    /// install time — calling `sysconf` itself from the handler isn't guaranteed
    /// async-signal-safe, so the value is captured up front.
    max_fd: libc::c_int,
}

/// Installs the SIGSEGV/SIGBUS handler. `identity` names the pidfile to remove;
/// `argv` is what gets re-exec'd, normally `std::env::args_os()` collected at
/// startup before anything could have mutated it.
///
/// # Safety
/// Must be called exactly once, after all other signal handlers are installed and
/// before the main loop starts accepting connections. Leaks `state` deliberately:
/// it must outlive the process, including inside the handler itself.
pub unsafe fn install(identity: &NetIdentity, argv: &[std::ffi::OsString]) -> std::io::Result<()> {
    let pidfile_path = CString::new(identity.pid_file().to_string_lossy().into_owned())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let argv: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.to_string_lossy().into_owned()))
        .collect::<Result<_, _>>()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let open_max = libc::sysconf(libc::_SC_OPEN_MAX);
    let max_fd: libc::c_int = if open_max > 0 { open_max as libc::c_int } else { 1024 };
    let state = Box::new(CrashState {
        pidfile_path,
        argv,
        max_fd,
    });
    STATE.store(Box::into_raw(state), Ordering::SeqCst);

    for &sig in &[libc::SIGSEGV, libc::SIGBUS] {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = libc::SA_RESETHAND;
        if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Marks a clean start: called once the main loop has been running long enough
/// (§4.8's implicit "didn't immediately crash again" signal) that a future fault
/// should be treated as a fresh incident, not a continuation of a crash loop.
pub fn clear_second_strike() {
    STRUCK_ONCE.store(false, Ordering::SeqCst);
}

/// # Safety
/// Only ever invoked by the kernel as a signal handler; must stick to
/// async-signal-safe calls only (`close`, `unlink`, `execvp`, `write`, `_exit` — no
/// allocation, no locking, no `tracing`).
extern "C" fn handler(signum: c_int) {
    if STRUCK_ONCE.swap(true, Ordering::SeqCst) {
        // Second fault before recovery: restore the default disposition and
        // re-raise so the kernel produces a normal core dump / exit instead of
        // looping forever.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = libc::SIG_DFL;
            libc::sigaction(signum, &action, std::ptr::null_mut());
            libc::raise(signum);
        }
        return;
    }

    let state = STATE.load(Ordering::SeqCst);
    if state.is_null() {
        unsafe { libc::_exit(128 + signum) };
    }
    let state = unsafe { &*state };

    unsafe {
        // Best-effort, non-blocking: sockets left open across the re-exec would
        // otherwise keep peers waiting on a connection nothing is servicing.
        // Stdio (0-2) is left alone.
        for fd in 3..state.max_fd {
            libc::close(fd);
        }
        libc::unlink(state.pidfile_path.as_ptr());
    }

    let mut c_argv: Vec<*const libc::c_char> =
        state.argv.iter().map(|a| a.as_ptr()).collect();
    c_argv.push(std::ptr::null());

    unsafe {
        libc::execvp(state.argv[0].as_ptr(), c_argv.as_ptr());
        // execvp only returns on failure.
        libc::_exit(128 + signum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_strike_flag_round_trips() {
        STRUCK_ONCE.store(false, Ordering::SeqCst);
        assert!(!STRUCK_ONCE.swap(true, Ordering::SeqCst));
        clear_second_strike();
        assert!(!STRUCK_ONCE.load(Ordering::SeqCst));
    }
}
