//! Signal flags and handler installation.
//!
//! Grounded on `original_source/src/verben.c`'s `signals[]` table and
//! `vb_signal_handler`: a single handler dispatches on the current
//! process's role, setting the same three flags the C globals
//! (`vb_quit`, `vb_reap`, `vb_worker_quit`) held. Only
//! `AtomicBool`/`AtomicI32` touches happen inside the handler itself,
//! matching the async-signal-safety the original got from plain `int`
//! writes; the connection process additionally needs to wake its
//! blocked epoll call, which is done by `vb-reactor`'s own stop flag
//! rather than from here.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SigHandler, Signal};

use crate::error::{DaemonError, Result};

/// Set by `SIGTERM`/`SIGQUIT` in the master; checked once per cycle.
pub static QUIT: AtomicBool = AtomicBool::new(false);
/// Set by `SIGCHLD` in the master; the run loop calls `waitpid` and
/// clears this after reaping.
pub static REAP: AtomicBool = AtomicBool::new(false);
/// Set by `SIGTERM` in a worker process.
pub static WORKER_QUIT: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_master(signo: libc::c_int) {
    match Signal::try_from(signo) {
        Ok(Signal::SIGTERM) | Ok(Signal::SIGQUIT) => QUIT.store(true, Ordering::SeqCst),
        Ok(Signal::SIGCHLD) => REAP.store(true, Ordering::SeqCst),
        _ => {}
    }
}

extern "C" fn handle_worker(signo: libc::c_int) {
    if signo == Signal::SIGTERM as libc::c_int {
        WORKER_QUIT.store(true, Ordering::SeqCst);
    }
}

/// Connection process handler just needs `SIGTERM` observed somewhere
/// a reactor callback can see it; reuses the master's `QUIT` flag since
/// only one role runs per process and the reactor's `before_sleep` hook
/// checks it to call `Reactor::stop`.
extern "C" fn handle_conn(signo: libc::c_int) {
    if signo == Signal::SIGTERM as libc::c_int {
        QUIT.store(true, Ordering::SeqCst);
    }
}

fn install(signal: Signal, handler: SigHandler) -> Result<()> {
    unsafe { signal::sigaction(signal, &signal::SigAction::new(handler, signal::SaFlags::empty(), signal::SigSet::empty())) }
        .map_err(|e| DaemonError::Config(format!("sigaction({signal:?}): {e}")))?;
    Ok(())
}

/// Installs signal handlers appropriate to `role`. `SIGPIPE` is always
/// ignored, matching the original's `SIG_IGN` table entry (a worker or
/// connection process writing to an already-closed socket must see
/// `EPIPE` from `write()`, not die).
pub fn install_for_role(role: vb_core::Role) -> Result<()> {
    install(Signal::SIGPIPE, SigHandler::SigIgn)?;

    match role {
        vb_core::Role::Master => {
            install(Signal::SIGTERM, SigHandler::Handler(handle_master))?;
            install(Signal::SIGQUIT, SigHandler::Handler(handle_master))?;
            install(Signal::SIGCHLD, SigHandler::Handler(handle_master))?;
        }
        vb_core::Role::Worker => {
            install(Signal::SIGTERM, SigHandler::Handler(handle_worker))?;
        }
        vb_core::Role::Connection => {
            install(Signal::SIGTERM, SigHandler::Handler(handle_conn))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_for_master_does_not_error() {
        install_for_role(vb_core::Role::Master).unwrap();
        QUIT.store(false, Ordering::SeqCst);
        REAP.store(false, Ordering::SeqCst);
    }
}
