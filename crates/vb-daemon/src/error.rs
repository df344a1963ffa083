//! Top-level error type for setup code.
//!
//! Mirrors the per-crate `enum ... + Display + Error` pattern used
//! throughout the workspace (see `vb_core::VbError`). The running
//! event/worker loops log and continue rather than propagating;
//! this type is only surfaced by fallible *startup* code in the master,
//! where a failure means a `BOOT_FAILED` line and process exit.

use core::fmt;
use std::io;

#[derive(Debug)]
pub enum DaemonError {
    Io(io::Error),
    Config(String),
    Plugin(String),
    Ipc(vb_core::VbError),
    PidFile(String),
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonError::Io(e) => write!(f, "i/o error: {e}"),
            DaemonError::Config(msg) => write!(f, "config error: {msg}"),
            DaemonError::Plugin(msg) => write!(f, "plugin error: {msg}"),
            DaemonError::Ipc(e) => write!(f, "ipc error: {e}"),
            DaemonError::PidFile(msg) => write!(f, "pid file error: {msg}"),
        }
    }
}

impl std::error::Error for DaemonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DaemonError::Io(e) => Some(e),
            DaemonError::Ipc(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DaemonError {
    fn from(e: io::Error) -> Self {
        DaemonError::Io(e)
    }
}

impl From<vb_core::VbError> for DaemonError {
    fn from(e: vb_core::VbError) -> Self {
        DaemonError::Ipc(e)
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
