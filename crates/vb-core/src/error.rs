//! Crate-wide error type.
//!
//! One plain enum implementing `Display` and `std::error::Error`, the
//! same shape used throughout this workspace rather than reaching for an
//! error-derive crate — each variant names a failure domain a caller can
//! actually branch on.

use core::fmt;
use std::io;

#[derive(Debug)]
pub enum VbError {
    /// Transient I/O failure (EAGAIN/EINTR handled below this layer;
    /// anything else bubbles up wrapped here).
    Io(io::Error),
    /// Peer closed its end of a connection.
    PeerClosed,
    /// A ring or wire message violated the expected framing (bad magic,
    /// truncated header, length out of bounds).
    Framing(&'static str),
    /// A plugin callback returned a failure code or panicked across the
    /// ABI boundary.
    Plugin(String),
    /// A shared resource (ring slot, connection table entry, fd) is
    /// exhausted.
    ResourceExhausted(&'static str),
    /// The ring (or the process reading/writing it) has been signaled to
    /// stop; callers should unwind rather than retry.
    Stopped,
    /// A ring message's origin token didn't match the current connection
    /// process generation — the response arrived for a connection process
    /// that has since respawned.
    StaleOrigin,
    /// Config file problem: syntax, missing include, unresolved variable,
    /// and so on.
    Config(String),
}

impl fmt::Display for VbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VbError::Io(e) => write!(f, "i/o error: {e}"),
            VbError::PeerClosed => write!(f, "peer closed connection"),
            VbError::Framing(msg) => write!(f, "framing error: {msg}"),
            VbError::Plugin(msg) => write!(f, "plugin error: {msg}"),
            VbError::ResourceExhausted(what) => write!(f, "resource exhausted: {what}"),
            VbError::Stopped => write!(f, "stopped"),
            VbError::StaleOrigin => write!(f, "stale origin token"),
            VbError::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for VbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VbError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for VbError {
    fn from(e: io::Error) -> Self {
        VbError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, VbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_displays_wrapped_source() {
        let err = VbError::from(io::Error::new(io::ErrorKind::NotFound, "nope"));
        assert!(err.to_string().contains("i/o error"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn non_io_variants_have_no_source() {
        let err = VbError::Stopped;
        assert!(std::error::Error::source(&err).is_none());
    }
}
