//! Cross-process-safe connection identity.
//!
//! The upstream C daemon stashes a raw `client_conn*` in every ring
//! message and dereferences it back in the connection process. That's
//! unsafe the instant the connection process respawns (a new process, a
//! new heap, the old pointer dangling or aliasing something else) or the
//! record is freed before the response arrives. We replace it with an
//! opaque `(generation, id)` tuple: the connection process's own boot
//! identity plus the monotonic [`crate::ConnId`] it handed out.
//!
//! A worker carries only the tuple. The connection process validates the
//! generation against its *current* boot identity before ever looking the
//! id up in its connection table — a message produced by a connection
//! process that has since died and been respawned fails that check and is
//! dropped instead of resolved against the wrong generation's table.

use crate::conn_id::ConnId;
use core::fmt;

/// Identifies one incarnation of the connection process.
///
/// Assigned once when the connection process starts (its pid is the
/// natural choice: unique for the process's lifetime, and trivially
/// different after a respawn since the kernel won't reuse it while the
/// old one is still referenced by outstanding ring messages in practice).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ConnBootId(u32);

impl ConnBootId {
    #[inline]
    pub const fn new(pid: u32) -> Self {
        ConnBootId(pid)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnBootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `(generation, id)` pair carried in every ring message in place of
/// a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginToken {
    pub boot_id: ConnBootId,
    pub conn_id: ConnId,
}

impl OriginToken {
    pub const fn new(boot_id: ConnBootId, conn_id: ConnId) -> Self {
        Self { boot_id, conn_id }
    }

    /// True when `current` is the connection process that minted this
    /// token. A response whose token fails this check predates a
    /// connection-process respawn and must be discarded, never resolved.
    #[inline]
    pub fn is_current(&self, current: ConnBootId) -> bool {
        self.boot_id == current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_token_is_detected_after_respawn() {
        let old_boot = ConnBootId::new(1001);
        let new_boot = ConnBootId::new(1002);
        let token = OriginToken::new(old_boot, ConnId::new(7));

        assert!(token.is_current(old_boot));
        assert!(!token.is_current(new_boot));
    }
}
