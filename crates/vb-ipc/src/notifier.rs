//! Wake notifier.
//!
//! A non-blocking, close-on-exec pipe created before the first fork.
//! Every worker shares the write end; the connection process holds the
//! read end in its event loop and drains it on readability. One byte per
//! wakeup is all that's needed — the reactor doesn't care how many
//! workers rang the bell, only that at least one did.

use nix::fcntl::OFlag;
use nix::unistd;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use vb_core::{Result, VbError};

const DRAIN_BUF_LEN: usize = 1024;

/// The read half, owned by the connection process.
pub struct NotifierReader {
    fd: OwnedFd,
}

/// The write half, cloned (by fd duplication, pre-fork) into every
/// worker.
pub struct NotifierWriter {
    fd: OwnedFd,
}

/// Creates the pipe. Call once in the master before forking; pass the
/// reader to the connection process and the writer to each worker.
pub fn create() -> Result<(NotifierReader, NotifierWriter)> {
    let (read_fd, write_fd) = unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
        .map_err(|e| VbError::from(std::io::Error::from(e)))?;
    Ok((
        NotifierReader { fd: read_fd },
        NotifierWriter { fd: write_fd },
    ))
}

impl NotifierReader {
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Duplicates the read end, for handing an independently-owned copy
    /// to each connection-process incarnation the master spawns (initial
    /// spawn and every respawn need their own value to move into
    /// `conn::run`, which consumes it).
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone()?,
        })
    }

    /// Drains every pending wakeup byte. Called when the reactor reports
    /// the notifier fd readable; returns the number of bytes drained (0
    /// is a spurious wakeup, not an error).
    pub fn drain(&self) -> Result<usize> {
        let mut buf = [0u8; DRAIN_BUF_LEN];
        let mut total = 0;
        loop {
            match unistd::read(self.fd.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if n < DRAIN_BUF_LEN {
                        break;
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(std::io::Error::from(e).into()),
            }
        }
        Ok(total)
    }
}

impl NotifierWriter {
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Duplicates the write end, one per worker the master spawns or
    /// respawns.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone()?,
        })
    }

    /// Rings the bell. `EAGAIN` (pipe buffer full, meaning a wakeup is
    /// already pending and unread) is not an error.
    pub fn notify(&self) -> Result<()> {
        match unistd::write(&self.fd, &[b'x']) {
            Ok(_) => Ok(()),
            Err(nix::errno::Errno::EAGAIN) => Ok(()),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_drain_sees_one_byte() {
        let (reader, writer) = create().unwrap();
        writer.notify().unwrap();
        let n = reader.drain().unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn drain_with_nothing_pending_is_zero() {
        let (reader, _writer) = create().unwrap();
        assert_eq!(reader.drain().unwrap(), 0);
    }

    #[test]
    fn cloned_writer_notifies_the_same_pipe() {
        let (reader, writer) = create().unwrap();
        let clone = writer.try_clone().unwrap();
        clone.notify().unwrap();
        assert_eq!(reader.drain().unwrap(), 1);
    }

    #[test]
    fn repeated_notifies_coalesce_to_available_bytes() {
        let (reader, writer) = create().unwrap();
        for _ in 0..5 {
            writer.notify().unwrap();
        }
        assert_eq!(reader.drain().unwrap(), 5);
    }
}
