//! PID-file lifecycle: exclusive create, advisory write-lock, unlink.
//!
//! `O_CREAT|O_EXCL|0644`, decimal pid content, an advisory `fcntl`
//! write-lock held for the master's whole lifetime so a second
//! `verben start` against the same file fails instead of silently
//! running two masters.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{DaemonError, Result};

/// An open, locked PID file. Dropping or calling [`PidFile::remove`]
/// unlinks it; the lock itself is released by the kernel when the fd
/// closes, which happens automatically on process exit even without an
/// explicit unlock.
pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    /// Creates `path` exclusively, writes the current pid, and takes an
    /// advisory write-lock. Fails if the file already exists (another
    /// master is presumably running) or the lock can't be acquired.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(path)
            .map_err(|e| {
                DaemonError::PidFile(format!(
                    "{}: {e} (is another verben master already running?)",
                    path.display()
                ))
            })?;

        lock_exclusive(&file).map_err(|e| {
            DaemonError::PidFile(format!("{}: failed to lock pid file: {e}", path.display()))
        })?;

        let mut f = file;
        writeln!(f, "{}", std::process::id())
            .map_err(|e| DaemonError::PidFile(format!("{}: {e}", path.display())))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: f,
        })
    }

    /// Unlinks the pid file. Called by the master right before exit.
    pub fn remove(self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Reads the decimal pid recorded in `path`, for `verben stop`.
pub fn read_pid(path: &Path) -> Result<i32> {
    let mut content = String::new();
    File::open(path)
        .map_err(|e| DaemonError::PidFile(format!("{}: {e}", path.display())))?
        .read_to_string(&mut content)
        .map_err(|e| DaemonError::PidFile(format!("{}: {e}", path.display())))?;
    content
        .trim()
        .parse::<i32>()
        .map_err(|e| DaemonError::PidFile(format!("{}: malformed pid: {e}", path.display())))
}

fn lock_exclusive(file: &File) -> std::io::Result<()> {
    let mut l: libc::flock = unsafe { std::mem::zeroed() };
    l.l_type = libc::F_WRLCK as libc::c_short;
    l.l_whence = libc::SEEK_SET as libc::c_short;
    l.l_start = 0;
    l.l_len = 0;
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &l) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_read_round_trips_pid() {
        let path = std::env::temp_dir().join(format!("vb-daemon-pidfile-test-{}.pid", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let pf = PidFile::create(&path).unwrap();
        let read_back = read_pid(&path).unwrap();
        assert_eq!(read_back, std::process::id() as i32);
        pf.remove();
        assert!(!path.exists());
    }

    #[test]
    fn second_create_against_same_path_fails() {
        let path = std::env::temp_dir().join(format!("vb-daemon-pidfile-dup-{}.pid", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let pf = PidFile::create(&path).unwrap();
        assert!(PidFile::create(&path).is_err());
        pf.remove();
    }
}
