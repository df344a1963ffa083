//! Cross-process mutual exclusion.
//!
//! Three interchangeable backends, matching the upstream daemon's
//! `lock.h` compile-time choice — here selected at runtime via
//! [`LockKind`] so a single binary can pick one from config:
//!
//! - [`PthreadLock`]: a `pthread_mutex_t` with `PTHREAD_PROCESS_SHARED`,
//!   living inside a [`crate::shared_mem::SharedMem`] mapping so every
//!   forked process sees the same physical mutex.
//! - [`SysvSemLock`]: a single-member System V semaphore, `SEM_UNDO` so a
//!   process that dies while holding the lock doesn't wedge the others.
//! - [`FcntlLock`]: an advisory `fcntl` write lock over an unlinked
//!   temporary file, inherited across `fork` through the shared fd table.
//!
//! All three must be created before the first fork; a worker or
//! connection process never constructs one, only inherits it.

use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;
use vb_core::{Result, VbError};

fn last_errno_err() -> VbError {
    VbError::Io(io::Error::last_os_error())
}

/// Selects which backend [`ProcLock::create`] constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Pthread,
    SysvSem,
    Fcntl,
}

/// A `pthread_mutex_t` shared across processes.
///
/// Must be placed at a stable address inside shared memory: the caller
/// hands us a pointer into a [`crate::shared_mem::SharedMem`] region sized
/// for at least `size_of::<libc::pthread_mutex_t>()` bytes, allocated and
/// initialized before forking.
pub struct PthreadLock {
    mutex: *mut libc::pthread_mutex_t,
}

unsafe impl Send for PthreadLock {}
unsafe impl Sync for PthreadLock {}

impl PthreadLock {
    /// Initializes a `PTHREAD_PROCESS_SHARED` mutex in place.
    ///
    /// # Safety
    /// `mutex` must be valid for writes of `size_of::<pthread_mutex_t>()`
    /// bytes, live inside a `MAP_SHARED` mapping, and outlive every
    /// process that calls `lock`/`unlock` through this handle.
    pub unsafe fn init_at(mutex: *mut libc::pthread_mutex_t) -> Result<Self> {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        if libc::pthread_mutexattr_init(&mut attr) != 0 {
            return Err(last_errno_err());
        }
        if libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED) != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(last_errno_err());
        }
        let rc = libc::pthread_mutex_init(mutex, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if rc != 0 {
            return Err(last_errno_err());
        }
        Ok(Self { mutex })
    }

    pub fn lock(&self) -> Result<()> {
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex) };
        if rc != 0 {
            return Err(VbError::Io(io::Error::from_raw_os_error(rc)));
        }
        Ok(())
    }

    pub fn unlock(&self) -> Result<()> {
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex) };
        if rc != 0 {
            return Err(VbError::Io(io::Error::from_raw_os_error(rc)));
        }
        Ok(())
    }

    /// Destroys the mutex in place. Only the process that created it
    /// should call this, and only after every other process is done.
    pub fn destroy(&self) {
        unsafe {
            libc::pthread_mutex_destroy(self.mutex);
        }
    }
}

/// A single-member System V semaphore used as a binary lock, with
/// `SEM_UNDO` so a crashed holder's unlock is applied by the kernel.
pub struct SysvSemLock {
    semid: libc::c_int,
}

impl SysvSemLock {
    /// Creates a private (non-path-keyed) semaphore set of size 1,
    /// initialized to 1 (unlocked).
    pub fn create() -> Result<Self> {
        let semid = unsafe {
            libc::semget(
                libc::IPC_PRIVATE,
                1,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if semid < 0 {
            return Err(last_errno_err());
        }

        let arg = SemUnion { val: 1 };
        let rc = unsafe { libc::semctl(semid, 0, libc::SETVAL, arg) };
        if rc < 0 {
            let err = last_errno_err();
            unsafe {
                libc::semctl(semid, 0, libc::IPC_RMID, SemUnion { val: 0 });
            }
            return Err(err);
        }
        Ok(Self { semid })
    }

    pub fn lock(&self) -> Result<()> {
        self.semop(-1)
    }

    pub fn unlock(&self) -> Result<()> {
        self.semop(1)
    }

    fn semop(&self, delta: i16) -> Result<()> {
        let mut op = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: libc::SEM_UNDO,
        };
        loop {
            let rc = unsafe { libc::semop(self.semid, &mut op, 1) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(VbError::Io(err));
            }
        }
    }

    pub fn destroy(&self) {
        unsafe {
            libc::semctl(self.semid, 0, libc::IPC_RMID, SemUnion { val: 0 });
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
union SemUnion {
    val: libc::c_int,
}

/// An advisory `fcntl` write lock over an unlinked temp file.
///
/// The fd is created before forking and simply inherited — every process
/// sharing it contends for the same open file description, so whole-file
/// `F_WRLCK`/`F_UNLCK` behaves as a process-wide mutex.
pub struct FcntlLock {
    fd: RawFd,
}

impl FcntlLock {
    /// Creates and immediately unlinks a temp file under `dir` to back
    /// the lock; the fd stays valid as long as some process holds it
    /// open.
    pub fn create(dir: &Path) -> Result<Self> {
        let mut template = dir.join("verben-lock.XXXXXX").into_os_string();
        template.push("\0");
        let bytes = template.into_string().map_err(|_| {
            VbError::Config("lock directory path is not valid UTF-8".to_string())
        })?;
        let mut buf = bytes.into_bytes();
        let fd = unsafe { libc::mkstemp(buf.as_mut_ptr() as *mut libc::c_char) };
        if fd < 0 {
            return Err(last_errno_err());
        }
        let path = std::ffi::CStr::from_bytes_with_nul(&buf[..buf.len()])
            .ok()
            .map(|s| s.to_string_lossy().into_owned());
        if let Some(path) = path {
            let _ = std::fs::remove_file(&path);
        }
        Ok(Self { fd })
    }

    pub fn lock(&self) -> Result<()> {
        self.fcntl_lock(libc::F_WRLCK)
    }

    pub fn unlock(&self) -> Result<()> {
        self.fcntl_lock(libc::F_UNLCK)
    }

    fn fcntl_lock(&self, lock_type: libc::c_short) -> Result<()> {
        let mut l: libc::flock = unsafe { std::mem::zeroed() };
        l.l_type = lock_type;
        l.l_whence = libc::SEEK_SET as libc::c_short;
        l.l_start = 0;
        l.l_len = 0;
        let rc = unsafe { libc::fcntl(self.fd, libc::F_SETLKW, &mut l) };
        if rc < 0 {
            return Err(last_errno_err());
        }
        Ok(())
    }
}

impl Drop for FcntlLock {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A lock picked at runtime from [`LockKind`]; every code path above
/// `vb-ipc` handles `ProcLock`, never the concrete backend type.
pub enum ProcLock {
    Pthread(PthreadLock),
    SysvSem(SysvSemLock),
    Fcntl(FcntlLock),
}

impl ProcLock {
    pub fn lock(&self) -> Result<()> {
        match self {
            ProcLock::Pthread(l) => l.lock(),
            ProcLock::SysvSem(l) => l.lock(),
            ProcLock::Fcntl(l) => l.lock(),
        }
    }

    pub fn unlock(&self) -> Result<()> {
        match self {
            ProcLock::Pthread(l) => l.unlock(),
            ProcLock::SysvSem(l) => l.unlock(),
            ProcLock::Fcntl(l) => l.unlock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysv_sem_round_trips_lock_unlock() {
        let lock = SysvSemLock::create().unwrap();
        lock.lock().unwrap();
        lock.unlock().unwrap();
        lock.destroy();
    }

    #[test]
    fn fcntl_lock_round_trips_lock_unlock() {
        let lock = FcntlLock::create(Path::new("/tmp")).unwrap();
        lock.lock().unwrap();
        lock.unlock().unwrap();
    }

    #[test]
    fn pthread_lock_round_trips_lock_unlock() {
        let mut mutex: libc::pthread_mutex_t = unsafe { std::mem::zeroed() };
        let lock = unsafe { PthreadLock::init_at(&mut mutex as *mut _) }.unwrap();
        lock.lock().unwrap();
        lock.unlock().unwrap();
        lock.destroy();
    }
}
