//! Byte-granular shared-memory ring queue.
//!
//! The transport between the connection process and the worker pool:
//! the connection process pushes framed requests onto the recv-ring,
//! workers pop them; workers push responses onto the send-ring, the
//! connection process pops them. Both directions use the same ring type.
//!
//! Wire-compatible in spirit (not byte-for-byte, since the block header
//! no longer needs to match a C struct) with the upstream `shmq.c`: a
//! head/tail pair of byte offsets into a flat buffer, blocks written at
//! head and consumed at tail, with PAD blocks marking the unused tail of
//! the buffer when a block wouldn't fit before wrapping.
//!
//! # Layout
//!
//! ```text
//! [ RingHeader | lock reservation | ring data: blocks... ]
//! ```
//!
//! `RingHeader.head`/`.tail` are byte offsets relative to the start of
//! the mapping (matching the upstream convention), so `data_offset` must
//! be added back out whenever comparing against the ring's usable data
//! window.

use crate::lock::{FcntlLock, LockKind, ProcLock, PthreadLock, SysvSemLock};
use crate::shared_mem::SharedMem;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;
use vb_core::{Result, VbError};

const BLOCK_TYPE_DAT: u8 = 0;
const BLOCK_TYPE_PAD: u8 = 1;

/// `size_of::<BlockHeader>()` is fixed regardless of target, since every
/// field is explicitly sized.
const BLOCK_HEADER_LEN: usize = 5;

/// Space reserved right after [`RingHeader`] for an in-place
/// `pthread_mutex_t`, so the pthread lock backend works no matter which
/// process constructed the ring. Oversized for the other two backends,
/// which don't use it, but keeps the data offset constant regardless of
/// `LockKind`.
const LOCK_RESERVATION: usize = 64;

const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Mirrors the upstream `SHMQ_WAIT` / `SHMQ_LOCK` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFlags(u32);

impl RingFlags {
    /// Block (polling) until the operation can proceed, rather than
    /// failing immediately.
    pub const WAIT: RingFlags = RingFlags(0x01);
    /// Take the ring's cross-process lock around the operation. Omit
    /// this when the caller already holds it, or when the ring has
    /// exactly one producer and one consumer and a weaker ordering
    /// guarantee is acceptable.
    pub const LOCK: RingFlags = RingFlags(0x02);

    #[inline]
    pub const fn empty() -> Self {
        RingFlags(0)
    }

    #[inline]
    pub const fn contains(self, other: RingFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for RingFlags {
    type Output = RingFlags;
    fn bitor(self, rhs: Self) -> Self {
        RingFlags(self.0 | rhs.0)
    }
}

#[repr(C)]
struct RingHeader {
    head: AtomicU32,
    tail: AtomicU32,
    blk_cnt: AtomicI64,
    stopped: AtomicU32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct BlockHeader {
    length: u32,
    block_type: u8,
}

/// A shared-memory ring, created once before forking and then shared by
/// every descendant process.
pub struct ShmRing {
    mem: SharedMem,
    lock: ProcLock,
    data_offset: usize,
    data_len: usize,
}

unsafe impl Send for ShmRing {}
unsafe impl Sync for ShmRing {}

impl ShmRing {
    /// Allocates a ring of `capacity` usable data bytes and initializes
    /// its chosen lock backend in place. Must be called before forking.
    pub fn create(capacity: usize, lock_kind: LockKind, lock_dir: &Path) -> Result<Self> {
        let data_offset = std::mem::size_of::<RingHeader>() + LOCK_RESERVATION;
        let total = data_offset + capacity;
        let mem = SharedMem::anonymous(total)?;

        let header = mem.as_ptr() as *mut RingHeader;
        unsafe {
            (*header).head.store(data_offset as u32, Ordering::Relaxed);
            (*header).tail.store(data_offset as u32, Ordering::Relaxed);
            (*header).blk_cnt.store(0, Ordering::Relaxed);
            (*header).stopped.store(0, Ordering::Relaxed);
        }

        let lock = match lock_kind {
            LockKind::Pthread => {
                let mutex_ptr =
                    unsafe { mem.as_ptr().add(std::mem::size_of::<RingHeader>()) }
                        as *mut libc::pthread_mutex_t;
                ProcLock::Pthread(unsafe { PthreadLock::init_at(mutex_ptr) }?)
            }
            LockKind::SysvSem => ProcLock::SysvSem(SysvSemLock::create()?),
            LockKind::Fcntl => ProcLock::Fcntl(FcntlLock::create(lock_dir)?),
        };

        Ok(Self {
            mem,
            lock,
            data_offset,
            data_len: capacity,
        })
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*(self.mem.as_ptr() as *const RingHeader) }
    }

    fn base(&self) -> *mut u8 {
        self.mem.as_ptr()
    }

    /// Signals every blocked `push`/`pop` across every process sharing
    /// this ring to return `Err(VbError::Stopped)` instead of continuing
    /// to poll.
    pub fn stop(&self) {
        self.header().stopped.store(1, Ordering::Release);
    }

    fn is_stopped(&self) -> bool {
        self.header().stopped.load(Ordering::Acquire) != 0
    }

    #[inline]
    fn block_at(&self, offset: u32) -> *mut BlockHeader {
        unsafe { self.base().add(offset as usize) as *mut BlockHeader }
    }

    fn data_end(&self) -> u32 {
        (self.data_offset + self.data_len) as u32
    }

    /// Moves `head` to a position that can hold `need` bytes (a block
    /// header plus payload), inserting a PAD block or wrapping to the
    /// start of the data region as necessary. Returns `Err` (without
    /// polling) if the ring is currently full.
    fn adjust_head(&self, need: u32) -> Result<()> {
        let hdr = self.header();
        let tail = hdr.tail.load(Ordering::Acquire);
        let head = hdr.head.load(Ordering::Acquire);
        let surplus = self.data_end() - head;

        if surplus < need {
            if tail == self.data_offset as u32 || tail > head {
                return Err(VbError::ResourceExhausted("ring full"));
            } else if surplus < BLOCK_HEADER_LEN as u32 {
                hdr.head.store(self.data_offset as u32, Ordering::Release);
            } else {
                let pad = self.block_at(head);
                unsafe {
                    (*pad).block_type = BLOCK_TYPE_PAD;
                    (*pad).length = surplus;
                }
                hdr.head.store(self.data_offset as u32, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Wraps `tail` to the start of the data region once it has consumed
    /// past the live region or landed on a PAD block.
    fn adjust_tail(&self) {
        let hdr = self.header();
        let head = hdr.head.load(Ordering::Acquire);
        let tail = hdr.tail.load(Ordering::Acquire);
        if head >= tail {
            return;
        }
        let remaining = self.data_end() - tail;
        let at_pad = if remaining >= BLOCK_HEADER_LEN as u32 {
            unsafe { (*self.block_at(tail)).block_type == BLOCK_TYPE_PAD }
        } else {
            false
        };
        if remaining < BLOCK_HEADER_LEN as u32 || at_pad {
            hdr.tail.store(self.data_offset as u32, Ordering::Release);
        }
    }

    /// One attempt to make room for `need` bytes at the head. Returns
    /// `ResourceExhausted` if the ring doesn't currently have space;
    /// the caller decides whether to retry.
    fn try_make_head_room(&self, need: u32) -> Result<()> {
        self.adjust_head(need)?;
        let hdr = self.header();
        let tail = hdr.tail.load(Ordering::Acquire);
        let head = hdr.head.load(Ordering::Acquire);
        if tail > head && tail < head + need + 1 {
            return Err(VbError::ResourceExhausted("ring full"));
        }
        Ok(())
    }

    /// One attempt to find a block at the tail. `ResourceExhausted` means
    /// the ring is currently empty.
    fn try_find_tail_block(&self) -> Result<u32> {
        self.adjust_tail();
        let hdr = self.header();
        let tail = hdr.tail.load(Ordering::Acquire);
        if tail == hdr.head.load(Ordering::Acquire) {
            return Err(VbError::ResourceExhausted("ring empty"));
        }
        Ok(tail)
    }

    /// Performs `attempt` under the ring's lock (when `flags` asks for
    /// one), releasing it before any blocking sleep and reacquiring it
    /// on retry — the lock is never held across a sleep.
    fn with_retry<T>(
        &self,
        flags: RingFlags,
        mut attempt: impl FnMut(&Self) -> Result<T>,
    ) -> Result<T> {
        loop {
            if self.is_stopped() {
                return Err(VbError::Stopped);
            }
            let locked = flags.contains(RingFlags::LOCK);
            if locked {
                self.lock.lock()?;
            }
            let outcome = attempt(self);
            if locked {
                self.lock.unlock()?;
            }
            match outcome {
                Ok(v) => return Ok(v),
                Err(VbError::ResourceExhausted(_)) if flags.contains(RingFlags::WAIT) => {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pushes `data` onto the ring. With `RingFlags::WAIT` set, blocks
    /// (via short polling sleeps, matching the upstream daemon's
    /// 200-microsecond cycle) until there's room or the ring is stopped;
    /// the lock (if `RingFlags::LOCK` is set) is released before every
    /// sleep and reacquired before the next attempt.
    pub fn push(&self, data: &[u8], flags: RingFlags) -> Result<()> {
        let need = (BLOCK_HEADER_LEN + data.len()) as u32;
        if need as usize > self.data_len {
            return Err(VbError::Framing("message larger than ring capacity"));
        }
        self.with_retry(flags, |this| {
            this.try_make_head_room(need)?;
            let hdr = this.header();
            let head = hdr.head.load(Ordering::Acquire);
            let block = this.block_at(head);
            unsafe {
                (*block).block_type = BLOCK_TYPE_DAT;
                (*block).length = need;
                let payload = (block as *mut u8).add(BLOCK_HEADER_LEN);
                std::ptr::copy_nonoverlapping(data.as_ptr(), payload, data.len());
            }
            hdr.head.store(head + need, Ordering::Release);
            hdr.blk_cnt.fetch_add(1, Ordering::AcqRel);
            Ok(())
        })
    }

    /// Pops the oldest message off the ring. With `RingFlags::WAIT` set,
    /// blocks until a message is available or the ring is stopped; the
    /// lock (if `RingFlags::LOCK` is set) is released before every sleep
    /// and reacquired before the next attempt.
    pub fn pop(&self, flags: RingFlags) -> Result<Vec<u8>> {
        self.with_retry(flags, |this| {
            let tail = this.try_find_tail_block()?;
            let hdr = this.header();
            let block = this.block_at(tail);
            let (length, payload_len) =
                unsafe { ((*block).length, (*block).length as usize - BLOCK_HEADER_LEN) };
            let mut out = vec![0u8; payload_len];
            unsafe {
                let payload = (block as *const u8).add(BLOCK_HEADER_LEN);
                std::ptr::copy_nonoverlapping(payload, out.as_mut_ptr(), payload_len);
            }
            hdr.tail.store(tail + length, Ordering::Release);
            hdr.blk_cnt.fetch_sub(1, Ordering::AcqRel);
            Ok(out)
        })
    }

    /// Number of messages currently queued. Advisory only under
    /// concurrent access without the lock held.
    pub fn len(&self) -> i64 {
        self.header().blk_cnt.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ring(capacity: usize) -> ShmRing {
        ShmRing::create(capacity, LockKind::Fcntl, Path::new("/tmp")).unwrap()
    }

    #[test]
    fn push_then_pop_round_trips_payload() {
        let ring = test_ring(4096);
        ring.push(b"hello", RingFlags::empty()).unwrap();
        let out = ring.pop(RingFlags::empty()).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn fifo_ordering_is_preserved() {
        let ring = test_ring(4096);
        ring.push(b"one", RingFlags::empty()).unwrap();
        ring.push(b"two", RingFlags::empty()).unwrap();
        ring.push(b"three", RingFlags::empty()).unwrap();
        assert_eq!(ring.pop(RingFlags::empty()).unwrap(), b"one");
        assert_eq!(ring.pop(RingFlags::empty()).unwrap(), b"two");
        assert_eq!(ring.pop(RingFlags::empty()).unwrap(), b"three");
    }

    #[test]
    fn pop_on_empty_ring_without_wait_errors() {
        let ring = test_ring(4096);
        assert!(ring.pop(RingFlags::empty()).is_err());
    }

    #[test]
    fn push_past_capacity_without_wait_errors() {
        let ring = test_ring(64);
        let big = vec![0u8; 128];
        assert!(ring.push(&big, RingFlags::empty()).is_err());
    }

    #[test]
    fn wraps_around_the_buffer_under_sustained_traffic() {
        let ring = test_ring(256);
        for i in 0..200u32 {
            let msg = i.to_le_bytes();
            ring.push(&msg, RingFlags::empty()).unwrap();
            let out = ring.pop(RingFlags::empty()).unwrap();
            assert_eq!(out, msg);
        }
    }

    #[test]
    fn stop_unblocks_a_waiting_pop() {
        let ring = std::sync::Arc::new(test_ring(4096));
        let r2 = ring.clone();
        let handle = thread::spawn(move || r2.pop(RingFlags::WAIT));
        thread::sleep(Duration::from_millis(20));
        ring.stop();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(VbError::Stopped)));
    }

    #[test]
    fn blk_cnt_tracks_queue_depth() {
        let ring = test_ring(4096);
        assert_eq!(ring.len(), 0);
        ring.push(b"a", RingFlags::empty()).unwrap();
        ring.push(b"b", RingFlags::empty()).unwrap();
        assert_eq!(ring.len(), 2);
        ring.pop(RingFlags::empty()).unwrap();
        assert_eq!(ring.len(), 1);
    }
}
