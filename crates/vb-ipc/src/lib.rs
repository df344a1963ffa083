//! # vb-ipc — cross-process transport
//!
//! The shared-memory ring queues, the cross-process lock backends, the
//! wake notifier, and the anonymous-mmap allocator underneath them. Every
//! one of these has to be created before the daemon forks into its
//! master/connection/worker processes — they're the scaffolding that
//! makes the descendants act like a single application instead of three
//! unrelated ones.

pub mod lock;
pub mod notifier;
pub mod ring;
pub mod shared_mem;

pub use lock::{LockKind, ProcLock};
pub use notifier::{NotifierReader, NotifierWriter};
pub use ring::{RingFlags, ShmRing};
pub use shared_mem::SharedMem;
