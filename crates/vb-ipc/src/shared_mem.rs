//! Anonymous `MAP_SHARED` allocation.
//!
//! Backs every structure that has to be visible identically to the
//! master, the connection process and every worker after `fork`: the two
//! rings and the pthread-mutex lock backend. `MAP_ANONYMOUS` rather than
//! a backing file — none of this needs to survive the daemon's lifetime.

use std::ptr::NonNull;

/// An owned anonymous shared-memory mapping.
///
/// `fork`-safe by construction: the mapping must be created before the
/// first fork so every descendant process inherits the same physical
/// pages. Cloning this handle (via `Arc`, not `Clone` — there's exactly
/// one mapping and many process-local handles to it after fork) is not
/// supported; instead callers create it once in the master and each
/// child reopens it from the raw pointer captured before forking.
pub struct SharedMem {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the mapping is `MAP_SHARED`, meant to be written concurrently
// by multiple processes under an external lock. Rust's aliasing rules
// don't apply across the process boundary; within a process we only ever
// hand out raw pointers, never & or &mut references into the region.
unsafe impl Send for SharedMem {}
unsafe impl Sync for SharedMem {}

impl SharedMem {
    /// Map `len` bytes of zeroed, shared, anonymous memory.
    pub fn anonymous(len: usize) -> std::io::Result<Self> {
        assert!(len > 0, "shared mapping length must be non-zero");
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self {
            ptr: NonNull::new(ptr as *mut u8).expect("mmap returned null on success"),
            len,
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SharedMem {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_mapping_is_zeroed() {
        let mem = SharedMem::anonymous(4096).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(mem.as_ptr(), mem.len()) };
        assert!(slice.iter().all(|&b| b == 0));
    }

    #[test]
    fn writes_are_visible_through_a_second_pointer() {
        let mem = SharedMem::anonymous(64).unwrap();
        let ptr = mem.as_ptr();
        unsafe {
            *ptr = 0xAB;
        }
        let alias = mem.as_ptr();
        unsafe {
            assert_eq!(*alias, 0xAB);
        }
    }
}
