//! Reference plugin: the `echo` protocol has no framing at all — every
//! byte read off the socket is one frame, and `handle_process` hands it
//! straight back.
//!
//! Grounded on `original_source/plugins/echo/echo.c`. The C-ABI symbol
//! table here is the contract `vb-plugin`'s loader resolves; this crate
//! intentionally does not depend on `vb-plugin` itself (a cdylib plugin
//! has no business linking the host's `libloading`-based loader), only
//! on `vb-core` for the wire vocabulary (`CSockInfo`'s layout, the
//! `HandleResult` flags) shared across the ABI boundary.

use libc::{c_char, c_int, c_void};
use log::debug;
use vb_core::plugin::HandleResult;
use vb_core::ring_wire::{unpack_remote_ip, REMOTE_IP_LEN};

/// Byte-for-byte the same layout as `vb_plugin::CSockInfo`.
#[repr(C)]
pub struct CSockInfo {
    pub remote_ip: [u8; REMOTE_IP_LEN],
    pub remote_port: u16,
}

impl CSockInfo {
    fn describe(&self) -> String {
        format!("{}:{}", unpack_remote_ip(&self.remote_ip), self.remote_port)
    }
}

#[no_mangle]
pub extern "C" fn handle_init(_cfg: *mut c_void, _proc_type: c_int) -> c_int {
    0
}

#[no_mangle]
pub extern "C" fn handle_fini(_cycle: *mut c_void, _proc_type: c_int) {}

#[no_mangle]
pub extern "C" fn handle_close(sk: *const CSockInfo) {
    let sk = unsafe { &*sk };
    debug!("connection from {} closed", sk.describe());
}

/// No framing: whatever's buffered so far is a complete frame.
#[no_mangle]
pub extern "C" fn handle_input(_buf: *const c_char, len: c_int, _sk: *const CSockInfo) -> c_int {
    len
}

#[no_mangle]
pub extern "C" fn handle_process(
    rcvbuf: *mut c_char,
    rcvlen: c_int,
    sndbuf: *mut *mut c_char,
    sndlen: *mut c_int,
    _sk: *const CSockInfo,
) -> c_int {
    let len = rcvlen.max(0) as usize;
    let out = unsafe { libc::malloc(len) } as *mut c_char;
    if !out.is_null() && len > 0 {
        unsafe {
            std::ptr::copy_nonoverlapping(rcvbuf as *const u8, out as *mut u8, len);
        }
    }
    unsafe {
        *sndbuf = out;
        *sndlen = len as c_int;
    }
    HandleResult::OK.raw() as c_int
}

#[no_mangle]
pub extern "C" fn handle_process_post(sendbuf: *mut c_char, _sendlen: c_int) {
    if !sendbuf.is_null() {
        unsafe { libc::free(sendbuf as *mut c_void) };
    }
}
