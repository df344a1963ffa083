//! # vb-plugin — the dynamic loader half of the plugin ABI
//!
//! Resolves a loaded shared object's `handle_*` symbol table. `handle_input`
//! and `handle_process` are mandatory — their absence is a load failure,
//! not an optional gap — everything else is looked up best-effort and
//! recorded in the plugin's [`vb_core::PluginDescriptor`].
//!
//! The C ABI types here (`CSockInfo`, the raw `extern "C" fn` aliases) are
//! the contract a plugin crate — `plugins/echo`, `plugins/http`, or a
//! third party's own cdylib — implements against; `vb_core::SockInfo`
//! converts to and from `CSockInfo` at the boundary so the rest of the
//! daemon never touches the raw layout.

use libc::{c_char, c_int, c_void};
use libloading::{Library, Symbol};
use log::info;
use std::net::IpAddr;
use std::path::Path;
use vb_core::plugin::{HandleResult, OptionalCallbacks, PluginDescriptor};
use vb_core::ring_wire::{pack_remote_ip, unpack_remote_ip, REMOTE_IP_LEN};
use vb_core::{Result, Role, SockInfo, VbError};

/// C-ABI mirror of [`vb_core::SockInfo`], passed by pointer across the
/// plugin boundary.
#[repr(C)]
pub struct CSockInfo {
    pub remote_ip: [u8; REMOTE_IP_LEN],
    pub remote_port: u16,
}

impl From<SockInfo> for CSockInfo {
    fn from(sk: SockInfo) -> Self {
        CSockInfo {
            remote_ip: pack_remote_ip(&sk.remote_ip.to_string()),
            remote_port: sk.remote_port,
        }
    }
}

impl CSockInfo {
    /// Best-effort parse back to a typed `SockInfo`; an address a plugin
    /// corrupted or a caller constructed badly falls back to unspecified
    /// rather than panicking across the ABI boundary.
    pub fn to_sock_info(&self) -> SockInfo {
        let ip: IpAddr = unpack_remote_ip(&self.remote_ip)
            .parse()
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        SockInfo::new(ip, self.remote_port)
    }
}

pub type HandleInitFn = unsafe extern "C" fn(*mut c_void, c_int) -> c_int;
pub type HandleFiniFn = unsafe extern "C" fn(*mut c_void, c_int);
pub type HandleOpenFn = unsafe extern "C" fn(*mut *mut c_char, *mut c_int, *const CSockInfo) -> c_int;
pub type HandleCloseFn = unsafe extern "C" fn(*const CSockInfo);
pub type HandleInputFn = unsafe extern "C" fn(*const c_char, c_int, *const CSockInfo) -> c_int;
pub type HandleProcessFn =
    unsafe extern "C" fn(*mut c_char, c_int, *mut *mut c_char, *mut c_int, *const CSockInfo) -> c_int;
pub type HandleProcessPostFn = unsafe extern "C" fn(*mut c_char, c_int);

/// A loaded plugin. The underlying `Library` is kept alive for as long as
/// this value exists — dropping it unloads the module, which must not
/// happen while any process still has a call to a `handle_*` function in
/// flight.
pub struct Plugin {
    _library: Library,
    pub init: Option<HandleInitFn>,
    pub fini: Option<HandleFiniFn>,
    pub open: Option<HandleOpenFn>,
    pub close: Option<HandleCloseFn>,
    pub input: HandleInputFn,
    pub process: HandleProcessFn,
    pub process_post: Option<HandleProcessPostFn>,
}

fn optional_symbol<T: Copy>(library: &Library, name: &[u8]) -> Option<T> {
    unsafe { library.get::<T>(name).ok().map(|sym: Symbol<T>| *sym) }
}

impl Plugin {
    /// Loads the shared object at `path` and resolves its symbol table.
    ///
    /// # Safety
    /// The loaded module's `handle_*` functions are foreign code invoked
    /// with whatever the daemon passes them; the caller is trusting the
    /// plugin to honor the ABI contract (ownership rules on `sendbuf`,
    /// not retaining pointers past the call that handed them over).
    pub unsafe fn load(path: &Path) -> Result<Self> {
        let library = Library::new(path)
            .map_err(|e| VbError::Plugin(format!("failed to load {}: {e}", path.display())))?;

        let input: HandleInputFn = optional_symbol(&library, b"handle_input\0")
            .ok_or_else(|| VbError::Plugin("missing mandatory symbol handle_input".to_string()))?;
        let process: HandleProcessFn = optional_symbol(&library, b"handle_process\0")
            .ok_or_else(|| VbError::Plugin("missing mandatory symbol handle_process".to_string()))?;

        let init = optional_symbol(&library, b"handle_init\0");
        let fini = optional_symbol(&library, b"handle_fini\0");
        let open = optional_symbol(&library, b"handle_open\0");
        let close = optional_symbol(&library, b"handle_close\0");
        let process_post = optional_symbol(&library, b"handle_process_post\0");

        info!(
            "plugin: loaded {} (init={} fini={} open={} close={} process_post={})",
            path.display(),
            init.is_some(),
            fini.is_some(),
            open.is_some(),
            close.is_some(),
            process_post.is_some()
        );

        Ok(Self {
            _library: library,
            init,
            fini,
            open,
            close,
            input,
            process,
            process_post,
        })
    }

    pub fn descriptor(&self, role: Role) -> PluginDescriptor {
        PluginDescriptor::new(
            role,
            OptionalCallbacks {
                init: self.init.is_some(),
                fini: self.fini.is_some(),
                open: self.open.is_some(),
                close: self.close.is_some(),
                process_post: self.process_post.is_some(),
            },
        )
    }

    /// Calls `handle_init` if the plugin implements it. A non-zero return
    /// is a startup failure per the ABI contract.
    pub fn call_init(&self, cfg: *mut c_void, role: Role) -> Result<()> {
        match self.init {
            Some(f) => {
                let rc = unsafe { f(cfg, role.as_u8() as c_int) };
                if rc != 0 {
                    Err(VbError::Plugin(format!("handle_init returned {rc}")))
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }

    pub fn call_fini(&self, cfg: *mut c_void, role: Role) {
        if let Some(f) = self.fini {
            unsafe { f(cfg, role.as_u8() as c_int) };
        }
    }

    /// Calls `handle_input`, the frame-length probe: positive is the
    /// expected total frame length, zero means "need more bytes",
    /// negative means abort the connection.
    pub fn call_input(&self, buf: &[u8], sk: &CSockInfo) -> i32 {
        unsafe { (self.input)(buf.as_ptr() as *const c_char, buf.len() as c_int, sk) }
    }

    /// Calls `handle_open` if the plugin implements it. A non-zero return
    /// closes the connection immediately; a zero return may still set
    /// `sendbuf`/`len`, in which case the caller takes ownership of the
    /// plugin-allocated buffer and must run `call_process_post` (or the
    /// plugin's own convention) once it has copied the bytes out.
    ///
    /// The ABI contract for `handle_open` hands the core a heap buffer
    /// it owns and must free once it has copied the bytes out; this
    /// returns the owned copy alongside the raw pointer so the caller can
    /// do that (see [`free_plugin_buffer`]) without a dedicated
    /// `handle_open_post` symbol.
    pub fn call_open(&self, sk: &CSockInfo) -> Option<OpenOutput> {
        let f = self.open?;
        let mut buf: *mut c_char = std::ptr::null_mut();
        let mut len: c_int = 0;
        let rc = unsafe { f(&mut buf, &mut len, sk) };
        let payload = if rc == 0 {
            unsafe { copy_plugin_buffer(buf, len) }
        } else {
            None
        };
        Some(OpenOutput {
            rc,
            payload,
            raw_ptr: buf,
        })
    }

    pub fn call_close(&self, sk: &CSockInfo) {
        if let Some(f) = self.close {
            unsafe { f(sk) };
        }
    }

    /// Calls `handle_process`. The raw `out`/`out_len` the plugin handed
    /// back are kept in the result alongside the owned copy so the
    /// caller can hand them to [`Plugin::call_process_post`] afterward —
    /// the plugin, not the core, owns that allocation.
    pub fn call_process(&self, input: &mut [u8], sk: &CSockInfo) -> ProcessOutput {
        let mut out: *mut c_char = std::ptr::null_mut();
        let mut out_len: c_int = 0;
        let rc = unsafe {
            (self.process)(
                input.as_mut_ptr() as *mut c_char,
                input.len() as c_int,
                &mut out,
                &mut out_len,
                sk,
            )
        };
        let payload = if HandleResult::from_raw(rc as u32).is_error() {
            None
        } else {
            unsafe { copy_plugin_buffer(out, out_len) }
        };
        ProcessOutput {
            rc,
            payload,
            raw_ptr: out,
            raw_len: out_len,
        }
    }

    /// Calls `handle_process_post` if the plugin implements it, so it can
    /// free the buffer it allocated for `handle_process`'s output. The
    /// core only ever calls this after it has finished copying that
    /// output into the send-ring message.
    pub fn call_process_post(&self, out: *mut c_char, out_len: c_int) {
        if let Some(f) = self.process_post {
            unsafe { f(out, out_len) };
        }
    }
}

/// Result of one `handle_process` call: the raw bit-flagged return value,
/// an owned copy of whatever output buffer the plugin produced, and the
/// raw pointer/length pair needed to hand the buffer back via
/// `handle_process_post`.
pub struct ProcessOutput {
    pub rc: i32,
    pub payload: Option<Vec<u8>>,
    pub raw_ptr: *mut c_char,
    pub raw_len: c_int,
}

/// Result of one `handle_open` call: the raw return code, an owned copy
/// of whatever buffer the plugin produced, and the raw pointer the core
/// must `free` (there is no `handle_open_post` symbol in the ABI).
pub struct OpenOutput {
    pub rc: i32,
    pub payload: Option<Vec<u8>>,
    pub raw_ptr: *mut c_char,
}

/// Frees a heap buffer a plugin handed the core ownership of
/// (`handle_open`'s buffer; `handle_process`'s is instead freed via
/// `handle_process_post` when the plugin implements it). A no-op on
/// null.
///
/// # Safety
/// `ptr` must either be null or have been allocated by the plugin's `libc`
/// allocator (the same allocator this process links against), and not
/// freed or referenced again afterward.
pub unsafe fn free_plugin_buffer(ptr: *mut c_char) {
    if !ptr.is_null() {
        libc::free(ptr as *mut c_void);
    }
}

/// Converts a NUL-terminated `c_char` buffer a plugin handed back (e.g.
/// from `handle_open`) into an owned byte vector, without assuming the
/// plugin null-terminated it at all — `len` is authoritative.
///
/// # Safety
/// `ptr` must be valid for reads of `len` bytes, or null.
pub unsafe fn copy_plugin_buffer(ptr: *const c_char, len: c_int) -> Option<Vec<u8>> {
    if ptr.is_null() || len < 0 {
        return None;
    }
    let slice = std::slice::from_raw_parts(ptr as *const u8, len as usize);
    Some(slice.to_vec())
}

/// Builds a NUL-terminated C string suitable for `sock_info`-adjacent
/// debug logging; not part of the ABI itself.
pub fn describe(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sock_info_round_trips_through_c_repr() {
        let sk = SockInfo::new("10.1.2.3".parse().unwrap(), 4321);
        let c: CSockInfo = sk.into();
        let back = c.to_sock_info();
        assert_eq!(back.remote_ip, sk.remote_ip);
        assert_eq!(back.remote_port, sk.remote_port);
    }

    #[test]
    fn copy_plugin_buffer_rejects_null() {
        assert!(unsafe { copy_plugin_buffer(std::ptr::null(), 10) }.is_none());
    }

    #[test]
    fn copy_plugin_buffer_copies_exact_length() {
        let data = b"hello world";
        let copied =
            unsafe { copy_plugin_buffer(data.as_ptr() as *const c_char, data.len() as c_int) }
                .unwrap();
        assert_eq!(copied, data);
    }
}
