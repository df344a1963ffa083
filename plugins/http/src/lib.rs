//! Reference plugin: a minimal single-file-at-a-time `GET` server.
//!
//! Grounded on `original_source/plugins/http/http.c`: `handle_input`
//! looks for the end of the request headers (and, if present, a
//! `Content-Length` body past them); `handle_process` supports only
//! `GET`, serves `docroot/index` for a trailing-slash path, and always
//! asks the core to close the connection after the response is flushed
//! (`VERBEN_CONN_CLOSE` in the original, `HandleResult::CONN_CLOSE`
//! here) since this plugin speaks HTTP/1.0-style one-request-per-connection.
//!
//! Like `plugins/echo`, this crate depends on `vb-core` for the shared
//! wire vocabulary but not on `vb-plugin` (the host-side loader has no
//! business being linked into a `cdylib`). It additionally depends on
//! `vb-config` to read `docroot`/`index` back out of the opaque `cfg`
//! pointer `handle_init` receives — the same `conf_t*`-through-`void*`
//! convention the original uses, just with a typed cast on this side of
//! the boundary instead of `conf_get_str_value`.

use libc::{c_char, c_int, c_void};
use log::{debug, error};
use std::path::PathBuf;
use std::sync::OnceLock;
use vb_core::plugin::HandleResult;
use vb_core::ring_wire::{unpack_remote_ip, REMOTE_IP_LEN};

const RESPONSE_BUF_SIZE: usize = 64 * 1024;

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

struct HttpConfig {
    doc_root: PathBuf,
    index_file: String,
}

static CONFIG: OnceLock<HttpConfig> = OnceLock::new();

fn config() -> &'static HttpConfig {
    CONFIG.get_or_init(|| HttpConfig {
        doc_root: PathBuf::from("/home/flygoast"),
        index_file: "index.html".to_string(),
    })
}

#[no_mangle]
pub extern "C" fn handle_init(cfg: *mut c_void, proc_type: c_int) -> c_int {
    // Only the worker role actually serves files; master and conn never
    // call handle_process, matching the original's switch that no-ops
    // on VB_PROCESS_MASTER/VB_PROCESS_CONN.
    if proc_type == 1 {
        let tree = if cfg.is_null() {
            None
        } else {
            Some(unsafe { &*(cfg as *const vb_config::ConfTree) })
        };
        let doc_root = tree
            .and_then(|t| t.get_str_value("docroot"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/home/flygoast"));
        let index_file = tree
            .and_then(|t| t.get_str_value("index"))
            .unwrap_or("index.html")
            .to_string();
        let _ = CONFIG.set(HttpConfig { doc_root, index_file });
    }
    0
}

#[no_mangle]
pub extern "C" fn handle_fini(_cfg: *mut c_void, _proc_type: c_int) {}

#[no_mangle]
pub extern "C" fn handle_close(sk: *const CSockInfo) {
    let sk = unsafe { &*sk };
    debug!("connection from {} closed", sk.describe());
}

/// Returns the number of bytes in the request once `\r\n\r\n` has been
/// seen: the header length alone, or header-plus-body if a
/// `Content-Length` header is present. `0` while headers are still
/// arriving; a malformed `Content-Length` aborts the connection.
#[no_mangle]
pub extern "C" fn handle_input(buf: *const c_char, len: c_int, _sk: *const CSockInfo) -> c_int {
    let bytes = unsafe { std::slice::from_raw_parts(buf as *const u8, len.max(0) as usize) };

    let Some(header_end) = find_subslice(bytes, b"\r\n\r\n") else {
        return 0;
    };
    let header_end = header_end + 4;

    match find_subslice(bytes, b"Content-Length:") {
        Some(pos) => {
            let rest = &bytes[pos + "Content-Length:".len()..];
            let digits: String = rest
                .iter()
                .skip_while(|b| b.is_ascii_whitespace())
                .take_while(|b| b.is_ascii_digit())
                .map(|&b| b as char)
                .collect();
            match digits.parse::<usize>() {
                Ok(0) | Err(_) => {
                    error!("invalid http protocol: bad Content-Length");
                    -1
                }
                Ok(content_len) => (header_end + content_len) as c_int,
            }
        }
        None => header_end as c_int,
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Serves the requested path's file. Only `GET` is supported; anything
/// else, a malformed request line, or a file that can't be opened or
/// read is `HandleResult::ERROR`. A successful response always carries
/// `CONN_CLOSE`, matching the original's one-request-per-connection
/// HTTP/1.0-ish behavior.
#[no_mangle]
pub extern "C" fn handle_process(
    rcvbuf: *mut c_char,
    rcvlen: c_int,
    sndbuf: *mut *mut c_char,
    sndlen: *mut c_int,
    _sk: *const CSockInfo,
) -> c_int {
    let request = unsafe { std::slice::from_raw_parts(rcvbuf as *const u8, rcvlen.max(0) as usize) };
    let request = String::from_utf8_lossy(request);

    let Some(rest) = request.strip_prefix("GET ") else {
        return HandleResult::ERROR.raw() as c_int;
    };
    let Some(path_end) = rest.find("HTTP/") else {
        return HandleResult::ERROR.raw() as c_int;
    };
    let path = rest[..path_end].trim_end();

    let cfg = config();
    let relative = path.trim_start_matches('/');
    let file = if path.ends_with('/') {
        cfg.doc_root.join(relative).join(&cfg.index_file)
    } else {
        cfg.doc_root.join(relative)
    };

    let body = match std::fs::read(&file) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("open file [{}] failed: {e}", file.display());
            return HandleResult::ERROR.raw() as c_int;
        }
    };

    let header = format!(
        "HTTP/1.1 200 OK\r\nServer: verben {}\r\nContent-Length: {}\r\n\r\n",
        env!("CARGO_PKG_VERSION"),
        body.len()
    );

    let mut response = Vec::with_capacity((header.len() + body.len()).min(RESPONSE_BUF_SIZE));
    response.extend_from_slice(header.as_bytes());
    response.extend_from_slice(&body);

    let out = unsafe { libc::malloc(response.len()) } as *mut c_char;
    if out.is_null() {
        return HandleResult::ERROR.raw() as c_int;
    }
    unsafe {
        std::ptr::copy_nonoverlapping(response.as_ptr(), out as *mut u8, response.len());
        *sndbuf = out;
        *sndlen = response.len() as c_int;
    }

    (HandleResult::OK | HandleResult::CONN_CLOSE).raw() as c_int
}

#[no_mangle]
pub extern "C" fn handle_process_post(sendbuf: *mut c_char, _sendlen: c_int) {
    if !sendbuf.is_null() {
        unsafe { libc::free(sendbuf as *mut c_void) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_input_waits_for_full_headers() {
        let req = b"GET /index.html HTTP/1.1\r\n";
        let n = handle_input(req.as_ptr() as *const c_char, req.len() as c_int, std::ptr::null());
        assert_eq!(n, 0);
    }

    #[test]
    fn handle_input_returns_header_length_without_body() {
        let req = b"GET /index.html HTTP/1.1\r\n\r\n";
        let n = handle_input(req.as_ptr() as *const c_char, req.len() as c_int, std::ptr::null());
        assert_eq!(n as usize, req.len());
    }

    #[test]
    fn handle_input_includes_content_length_body() {
        let req = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let n = handle_input(req.as_ptr() as *const c_char, req.len() as c_int, std::ptr::null());
        assert_eq!(n as usize, req.len());
    }

    #[test]
    fn handle_input_rejects_zero_content_length() {
        let req = b"POST /x HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
        let n = handle_input(req.as_ptr() as *const c_char, req.len() as c_int, std::ptr::null());
        assert_eq!(n, -1);
    }

    #[test]
    fn find_subslice_locates_needle() {
        assert_eq!(find_subslice(b"abcXYZdef", b"XYZ"), Some(3));
        assert_eq!(find_subslice(b"abcdef", b"XYZ"), None);
    }
}
