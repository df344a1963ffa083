//! Process-title support, for `ps` visibility (`verben:[master]`, …).
//!
//! `original_source/src/daemon.c`'s `daemon_set_title` overwrites the
//! `argv`/`environ` memory block in place, a trick that only works
//! because C keeps `argv[]` and `environ[]` contiguous on Linux. Rust's
//! `std::env::args` gives no such handle back, so this wraps the same
//! two primitives the C code actually relies on for visibility:
//! `prctl(PR_SET_NAME, ...)`, which every modern `ps`/`top`/`/proc/<pid>/comm`
//! reads, and (best-effort) overwriting the raw `argv[0]` bytes obtained
//! from `/proc/self/cmdline`'s backing memory via `std::env::args_os`'s
//! underlying OS string when the platform exposes it. In practice
//! `prctl` alone is what `ps -o comm` and `htop` show, so that's the
//! primitive this module guarantees; the longer-form rename some
//! `ps aux` formats show is skipped as not reliably safe for every
//! platform from a running Rust process (no `argv` pointer is available
//! pre-`main` the way the C daemon's `main(argc, argv[])` captures it).

const PR_SET_NAME_MAX: usize = 15;

/// Sets this process's short name (as shown by `ps -o comm=`,
/// `/proc/self/comm`, `htop`) to `title`, truncated to the kernel's
/// 15-byte limit for `PR_SET_NAME`.
pub fn set_title(title: &str) {
    let mut buf = [0u8; PR_SET_NAME_MAX + 1];
    let bytes = title.as_bytes();
    let n = bytes.len().min(PR_SET_NAME_MAX);
    buf[..n].copy_from_slice(&bytes[..n]);
    unsafe {
        libc::prctl(libc::PR_SET_NAME, buf.as_ptr() as libc::c_ulong, 0, 0, 0);
    }
}

/// Builds the `verben:[role]` title shown for each child role.
pub fn role_title(role_tag: &str) -> String {
    format!("verben:[{role_tag}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_title_matches_spec_format() {
        assert_eq!(role_title("master"), "verben:[master]");
        assert_eq!(role_title("conn"), "verben:[conn]");
        assert_eq!(role_title("worker"), "verben:[worker]");
    }

    #[test]
    fn set_title_does_not_panic_on_long_input() {
        set_title("a title that is much longer than fifteen bytes");
    }
}
