//! Minimal raw-socket primitives for the connection process.
//!
//! `original_source/src/anet.c`'s `anet_tcp_server`/`anet_tcp_accept`/
//! `anet_nonblock`/`anet_tcp_nodelay` wrapped directly over `libc`, the
//! same "thin safe wrapper over a kernel facility" style `vb-ipc` uses
//! for `mmap`/`semget`/`fcntl`. No `std::net::TcpListener` here: the
//! accept path needs `accept4`'s combined nonblocking+close-on-exec flags
//! and an explicit backlog of 511, neither of which `std` exposes.

use std::mem;
use std::net::IpAddr;
use std::os::unix::io::RawFd;

use crate::error::{DaemonError, Result};

const BACKLOG: libc::c_int = 511;

fn last_err(context: &str) -> DaemonError {
    let e = std::io::Error::last_os_error();
    DaemonError::Io(std::io::Error::new(e.kind(), format!("{context}: {e}")))
}

/// Opens, binds, and listens a non-blocking IPv4 TCP socket.
pub fn tcp_listen(addr: IpAddr, port: u16) -> Result<RawFd> {
    let IpAddr::V4(addr) = addr else {
        return Err(DaemonError::Config("only IPv4 bind addresses are supported".into()));
    };

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(last_err("socket"));
    }

    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = last_err("setsockopt(SO_REUSEADDR)");
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = port.to_be();
    // `s_addr` holds the octets in memory order, like `inet_aton` fills it;
    // `from_ne_bytes` preserves that, matching `to_ne_bytes()` in `accept`
    // below. `from_be_bytes` would byte-reverse on little-endian hosts.
    sa.sin_addr.s_addr = u32::from_ne_bytes(addr.octets());

    let rc = unsafe {
        libc::bind(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = last_err(&format!("bind({addr}:{port})"));
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let rc = unsafe { libc::listen(fd, BACKLOG) };
    if rc < 0 {
        let err = last_err("listen");
        unsafe { libc::close(fd) };
        return Err(err);
    }

    set_nonblocking(fd)?;
    set_cloexec(fd)?;
    Ok(fd)
}

/// Accepts one pending connection, non-blocking. `Ok(None)` means
/// `EAGAIN` (no pending connection); any other error is returned.
pub fn accept(listen_fd: RawFd) -> Result<Option<(RawFd, IpAddr, u16)>> {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if fd < 0 {
        let errno = std::io::Error::last_os_error();
        return match errno.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => Ok(None),
            Some(libc::EINTR) => Ok(None),
            _ => Err(DaemonError::Io(errno)),
        };
    }

    set_tcp_nodelay(fd)?;

    let octets = sa.sin_addr.s_addr.to_ne_bytes();
    let ip = IpAddr::from(octets);
    let port = u16::from_be(sa.sin_port);
    Ok(Some((fd, ip, port)))
}

pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(last_err("fcntl(F_GETFL)"));
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(last_err("fcntl(F_SETFL, O_NONBLOCK)"));
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD, 0) };
    if flags < 0 {
        return Err(last_err("fcntl(F_GETFD)"));
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(last_err("fcntl(F_SETFD, FD_CLOEXEC)"));
    }
    Ok(())
}

fn set_tcp_nodelay(fd: RawFd) -> Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &on as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(last_err("setsockopt(TCP_NODELAY)"));
    }
    Ok(())
}

/// Reads up to `buf.len()` bytes. `Ok(0)` from a readable fd means the
/// peer closed; `EAGAIN` surfaces as `Ok(None)`.
pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> Result<Option<usize>> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(Some(n as usize));
        }
        let errno = std::io::Error::last_os_error();
        match errno.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => return Ok(None),
            Some(libc::EINTR) => continue,
            _ => return Err(DaemonError::Io(errno)),
        }
    }
}

/// Writes as much of `buf` as the kernel will currently accept. `Ok(0)`
/// paired with `EAGAIN` means "try again once writable"; that is not
/// distinguished from a genuine zero-byte write by the return value
/// alone, matching the upstream `write()`-loop's handling.
pub fn write_nonblocking(fd: RawFd, buf: &[u8]) -> Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let errno = std::io::Error::last_os_error();
        match errno.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => return Ok(0),
            Some(libc::EINTR) => continue,
            _ => return Err(DaemonError::Io(errno)),
        }
    }
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn listen_then_connect_then_accept_round_trips() {
        let fd = tcp_listen(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();

        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe { libc::getsockname(fd, &mut sa as *mut _ as *mut libc::sockaddr, &mut len) };
        assert_eq!(rc, 0);
        let port = u16::from_be(sa.sin_port);

        let client = std::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();

        let mut accepted = None;
        for _ in 0..1000 {
            if let Some(hit) = accept(fd).unwrap() {
                accepted = Some(hit);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let (cfd, ip, _port) = accepted.expect("connection should have been accepted");
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        drop(client);
        close(cfd);
        close(fd);
    }
}
