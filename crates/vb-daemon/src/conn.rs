//! Connection process: accept, read, frame, dispatch, write.
//!
//! Grounded on `original_source/src/conn.c`'s `conn_process_cycle` and its
//! handlers (`accept_handler`, `read_from_client`, `write_to_client`,
//! `notifier_handler`, `server_cron`), rebuilt over `vb-reactor` instead of
//! the upstream `ae` loop. Connection identity crossing the ring is the
//! `(ConnBootId, ConnId)` pair from `vb_core::origin` rather than the raw
//! `client_conn*` the C version stashes and later dereferences.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use vb_core::conn_id::{ConnId, ConnIdAllocator};
use vb_core::origin::{ConnBootId, OriginToken};
use vb_core::ring_wire::{pack_remote_ip, RingMsgHeader, MAX_PROT_LEN};
use vb_core::{Role, SockInfo};
use vb_ipc::notifier::NotifierReader;
use vb_ipc::ring::{RingFlags, ShmRing};
use vb_plugin::{free_plugin_buffer, CSockInfo, Plugin};
use vb_reactor::{FileMask, Reactor};

use crate::config::DaemonConfig;
use crate::error::Result;
use crate::net;
use crate::signals;

const READ_CHUNK: usize = 4096;
const CRON_INTERVAL: Duration = Duration::from_secs(1);

struct ConnRecord {
    fd: RawFd,
    remote_ip: IpAddr,
    remote_port: u16,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    expected_len: usize,
    close_after_flush: bool,
    refcount: i64,
    last_activity: Instant,
}

impl ConnRecord {
    fn sock_info(&self) -> SockInfo {
        SockInfo::new(self.remote_ip, self.remote_port)
    }

    /// The destruction rule: dead only when the socket is gone
    /// *and* no worker still owes a response.
    fn is_dead(&self) -> bool {
        self.fd == -1 && self.refcount == 0
    }
}

struct ConnState {
    boot_id: ConnBootId,
    id_alloc: ConnIdAllocator,
    conns: HashMap<ConnId, ConnRecord>,
    recv_ring: Arc<ShmRing>,
    send_ring: Arc<ShmRing>,
    plugin: Arc<Plugin>,
    client_limit: usize,
    idle_timeout: Duration,
}

type SharedState = Rc<RefCell<ConnState>>;

/// Runs the connection process until `SIGTERM` stops the reactor. Never
/// returns on the happy shutdown path; the caller exits the process
/// afterward.
pub fn run(
    cfg: &DaemonConfig,
    raw_cfg: &vb_config::ConfTree,
    recv_ring: Arc<ShmRing>,
    send_ring: Arc<ShmRing>,
    notifier: NotifierReader,
    plugin: Arc<Plugin>,
) -> Result<()> {
    crate::proctitle::set_title(&crate::proctitle::role_title(Role::Connection.tag()));
    signals::install_for_role(Role::Connection)?;

    if let Err(e) = plugin.call_init(crate::worker::cfg_ptr(raw_cfg), Role::Connection) {
        error!("conn: handle_init failed: {e}");
        return Err(crate::error::DaemonError::Plugin(e.to_string()));
    }

    let state: SharedState = Rc::new(RefCell::new(ConnState {
        boot_id: ConnBootId::new(std::process::id()),
        id_alloc: ConnIdAllocator::new(),
        conns: HashMap::new(),
        recv_ring,
        send_ring,
        plugin: plugin.clone(),
        client_limit: cfg.client_limit,
        idle_timeout: cfg.client_timeout,
    }));

    let mut reactor = Reactor::new()?;

    let listen_fd = net::tcp_listen(cfg.server, cfg.port)?;
    {
        let state = state.clone();
        reactor.create_readable_event(listen_fd, move |reactor, fd, _mask| {
            accept_loop(reactor, fd, &state);
        })?;
    }

    {
        let state = state.clone();
        reactor.create_readable_event(notifier.fd(), move |reactor, _fd, _mask| {
            if let Err(e) = notifier.drain() {
                warn!("notifier drain failed: {e}");
            }
            drain_send_ring(reactor, &state);
        })?;
    }

    schedule_cron(&mut reactor, state.clone());

    reactor.set_before_sleep(|reactor| {
        if signals::QUIT.load(std::sync::atomic::Ordering::SeqCst) {
            reactor.stop();
        }
    });

    reactor.run()?;

    plugin.call_fini(crate::worker::cfg_ptr(raw_cfg), Role::Connection);
    net::close(listen_fd);
    Ok(())
}

fn schedule_cron(reactor: &mut Reactor, state: SharedState) {
    reactor.create_time_event(
        CRON_INTERVAL,
        move |reactor, _id| {
            sweep_idle_connections(reactor, &state);
            Some(CRON_INTERVAL)
        },
        None::<fn(&mut Reactor)>,
    );
}

fn sweep_idle_connections(reactor: &mut Reactor, state: &SharedState) {
    let idle_timeout = state.borrow().idle_timeout;
    let now = Instant::now();
    let stale: Vec<ConnId> = state
        .borrow()
        .conns
        .iter()
        .filter(|(_, rec)| {
            rec.fd != -1 && rec.refcount == 0 && now.duration_since(rec.last_activity) >= idle_timeout
        })
        .map(|(id, _)| *id)
        .collect();

    for id in stale {
        notify_close_via_plugin(state, id);
        close_client(reactor, state, id);
    }
}

fn accept_loop(reactor: &mut Reactor, listen_fd: RawFd, state: &SharedState) {
    loop {
        let accepted = match net::accept(listen_fd) {
            Ok(Some(hit)) => hit,
            Ok(None) => return,
            Err(e) => {
                error!("accept failed: {e}");
                return;
            }
        };
        let (cfd, remote_ip, remote_port) = accepted;

        let client_limit = state.borrow().client_limit;
        if client_limit != 0 && state.borrow().conns.len() >= client_limit {
            debug!("client_limit reached, rejecting {remote_ip}:{remote_port}");
            net::close(cfd);
            continue;
        }

        let id = {
            let mut st = state.borrow_mut();
            let id = st.id_alloc.next();
            st.conns.insert(
                id,
                ConnRecord {
                    fd: cfd,
                    remote_ip,
                    remote_port,
                    recv_buf: Vec::new(),
                    send_buf: Vec::new(),
                    expected_len: 0,
                    close_after_flush: false,
                    refcount: 0,
                    last_activity: Instant::now(),
                },
            );
            id
        };

        let sk = SockInfo::new(remote_ip, remote_port);
        let c_sk: CSockInfo = sk.into();
        let plugin = state.borrow().plugin.clone();

        if let Some(open) = plugin.call_open(&c_sk) {
            if open.rc != 0 {
                unsafe { free_plugin_buffer(open.raw_ptr) };
                state.borrow_mut().conns.remove(&id);
                net::close(cfd);
                continue;
            }
            unsafe { free_plugin_buffer(open.raw_ptr) };
            if let Some(payload) = open.payload {
                let mut st = state.borrow_mut();
                if let Some(rec) = st.conns.get_mut(&id) {
                    rec.send_buf.extend_from_slice(&payload);
                }
            }
        }

        let has_output = state
            .borrow()
            .conns
            .get(&id)
            .map(|rec| !rec.send_buf.is_empty())
            .unwrap_or(false);

        {
            let state = state.clone();
            let _ = reactor.create_readable_event(cfd, move |reactor, fd, _mask| {
                on_readable(reactor, fd, &state, id);
            });
        }
        if has_output {
            let state = state.clone();
            let _ = reactor.create_writable_event(cfd, move |reactor, fd, _mask| {
                on_writable(reactor, fd, &state, id);
            });
        }
    }
}

fn on_readable(reactor: &mut Reactor, fd: RawFd, state: &SharedState, id: ConnId) {
    let mut buf = [0u8; READ_CHUNK];
    let read = net::read_nonblocking(fd, &mut buf);

    match read {
        Ok(None) => {}
        Ok(Some(0)) => {
            notify_close_via_plugin(state, id);
            close_client(reactor, state, id);
            return;
        }
        Ok(Some(n)) => {
            let mut st = state.borrow_mut();
            if let Some(rec) = st.conns.get_mut(&id) {
                rec.recv_buf.extend_from_slice(&buf[..n]);
                rec.last_activity = Instant::now();
            }
        }
        Err(e) => {
            warn!("read failed on fd {fd}: {e}");
            notify_close_via_plugin(state, id);
            close_client(reactor, state, id);
            return;
        }
    }

    loop {
        let outcome = frame_one(state, id);
        match outcome {
            FrameOutcome::NeedMoreBytes => break,
            FrameOutcome::Framed(frame) => {
                if push_frame(state, id, &frame).is_err() {
                    notify_close_via_plugin(state, id);
                    close_client(reactor, state, id);
                    break;
                }
            }
            FrameOutcome::Invalid => {
                notify_close_via_plugin(state, id);
                close_client(reactor, state, id);
                break;
            }
            FrameOutcome::ConnGone => break,
        }
    }
}

enum FrameOutcome {
    NeedMoreBytes,
    Framed(Vec<u8>),
    Invalid,
    ConnGone,
}

/// One pass of the framing state machine against the record's current
/// receive buffer: probes `handle_input` when the expected length is
/// unknown, then slices off one frame if enough bytes have arrived.
fn frame_one(state: &SharedState, id: ConnId) -> FrameOutcome {
    let (plugin, c_sk, expected_len, have) = {
        let st = state.borrow();
        let Some(rec) = st.conns.get(&id) else {
            return FrameOutcome::ConnGone;
        };
        let c_sk: CSockInfo = rec.sock_info().into();
        (st.plugin.clone(), c_sk, rec.expected_len, rec.recv_buf.len())
    };

    let expected_len = if expected_len == 0 {
        let buf_copy = {
            let st = state.borrow();
            st.conns.get(&id).map(|r| r.recv_buf.clone())
        };
        let Some(buf_copy) = buf_copy else {
            return FrameOutcome::ConnGone;
        };
        let probe = plugin.call_input(&buf_copy, &c_sk);
        if probe < 0 || probe as usize > MAX_PROT_LEN {
            return FrameOutcome::Invalid;
        }
        if probe == 0 {
            return FrameOutcome::NeedMoreBytes;
        }
        let mut st = state.borrow_mut();
        if let Some(rec) = st.conns.get_mut(&id) {
            rec.expected_len = probe as usize;
        }
        probe as usize
    } else {
        expected_len
    };

    if have < expected_len {
        return FrameOutcome::NeedMoreBytes;
    }

    let mut st = state.borrow_mut();
    let Some(rec) = st.conns.get_mut(&id) else {
        return FrameOutcome::ConnGone;
    };
    let frame = rec.recv_buf[..expected_len].to_vec();
    rec.recv_buf.drain(..expected_len);
    rec.expected_len = 0;
    FrameOutcome::Framed(frame)
}

fn push_frame(state: &SharedState, id: ConnId, frame: &[u8]) -> std::result::Result<(), ()> {
    let (boot_id, remote_ip, remote_port, recv_ring) = {
        let st = state.borrow();
        let Some(rec) = st.conns.get(&id) else {
            return Err(());
        };
        (st.boot_id, rec.remote_ip, rec.remote_port, st.recv_ring.clone())
    };

    let origin = OriginToken::new(boot_id, id);
    let header = RingMsgHeader::new(
        origin,
        pack_remote_ip(&remote_ip.to_string()),
        remote_port,
        false,
        frame.len() as u32,
    );
    let mut msg = Vec::with_capacity(RingMsgHeader::ENCODED_LEN + frame.len());
    msg.extend_from_slice(&header.encode());
    msg.extend_from_slice(frame);

    match recv_ring.push(&msg, RingFlags::WAIT | RingFlags::LOCK) {
        Ok(()) => {
            let mut st = state.borrow_mut();
            if let Some(rec) = st.conns.get_mut(&id) {
                rec.refcount += 1;
            }
            Ok(())
        }
        Err(e) => {
            error!("recv-ring push failed: {e}");
            Err(())
        }
    }
}

/// Looks up which connection a popped send-ring message is addressed to
/// without consulting a reverse fd map: the ring message itself carries
/// the `ConnId`.
fn drain_send_ring(reactor: &mut Reactor, state: &SharedState) {
    loop {
        let send_ring = state.borrow().send_ring.clone();
        let raw = match send_ring.pop(RingFlags::empty()) {
            Ok(raw) => raw,
            Err(vb_core::VbError::ResourceExhausted(_)) => return,
            Err(e) => {
                error!("send-ring pop failed: {e}");
                return;
            }
        };

        let Some((header, payload)) = RingMsgHeader::decode(&raw) else {
            warn!("dropping malformed send-ring message");
            continue;
        };

        let current_boot = state.borrow().boot_id;
        if !header.origin.is_current(current_boot) {
            warn!("dropping send-ring message from a stale conn-process generation");
            continue;
        }

        let id = header.origin.conn_id;
        let fd = {
            let mut st = state.borrow_mut();
            let Some(rec) = st.conns.get_mut(&id) else {
                continue;
            };
            rec.refcount -= 1;
            if rec.fd == -1 {
                None
            } else {
                rec.send_buf.extend_from_slice(payload);
                if header.close_conn {
                    rec.close_after_flush = true;
                }
                Some(rec.fd)
            }
        };

        if let Some(fd) = fd {
            let state = state.clone();
            let _ = reactor.create_writable_event(fd, move |reactor, fd, _mask| {
                on_writable(reactor, fd, &state, id);
            });
        }

        maybe_reap(state, id);
    }
}

fn on_writable(reactor: &mut Reactor, fd: RawFd, state: &SharedState, id: ConnId) {
    let send_buf = {
        let st = state.borrow();
        st.conns.get(&id).map(|rec| rec.send_buf.clone())
    };
    let Some(send_buf) = send_buf else {
        return;
    };
    if send_buf.is_empty() {
        reactor.delete_file_event(fd, FileMask::WRITABLE);
        return;
    }

    match net::write_nonblocking(fd, &send_buf) {
        Ok(n) => {
            let (empty, close_after_flush) = {
                let mut st = state.borrow_mut();
                let Some(rec) = st.conns.get_mut(&id) else {
                    return;
                };
                rec.send_buf.drain(..n);
                (rec.send_buf.is_empty(), rec.close_after_flush)
            };
            if empty {
                reactor.delete_file_event(fd, FileMask::WRITABLE);
                if close_after_flush {
                    close_client(reactor, state, id);
                }
            }
        }
        Err(e) => {
            warn!("write failed on fd {fd}: {e}");
            close_client(reactor, state, id);
        }
    }
}

/// Removes the record once `fd == -1 && refcount == 0`; the connection
/// may still be lingering with worker responses outstanding, in which
/// case this is a no-op until the last one drains.
fn maybe_reap(state: &SharedState, id: ConnId) {
    let dead = state.borrow().conns.get(&id).map(|r| r.is_dead()).unwrap_or(false);
    if dead {
        state.borrow_mut().conns.remove(&id);
    }
}

fn notify_close_via_plugin(state: &SharedState, id: ConnId) {
    let (plugin, sk) = {
        let st = state.borrow();
        let Some(rec) = st.conns.get(&id) else {
            return;
        };
        (st.plugin.clone(), rec.sock_info())
    };
    let c_sk: CSockInfo = sk.into();
    plugin.call_close(&c_sk);
}

/// Deregisters both read and write interest, closes the fd, marks it
/// gone, and frees the record immediately if no worker response is
/// still outstanding — otherwise the record lingers until
/// [`maybe_reap`] sees `refcount` reach zero.
fn close_client(reactor: &mut Reactor, state: &SharedState, id: ConnId) {
    let fd = {
        let mut st = state.borrow_mut();
        let Some(rec) = st.conns.get_mut(&id) else {
            return;
        };
        if rec.fd == -1 {
            return;
        }
        let fd = rec.fd;
        rec.fd = -1;
        fd
    };
    reactor.delete_file_event(fd, FileMask::READABLE | FileMask::WRITABLE);
    net::close(fd);
    maybe_reap(state, id);
}
