//! Master process: load config, fork the connection and worker children,
//! supervise them until told to quit.
//!
//! Grounded on `original_source/src/verben.c`'s `main` and
//! `master_process_cycle`: `spawn_process`/`create_processes` become
//! [`fork_conn`]/[`fork_worker`] and the initial fan-out in [`run`];
//! `reap_children` becomes [`reap_children`] plus [`ProcessTable::due_for_respawn`];
//! `signal_worker_processes`/`kill(0, SIGTERM)` becomes [`broadcast_sigterm`].
//! The C version blocks in `sigsuspend` between signals; `libc::pause`
//! is the same idea without needing to build and restore a `sigset_t`.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{error, info, warn};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use vb_config::ConfTree;
use vb_core::Role;
use vb_ipc::notifier::{self, NotifierReader, NotifierWriter};
use vb_ipc::ring::ShmRing;
use vb_plugin::Plugin;

use crate::config::DaemonConfig;
use crate::conn;
use crate::error::{DaemonError, Result};
use crate::pidfile::PidFile;
use crate::process_table::{ChildRole, ProcessTable, RespawnPolicy};
use crate::signals;
use crate::worker;

/// Everything a (re)spawn needs, kept alive for the master's whole
/// lifetime so a respawned child gets the same rings, notifier and
/// plugin the first one did.
struct SpawnCtx {
    cfg: DaemonConfig,
    raw_cfg: ConfTree,
    recv_ring: Arc<ShmRing>,
    send_ring: Arc<ShmRing>,
    notifier_reader: NotifierReader,
    notifier_writer: NotifierWriter,
    plugin: Arc<Plugin>,
}

/// Runs the master role to completion: boots the daemon, supervises its
/// children, and returns once every child has exited after a quit
/// signal. The caller (`cmd/verben`) exits the process afterward.
pub fn run(config_path: &Path) -> Result<()> {
    let tree = vb_config::load(config_path)?;
    vb_log::boot_notify(true, &format!("Load config file {}", config_path.display()));

    let cfg = match DaemonConfig::from_tree(&tree) {
        Ok(cfg) => cfg,
        Err(e) => {
            vb_log::boot_notify(false, &format!("Parse config file {}: {e}", config_path.display()));
            return Err(DaemonError::Config(e));
        }
    };

    signals::install_for_role(Role::Master)?;
    vb_log::boot_notify(true, "Initialize signal handlers");

    let _logger = vb_log::init(&cfg.log, Role::Master)?;
    vb_log::boot_notify(true, "Initialize log file");

    // Become the leader of our own process group so `kill(0, SIGTERM)`
    // later reaches every descendant in one call.
    nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
        .map_err(|e| DaemonError::Config(format!("setpgid: {e}")))?;
    vb_log::boot_notify(true, "Set self to be leader of the process group");

    let pidfile = PidFile::create(&cfg.pid_file)?;
    vb_log::boot_notify(true, &format!("Write pid file {}", cfg.pid_file.display()));

    let plugin = Arc::new(unsafe { Plugin::load(&cfg.so_file) }.map_err(|e| DaemonError::Plugin(e.to_string()))?);
    vb_log::boot_notify(true, &format!("load so file {}", cfg.so_file.display()));

    plugin
        .call_init(std::ptr::null_mut(), Role::Master)
        .map_err(|e| DaemonError::Plugin(e.to_string()))?;

    crate::proctitle::set_title(&crate::proctitle::role_title(Role::Master.tag()));
    info!("verben master starting, pid={}", std::process::id());

    // Every shared resource below must exist before the first fork so
    // every descendant inherits the same physical mapping.
    let lock_dir = std::env::temp_dir();
    let recv_ring = Arc::new(ShmRing::create(cfg.shmq_recv, cfg.lock_kind, &lock_dir)?);
    let send_ring = Arc::new(ShmRing::create(cfg.shmq_send, cfg.lock_kind, &lock_dir)?);
    let (notifier_reader, notifier_writer) = notifier::create()?;

    let worker_num = cfg.worker_num;
    let ctx = SpawnCtx {
        cfg,
        raw_cfg: tree,
        recv_ring,
        send_ring,
        notifier_reader,
        notifier_writer,
        plugin: plugin.clone(),
    };

    let mut table = ProcessTable::new();

    let conn_pid = fork_conn(&ctx)?;
    table.insert(conn_pid, ChildRole::Connection, RespawnPolicy::Always);
    vb_log::boot_notify(true, &format!("Spawn connection process (pid {conn_pid})"));

    for _ in 0..worker_num {
        let pid = fork_worker(&ctx)?;
        table.insert(pid, ChildRole::Worker, RespawnPolicy::Always);
    }
    vb_log::boot_notify(true, &format!("Spawn {worker_num} worker processes"));

    master_cycle(&mut table, &ctx);

    info!("master: all children have exited, shutting down");
    plugin.call_fini(std::ptr::null_mut(), Role::Master);
    pidfile.remove();
    Ok(())
}

/// Forks the connection-process child, running `conn::run` to
/// completion and exiting the child process directly — this function
/// never returns in the child.
fn fork_conn(ctx: &SpawnCtx) -> Result<i32> {
    let reader = ctx.notifier_reader.try_clone()?;
    match unsafe { fork() }.map_err(|e| DaemonError::Config(format!("fork: {e}")))? {
        ForkResult::Child => {
            let result = conn::run(
                &ctx.cfg,
                &ctx.raw_cfg,
                ctx.recv_ring.clone(),
                ctx.send_ring.clone(),
                reader,
                ctx.plugin.clone(),
            );
            if let Err(e) = result {
                error!("conn process exiting on error: {e}");
                std::process::exit(1);
            }
            std::process::exit(0);
        }
        ForkResult::Parent { child } => Ok(child.as_raw()),
    }
}

/// Forks one worker-process child; never returns in the child.
fn fork_worker(ctx: &SpawnCtx) -> Result<i32> {
    let writer = ctx.notifier_writer.try_clone()?;
    match unsafe { fork() }.map_err(|e| DaemonError::Config(format!("fork: {e}")))? {
        ForkResult::Child => {
            let result = worker::run(
                &ctx.raw_cfg,
                ctx.recv_ring.clone(),
                ctx.send_ring.clone(),
                writer,
                ctx.plugin.clone(),
            );
            if let Err(e) = result {
                error!("worker process exiting on error: {e}");
                std::process::exit(1);
            }
            std::process::exit(0);
        }
        ForkResult::Parent { child } => Ok(child.as_raw()),
    }
}

/// Replaces an exited slot's child with a freshly forked one of the same
/// role, matching `spawn_process`'s `respawn >= 0` branch.
fn respawn(table: &mut ProcessTable, idx: usize, ctx: &SpawnCtx) {
    let role = table.slot(idx).role;
    let spawned = match role {
        ChildRole::Connection => fork_conn(ctx),
        ChildRole::Worker => fork_worker(ctx),
    };
    match spawned {
        Ok(pid) => {
            warn!("master: respawning {} (slot {idx}) as pid {pid}", role.tag());
            table.respawn_into(idx, pid);
        }
        Err(e) => error!("master: failed to respawn {} (slot {idx}): {e}", role.tag()),
    }
}

/// Drains every exited child's status via a non-blocking `waitpid` loop,
/// matching `process_get_status`.
fn reap_children(table: &mut ProcessTable) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return,
            Ok(status) => match status.pid() {
                Some(pid) => {
                    table.mark_exited(pid.as_raw(), 0);
                }
                None => return,
            },
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return,
        }
    }
}

/// Sends `SIGTERM` to the whole process group, matching the original's
/// `kill(0, SIGTERM)` in the quit branch of `master_process_cycle`.
fn broadcast_sigterm() {
    if let Err(e) = signal::kill(Pid::from_raw(0), Signal::SIGTERM) {
        warn!("master: broadcasting SIGTERM to process group failed: {e}");
    }
}

/// The supervisor loop: wakes on every signal, reaps and respawns as
/// needed, and once `QUIT` is set keeps broadcasting `SIGTERM` until the
/// last child has exited.
///
/// A worker blocked in a `WAIT`-flagged ring pop/push only notices
/// shutdown through the ring's own stop flag: workers set the stop flag
/// and call the ring's stop-wait path, which unblocks any pop/push loop.
/// `SIGTERM` alone only flips [`signals::WORKER_QUIT`], which a worker
/// parked in a blocking ring call never re-checks mid-wait, so the rings
/// themselves must be stopped once shutdown begins.
fn master_cycle(table: &mut ProcessTable, ctx: &SpawnCtx) {
    let mut rings_stopped = false;
    loop {
        unsafe {
            libc::pause();
        }

        if signals::REAP.swap(false, Ordering::SeqCst) {
            reap_children(table);
            let quit = signals::QUIT.load(Ordering::SeqCst);
            for idx in table.due_for_respawn(quit) {
                respawn(table, idx, ctx);
            }
        }

        if signals::QUIT.load(Ordering::SeqCst) {
            if !rings_stopped {
                ctx.recv_ring.stop();
                ctx.send_ring.stop();
                rings_stopped = true;
            }
            if !table.any_alive() {
                return;
            }
            broadcast_sigterm();
        }
    }
}
