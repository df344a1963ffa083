//! Worker process: pop a request, call the plugin, push the response.
//!
//! Grounded on `original_source/src/worker.c`'s `worker_process_cycle`:
//! a tight loop around a blocking, locked ring pop and a blocking,
//! locked ring push, with the stop flag checked once per iteration
//! rather than mid-call (signals remain the only way in, matching the
//! upstream `vb_worker_quit` check at the top of the `for (;;)`).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use libc::c_void;
use log::{error, warn};

use vb_config::ConfTree;
use vb_core::plugin::HandleResult;
use vb_core::ring_wire::{pack_remote_ip, unpack_remote_ip, RingMsgHeader};
use vb_core::{Role, SockInfo, VbError};
use vb_ipc::notifier::NotifierWriter;
use vb_ipc::ring::{RingFlags, ShmRing};
use vb_plugin::{CSockInfo, Plugin};

use crate::error::{DaemonError, Result};
use crate::signals;

/// Casts a reference to the raw parsed config tree to the opaque `cfg`
/// pointer `handle_init`/`handle_fini` receive, matching how the original
/// passes its `conf_t*` through `void*`. Third-party C plugins treat it
/// as opaque; our own plugins may depend on `vb-config` and cast it back.
pub(crate) fn cfg_ptr(tree: &ConfTree) -> *mut c_void {
    tree as *const ConfTree as *mut ConfTree as *mut c_void
}

/// Runs the worker loop until `SIGTERM` sets the stop flag, then calls
/// `handle_fini` and returns. The caller exits the process afterward.
pub fn run(
    raw_cfg: &ConfTree,
    recv_ring: Arc<ShmRing>,
    send_ring: Arc<ShmRing>,
    notifier: NotifierWriter,
    plugin: Arc<Plugin>,
) -> Result<()> {
    crate::proctitle::set_title(&crate::proctitle::role_title(Role::Worker.tag()));
    signals::install_for_role(Role::Worker)?;

    if let Err(e) = plugin.call_init(cfg_ptr(raw_cfg), Role::Worker) {
        error!("worker: handle_init failed: {e}");
        return Err(DaemonError::Plugin(e.to_string()));
    }

    loop {
        if signals::WORKER_QUIT.load(Ordering::SeqCst) {
            plugin.call_fini(cfg_ptr(raw_cfg), Role::Worker);
            return Ok(());
        }

        let raw = match recv_ring.pop(RingFlags::WAIT | RingFlags::LOCK) {
            Ok(raw) => raw,
            Err(VbError::Stopped) => {
                plugin.call_fini(cfg_ptr(raw_cfg), Role::Worker);
                return Ok(());
            }
            Err(e) => {
                warn!("recv-ring pop failed: {e}");
                continue;
            }
        };

        let Some((header, payload)) = RingMsgHeader::decode(&raw) else {
            warn!("dropping malformed recv-ring message");
            continue;
        };

        let sk = SockInfo::new(
            unpack_remote_ip(&header.remote_ip).parse().unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
            header.remote_port,
        );
        let c_sk: CSockInfo = sk.into();

        let mut input = payload.to_vec();
        let result = plugin.call_process(&mut input, &c_sk);
        let flags = HandleResult::from_raw(result.rc as u32);

        let out_payload: &[u8] = if flags.is_error() {
            &[]
        } else {
            result.payload.as_deref().unwrap_or(&[])
        };

        let response_header = RingMsgHeader::new(
            header.origin,
            pack_remote_ip(&sk.remote_ip.to_string()),
            header.remote_port,
            flags.should_close(),
            out_payload.len() as u32,
        );
        let mut response = Vec::with_capacity(RingMsgHeader::ENCODED_LEN + out_payload.len());
        response.extend_from_slice(&response_header.encode());
        response.extend_from_slice(out_payload);

        if let Err(e) = send_ring.push(&response, RingFlags::WAIT | RingFlags::LOCK) {
            warn!("send-ring push failed: {e}");
        } else if let Err(e) = notifier.notify() {
            warn!("notifier write failed: {e}");
        }

        plugin.call_process_post(result.raw_ptr, result.raw_len);
    }
}
