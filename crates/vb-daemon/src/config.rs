//! Typed daemon configuration, read out of a [`vb_config::ConfTree`].
//!
//! `vb-config` only knows about keys, values and blocks; this module is
//! where those untyped strings turn into the values the master actually
//! acts on, with the defaults matching `original_source`'s `verben.c`
//! call sites.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use vb_config::ConfTree;
use vb_ipc::lock::LockKind;
use vb_log::LogConfig;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub server: IpAddr,
    pub port: u16,
    pub worker_num: usize,
    pub shmq_recv: usize,
    pub shmq_send: usize,
    pub client_limit: usize,
    pub client_timeout: Duration,
    pub so_file: PathBuf,
    pub pid_file: PathBuf,
    pub lock_kind: LockKind,
    pub log: LogConfig,
}

const DEFAULT_SHMQ_SIZE: usize = 1 << 20;

impl DaemonConfig {
    pub fn from_tree(tree: &ConfTree) -> Result<Self, String> {
        let server = tree
            .get_str_value("server")
            .unwrap_or("0.0.0.0")
            .parse::<IpAddr>()
            .map_err(|e| format!("invalid 'server' address: {e}"))?;

        let port = tree.get_int_value("port", 8773);
        if !(1..=u16::MAX as i64).contains(&port) {
            return Err(format!("'port' out of range: {port}"));
        }

        let worker_num = tree.get_int_value("worker_num", 4).max(1) as usize;
        let shmq_recv = tree.get_int_value("shmq_recv", DEFAULT_SHMQ_SIZE as i64).max(1) as usize;
        let shmq_send = tree.get_int_value("shmq_send", DEFAULT_SHMQ_SIZE as i64).max(1) as usize;
        let client_limit = tree.get_int_value("client_limit", 0).max(0) as usize;
        let client_timeout = Duration::from_secs(tree.get_int_value("client_timeout", 60).max(1) as u64);

        let so_file = tree
            .get_str_value("so_file")
            .map(PathBuf::from)
            .ok_or_else(|| "missing required key 'so_file'".to_string())?;

        let pid_file = PathBuf::from(tree.get_str_value("pid_file").unwrap_or("/tmp/verben.pid"));

        let lock_kind = match tree.get_str_value("lock_kind").unwrap_or("fcntl") {
            "pthread" => LockKind::Pthread,
            "sysv" | "sysvsem" => LockKind::SysvSem,
            _ => LockKind::Fcntl,
        };

        let log = LogConfig {
            dir: PathBuf::from(tree.get_str_value("log_dir").unwrap_or(".")),
            name: tree.get_str_value("log_name").unwrap_or("verben.log").to_string(),
            level: vb_log::level_filter(tree.get_str_value("log_level").unwrap_or("debug")),
            size: tree.get_int_value("log_size", 1 << 30).max(1) as u64,
            num: tree.get_int_value("log_num", 10).max(1) as usize,
            multi: tree.get_bool_value("log_multi", false),
        };

        Ok(Self {
            server,
            port,
            worker_num,
            shmq_recv,
            shmq_send,
            client_limit,
            client_timeout,
            so_file,
            pid_file,
            lock_kind,
            log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_constants() {
        let mut text = String::new();
        text.push_str("so_file ./plugins/libecho.so\n");
        let path = std::env::temp_dir().join(format!("vb-daemon-cfg-test-{}", std::process::id()));
        std::fs::write(&path, text).unwrap();
        let tree = vb_config::load(&path).unwrap();
        let cfg = DaemonConfig::from_tree(&tree).unwrap();
        assert_eq!(cfg.port, 8773);
        assert_eq!(cfg.worker_num, 4);
        assert_eq!(cfg.client_limit, 0);
        assert_eq!(cfg.client_timeout, Duration::from_secs(60));
        assert_eq!(cfg.pid_file, PathBuf::from("/tmp/verben.pid"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_so_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("vb-daemon-cfg-test-nofile-{}", std::process::id()));
        std::fs::write(&path, "port 9000\n").unwrap();
        let tree = vb_config::load(&path).unwrap();
        assert!(DaemonConfig::from_tree(&tree).is_err());
        std::fs::remove_file(&path).ok();
    }
}
