//! # vb-daemon — the master/connection/worker role bodies
//!
//! `cmd/verben` is a thin CLI shell; everything that actually boots and
//! runs the daemon lives here: configuration, the PID file, process
//! titles, signal flags, the raw TCP listener, and the three process
//! role loops (`master`, `conn`, `worker`).

pub mod config;
pub mod conn;
pub mod error;
pub mod master;
pub mod net;
pub mod pidfile;
pub mod process_table;
pub mod proctitle;
pub mod signals;
pub mod worker;

pub use config::DaemonConfig;
pub use error::{DaemonError, Result};
