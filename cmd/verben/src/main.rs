//! `verben` — start or stop the daemon described by a config file.
//!
//! `start` (the default action) loads the config and runs the master
//! role to completion; `stop` reads the PID file the running master
//! wrote and sends it `SIGQUIT`, the same signal the master itself
//! broadcasts to the process group on shutdown.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

#[derive(Parser, Debug)]
#[command(
    name = "verben",
    about = "A pluggable multi-process TCP application server",
    disable_version_flag = true
)]
struct Cli {
    /// Path to the config file.
    #[arg(short = 'c', long = "config", default_value = "./verben.conf")]
    config: PathBuf,

    /// Print the version and exit.
    #[arg(short = 'v', long = "version")]
    version: bool,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Subcommand, Debug, Clone, Copy, Default)]
enum Action {
    #[default]
    Start,
    Stop,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        println!("verben {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    match cli.action.unwrap_or_default() {
        Action::Start => run_start(&cli.config),
        Action::Stop => run_stop(&cli.config),
    }
}

fn run_start(config: &Path) -> ExitCode {
    println!(
        "verben: a network server bench.\n  version: {}\n",
        env!("CARGO_PKG_VERSION")
    );
    match vb_daemon::master::run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("verben: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_stop(config: &Path) -> ExitCode {
    let tree = match vb_config::load(config) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("verben: {}: {e}", config.display());
            return ExitCode::FAILURE;
        }
    };
    let cfg = match vb_daemon::DaemonConfig::from_tree(&tree) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("verben: {e}");
            return ExitCode::FAILURE;
        }
    };

    let pid = match vb_daemon::pidfile::read_pid(&cfg.pid_file) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("verben: {e}");
            return ExitCode::FAILURE;
        }
    };

    match signal::kill(Pid::from_raw(pid), Signal::SIGQUIT) {
        Ok(()) => {
            println!("verben: sent SIGQUIT to pid {pid}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("verben: kill({pid}): {e}");
            ExitCode::FAILURE
        }
    }
}
