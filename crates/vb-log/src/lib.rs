//! # vb-log — rotating file logging and boot-status reporting
//!
//! Grounded on the original daemon's `log.c`: level filter, size-based
//! rotation keeping a bounded number of old files, and a `log_multi`
//! toggle, implemented over `flexi_logger` instead of the original's
//! hand-rolled `mmap` scratch buffer and `rename`-chain rotation.
//!
//! One deliberate reinterpretation: the original's `log_multi` splits
//! output *by severity level* (one file per `FATAL`/`ERROR`/.../`DEBUG`
//! tier). In a multi-process daemon the dimension worth splitting by is
//! *which process wrote the line*, not its severity — severity-sharded
//! logs scatter a single request's story across five files. `log_multi`
//! here instead gives each process role its own file, suffixed by pid,
//! via `flexi_logger`'s discriminant naming; `log_multi = false` keeps
//! the original's single shared file.

use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming, WriteMode};
use log::LevelFilter;
use std::io::IsTerminal;
use std::path::PathBuf;
use vb_core::{Result, Role, VbError};

/// Matches the original's `LOG_LEVEL_*` family; `Debug` and `All` are the
/// same tier (`LOG_LEVEL_ALL == LOG_LEVEL_DEBUG`).
pub fn level_filter(raw: &str) -> LevelFilter {
    match raw.trim().to_ascii_lowercase().as_str() {
        "fatal" | "error" => LevelFilter::Error,
        "warning" | "warn" => LevelFilter::Warn,
        "notice" | "info" => LevelFilter::Info,
        "debug" | "all" => LevelFilter::Debug,
        _ => LevelFilter::Debug,
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub name: String,
    pub level: LevelFilter,
    /// Rotation threshold in bytes (`log_size`, default 1 GiB).
    pub size: u64,
    /// Number of rotated files to retain (`log_num`, default 10).
    pub num: usize,
    /// Split by process identity rather than share one file.
    pub multi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            name: "verben.log".to_string(),
            level: LevelFilter::Debug,
            size: 1 << 30,
            num: 10,
            multi: false,
        }
    }
}

/// Starts the process-wide logger. Returns a [`LoggerHandle`] the caller
/// must keep alive for the process's lifetime — dropping it stops
/// logging, matching the original's explicit `log_close()`.
pub fn init(cfg: &LogConfig, role: Role) -> Result<LoggerHandle> {
    let mut spec = FileSpec::default()
        .directory(&cfg.dir)
        .basename(cfg.name.clone());

    if cfg.multi {
        spec = spec.discriminant(format!("{}-{}", role.tag(), std::process::id()));
    }

    Logger::try_with_str(cfg.level.as_str())
        .map_err(|e| VbError::Config(format!("log level: {e}")))?
        .log_to_file(spec)
        .rotate(
            Criterion::Size(cfg.size),
            Naming::Numbers,
            Cleanup::KeepLogFiles(cfg.num),
        )
        .write_mode(WriteMode::BufferAndFlush)
        .format(format_record)
        .start()
        .map_err(|e| VbError::Config(format!("log init: {e}")))
}

fn format_record(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> std::io::Result<()> {
    write!(
        w,
        "[{}][{:05}][{}] {}",
        now.format("%Y/%m/%d-%H:%M:%S"),
        std::process::id(),
        record.level(),
        record.args()
    )
}

const SCREEN_COLS: usize = 80;
const CONTENT_COLS: usize = 65;

/// Prints a single `[  OK  ]`/`[FAILED]` status line for `message`,
/// matching `BOOT_OK`/`BOOT_FAILED`. Color codes are emitted only when
/// stdout is a terminal.
pub fn boot_notify(ok: bool, message: &str) {
    let status = if std::io::stdout().is_terminal() {
        if ok {
            "\x1b[1m[\x1b[32m  OK  \x1b[37m]\x1b[m"
        } else {
            "\x1b[1m[\x1b[31mFAILED\x1b[37m]\x1b[m"
        }
    } else if ok {
        "[  OK  ]"
    } else {
        "[FAILED]"
    };

    let truncated: String = message.chars().take(SCREEN_COLS).collect();
    if truncated.chars().count() > CONTENT_COLS {
        let head: String = truncated.chars().take(CONTENT_COLS - 5).collect();
        println!("{:<width$} ... {}", head, status, width = CONTENT_COLS - 5);
    } else {
        println!("{:<width$}{}", truncated, status, width = CONTENT_COLS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_filter_maps_fatal_and_error_to_the_same_tier() {
        assert_eq!(level_filter("fatal"), LevelFilter::Error);
        assert_eq!(level_filter("error"), LevelFilter::Error);
    }

    #[test]
    fn level_filter_maps_debug_and_all_to_the_same_tier() {
        assert_eq!(level_filter("debug"), LevelFilter::Debug);
        assert_eq!(level_filter("all"), LevelFilter::Debug);
        assert_eq!(level_filter("ALL"), LevelFilter::Debug);
    }

    #[test]
    fn unknown_level_falls_back_to_debug() {
        assert_eq!(level_filter("bogus"), LevelFilter::Debug);
    }

    #[test]
    fn default_config_matches_original_constants() {
        let cfg = LogConfig::default();
        assert_eq!(cfg.size, 1 << 30);
        assert_eq!(cfg.num, 10);
        assert!(!cfg.multi);
    }
}
