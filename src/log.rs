//! Logging setup for docflow.
//!
//! Log levels:
//! - ERROR: Failures that end a run early
//! - WARN: Retries, degraded quality, task failures
//! - INFO: Run and phase boundaries
//! - DEBUG: Dispatch, cache and scheduling decisions
//! - TRACE: Dropped progress events
//!
//! Debug mode can be enabled with the `--debug` flag or `DOCFLOW_DEBUG=1`.
//! `RUST_LOG`, when set, overrides both.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Env var that turns on debug logging.
pub const DEBUG_ENV: &str = "DOCFLOW_DEBUG";

/// Path of the log file, `~/.docflow/docflow.log`.
pub fn log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".docflow").join("docflow.log"))
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Filter directive for the given debug setting.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "docflow=debug,info"
    } else {
        "info"
    }
}

/// Install the global subscriber.
///
/// Writes to the log file, truncated on startup, or to stderr when the file
/// can't be created. Safe to call more than once.
pub fn init(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let file = log_path().and_then(|path| {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).ok()?;
        }
        File::create(&path).ok()
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let _ = match file {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}
