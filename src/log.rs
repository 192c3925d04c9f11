//! Process logging.
//!
//! Call sites use the `tracing` macros. [`init`] installs a fmt subscriber
//! that writes to `<workspace>/.gc/gc.log`, truncated on every start.
//!
//! Debug mode can be enabled with the `--debug` flag or `GC_DEBUG=1`.
//! `GC_LOG` takes a full `EnvFilter` directive and wins over both.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::{Error, Result};

pub const LOG_FILE: &str = "gc.log";
pub const DEBUG_ENV: &str = "GC_DEBUG";
pub const FILTER_ENV: &str = "GC_LOG";

/// Whether `GC_DEBUG` asks for debug output.
pub fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Filter directive for the given mode. An explicit directive is used as is.
pub fn directive(debug: bool, explicit: Option<&str>) -> String {
    match explicit.map(str::trim).filter(|s| !s.is_empty()) {
        Some(directive) => directive.to_string(),
        None if debug => "ground_control=debug,info".to_string(),
        None => "info".to_string(),
    }
}

/// Install the global subscriber writing to `log_dir/gc.log`.
///
/// # Errors
/// Returns an error if the log file cannot be created or a subscriber is
/// already installed.
pub fn init(log_dir: &Path, debug: bool) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)?;
    let path = log_dir.join(LOG_FILE);
    let file = fs::File::create(&path)?;

    let debug_on = debug || debug_from_env();
    let explicit = std::env::var(FILTER_ENV).ok();
    let filter = EnvFilter::try_new(directive(debug_on, explicit.as_deref()))
        .map_err(|e| Error::Validation(format!("invalid {} directive: {}", FILTER_ENV, e)))?;

    tracing_subscriber::fmt()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| Error::Validation(format!("logging already initialized: {}", e)))?;

    tracing::info!(path = %path.display(), debug = debug_on, "logging initialized");
    Ok(path)
}
