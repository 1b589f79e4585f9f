#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::Mutex;

pub use log;
use thiserror::Error;

#[cfg(debug_assertions)]
const DEFAULT_LOG_LEVEL: &str = "chatbox=trace";
#[cfg(not(debug_assertions))]
const DEFAULT_LOG_LEVEL: &str = "chatbox=info";

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    SetLogger(#[from] log::SetLoggerError),
}

/// Installs the process-wide logger.
///
/// The filter comes from `CHATBOX_LOG`, then `RUST_LOG`, then a crate-wide
/// default (`trace` for debug builds, `info` otherwise).
///
/// # Errors
///
/// * If a logger has already been installed
pub fn init() -> Result<(), InitError> {
    let filter = std::env::var("CHATBOX_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());

    env_logger::Builder::new()
        .parse_filters(&filter)
        .format_timestamp_millis()
        .try_init()?;

    log::debug!("Logging initialized with filter '{filter}'");

    Ok(())
}

#[derive(Debug, Error)]
pub enum ErrorLogError {
    #[error("Error log unavailable: {0}")]
    Unavailable(String),
}

/// Sink for connection-level error reports.
///
/// Callers report and move on. The result only says whether the line was
/// recorded and never influences how a connection is handled.
pub trait ErrorLog: Send + Sync {
    /// # Errors
    ///
    /// * If the line could not be recorded
    fn log(&self, line: &str) -> Result<(), ErrorLogError>;
}

/// Records `line` in `error_log`, falling back to a warning when the log
/// cannot take it.
pub fn report(error_log: &dyn ErrorLog, line: &str) {
    if let Err(e) = error_log.log(line) {
        log::warn!("Failed to record error '{line}': {e}");
    }
}

/// Forwards every line to the `log` facade at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrorLog;

impl ErrorLog for LogErrorLog {
    fn log(&self, line: &str) -> Result<(), ErrorLogError> {
        log::error!("{line}");
        Ok(())
    }
}

/// Keeps every line in memory, for inspection in tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryErrorLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryErrorLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

impl ErrorLog for MemoryErrorLog {
    fn log(&self, line: &str) -> Result<(), ErrorLogError> {
        self.lines
            .lock()
            .map_err(|e| ErrorLogError::Unavailable(e.to_string()))?
            .push(line.to_string());
        Ok(())
    }
}

/// Logs the first arguments at debug level, or the second at trace level when
/// trace is enabled. Used to keep large payloads out of debug output.
#[cfg(feature = "macros")]
#[macro_export]
macro_rules! debug_or_trace {
    (($($debug:tt)+), ($($trace:tt)+)) => {
        if $crate::log::log_enabled!($crate::log::Level::Trace) {
            $crate::log::trace!($($trace)*);
        } else {
            $crate::log::debug!($($debug)*);
        }
    }
}
