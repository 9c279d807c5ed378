//! Logging module for the relay.
//!
//! This module provides structured logging functionality using the `tracing` crate.
//! The sink is initialized once at startup, before any component logs, and
//! lives until process exit. The returned guard must be held by the caller so
//! buffered records are flushed.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Errors raised while setting up the logging sink.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The configured log file could not be opened
    #[error("Failed to open log file {path}: {source}")]
    OpenLogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configured level name is not recognized
    #[error("Unknown log level: {0}")]
    UnknownLevel(String),
}

/// Log initialization options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Log level (default: INFO)
    pub level: Level,

    /// Log file; `None` logs to stdout (default: None)
    pub log_file: Option<PathBuf>,

    /// Whether to use JSON format for logs (default: false)
    pub json_format: bool,

    /// Whether to include file and line information (default: true)
    pub include_file_line: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::INFO,
            log_file: None,
            json_format: false,
            include_file_line: true,
        }
    }
}

/// Parse a severity name into a tracing level.
///
/// Accepts the syslog-style names used in configuration files
/// (`critical`, `warning`, `notice`) as well as tracing's own.
pub fn parse_level(name: &str) -> Result<Level, LoggingError> {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "" | "info" | "notice" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" | "critical" => Ok(Level::ERROR),
        _ => Err(LoggingError::UnknownLevel(name.to_string())),
    }
}

/// Initialize logging with the given options.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure logs are flushed properly.
///
/// # Examples
///
/// ```
/// use relay_utils::logging::{init_logging, LogOptions};
/// use tracing::Level;
///
/// let options = LogOptions {
///     level: Level::DEBUG,
///     ..Default::default()
/// };
///
/// let _guard = init_logging(options).unwrap();
/// ```
pub fn init_logging(options: LogOptions) -> Result<WorkerGuard, LoggingError> {
    let (writer, guard) = match &options.log_file {
        Some(path) => NonBlocking::new(open_log_file(path)?),
        None => NonBlocking::new(io::stdout()),
    };

    // Bridge `log` crate records into `tracing` so dependency logs are captured
    let _ = LogTracer::init();

    let filter = EnvFilter::from_default_env().add_directive(options.level.into());

    let layer = fmt::layer()
        .with_file(options.include_file_line)
        .with_line_number(options.include_file_line)
        .with_target(true)
        .with_ansi(options.log_file.is_none())
        .with_writer(writer);

    let layer = if options.json_format {
        layer.json().boxed()
    } else {
        layer.boxed()
    };

    // Set the global subscriber (ignore if already set in this process)
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init();

    Ok(guard)
}

/// Initialize logging from a configuration.
///
/// Uses `Logfile` when set, stdout otherwise, at the `Loglevel` severity.
pub fn init_logging_from_config(
    config: &crate::config::Config,
) -> Result<WorkerGuard, LoggingError> {
    let options = LogOptions {
        level: parse_level(&config.loglevel)?,
        log_file: config.logfile().map(Path::to_path_buf),
        ..Default::default()
    };

    init_logging(options)
}

fn open_log_file(path: &Path) -> Result<std::fs::File, LoggingError> {
    let mut options = OpenOptions::new();
    options.read(true).append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path).map_err(|source| LoggingError::OpenLogFile {
        path: path.to_path_buf(),
        source,
    })
}
