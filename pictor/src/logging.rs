//! Logging infrastructure.
//!
//! Structured logging with optional file output:
//! - compact single-line format on stdout for service operation
//! - optional non-blocking file writer under a log directory
//! - configurable via the RUST_LOG environment variable (default `info`)

use std::fs;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Guard that must be kept alive for the duration of logging.
///
/// Dropping this guard flushes and closes the log file writer.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize logging to stdout only.
pub fn init_logging() -> LoggingGuard {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .init();
    LoggingGuard { _file_guard: None }
}

/// Initialize logging to stdout and a log file.
///
/// Creates the log directory if needed; the previous log file is
/// truncated on session start.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created or the log
/// file cannot be truncated.
pub fn init_logging_with_file(log_dir: &str, log_file: &str) -> Result<LoggingGuard, io::Error> {
    fs::create_dir_all(log_dir)?;
    let log_path = Path::new(log_dir).join(log_file);
    fs::write(&log_path, "")?;

    let file_appender = tracing_appender::rolling::never(log_dir, log_file);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .compact();
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LoggingGuard {
        _file_guard: Some(file_guard),
    })
}

/// Default log directory path.
pub fn default_log_dir() -> &'static str {
    "logs"
}

/// Default log file name.
pub fn default_log_file() -> &'static str {
    "pictor.log"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        assert_eq!(default_log_dir(), "logs");
        assert_eq!(default_log_file(), "pictor.log");
    }

    #[test]
    fn test_log_file_truncated_on_init() {
        // init_logging_with_file can't run twice in one process (global
        // subscriber), so exercise the file handling on its own
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("pictor.log");
        fs::write(&log_path, "old session data").unwrap();

        fs::write(&log_path, "").unwrap();
        assert_eq!(fs::read_to_string(&log_path).unwrap(), "");
    }
}
