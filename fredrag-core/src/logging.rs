//! Logging for fredrag
//!
//! Events go to `fredrag.YYYY-MM-DD.log` in the XDG state directory
//! (`~/.local/state/fredrag/`), one file per UTC day. Stdout is reserved for
//! command output, so the optional console layer writes to stderr.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

const LOG_FILE_PREFIX: &str = "fredrag";
const LOG_FILE_SUFFIX: &str = "log";

/// Install the global subscriber.
///
/// The file layer honours `RUST_LOG` and falls back to `config.level`. When
/// `config.stderr_level` is set, events at that level are also echoed to
/// stderr. An invalid level is a configuration error.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let log_dir = Config::state_dir();
    let appender = file_appender(&log_dir, config.max_files)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => level_filter(&config.level)?,
    };
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(file_filter);

    let stderr_layer = match config.stderr_level.as_deref() {
        Some(level) => Some(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time()
                .with_filter(level_filter(level)?),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("logging already initialized: {}", e)))?;

    tracing::info!(
        log_file = %log_dir.join(current_file_name()).display(),
        level = %config.level,
        stderr_level = config.stderr_level.as_deref().unwrap_or("off"),
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Daily appender in `dir`, keeping at most `max_files` files.
fn file_appender(dir: &Path, max_files: usize) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(max_files.max(1))
        .build(dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))
}

fn level_filter(directives: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directives)
        .map_err(|e| Error::Config(format!("invalid log level '{}': {}", directives, e)))
}

/// Name of the file today's events are written to
pub fn current_file_name() -> String {
    format!(
        "{}.{}.{}",
        LOG_FILE_PREFIX,
        Utc::now().format("%Y-%m-%d"),
        LOG_FILE_SUFFIX
    )
}

/// Initialize logging for tests (captured by the test harness)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Keeps the non-blocking writer alive; pending lines are flushed on drop.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Path of the file today's events are written to
pub fn log_file_path() -> PathBuf {
    Config::log_path()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_file_path_is_dated() {
        let path = log_file_path();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("fredrag.20"));
        assert!(name.ends_with(".log"));
        assert_eq!(name, current_file_name());
    }

    #[test]
    fn test_level_filter_validates_directives() {
        assert!(level_filter("info").is_ok());
        assert!(level_filter("warn,fredrag_core=debug").is_ok());

        let err = level_filter("fredrag_core=loudest").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }

    #[test]
    fn test_file_appender_writes_current_file() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("state");
        let appender = file_appender(&log_dir, 0).unwrap();

        let subscriber = tracing_subscriber::fmt()
            .with_writer(appender)
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(series_id = "GDP", "Stored series");
        });

        let contents = std::fs::read_to_string(log_dir.join(current_file_name())).unwrap();
        assert!(contents.contains("Stored series"));
        assert!(contents.contains("series_id=\"GDP\""));
    }

    #[test]
    fn test_init_test_is_repeatable() {
        init_test();
        init_test();
    }
}
