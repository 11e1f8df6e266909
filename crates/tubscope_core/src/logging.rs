//! Log routing for the CLI.
//!
//! Log lines never go to stdout, which carries query results (and may be piped
//! into CSV tooling). Console lines go to stderr. When stderr is not a terminal,
//! or a file is asked for, lines are also written to a daily `tubscope.*.log`
//! under the data directory.
//!
//! Filter priority: explicit filter, then `TUBSCOPE_LOG`, then `RUST_LOG`.

use crate::error::{TubscopeError, TubscopeResult};

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "TUBSCOPE_LOG";

const FILE_PREFIX: &str = "tubscope";

/// Where log lines end up besides stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFile {
    /// Console only.
    Off,
    /// Console plus a daily file in this directory.
    In(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub filter: Option<String>,
    pub file: LogFile,
}

impl LogConfig {
    /// File output only when stderr is not a terminal.
    pub fn detect(log_dir: PathBuf) -> Self {
        let file = if atty::is(atty::Stream::Stderr) { LogFile::Off } else { LogFile::In(log_dir) };
        Self { filter: None, file }
    }

    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_file(mut self, dir: PathBuf) -> Self {
        self.file = LogFile::In(dir);
        self
    }
}

/// Keeps the file writer alive; dropping it flushes buffered lines.
#[must_use]
pub struct LogHandle {
    file_dir: Option<PathBuf>,
    _guard: Option<WorkerGuard>,
}

impl LogHandle {
    pub fn file_dir(&self) -> Option<&Path> {
        self.file_dir.as_deref()
    }
}

/// Install the global subscriber.
///
/// A file that cannot be opened downgrades to console-only with a warning.
/// A subscriber that is already installed is kept.
pub fn init_logging(config: LogConfig) -> LogHandle {
    let filter = build_env_filter(config.filter.as_deref());

    let file = match &config.file {
        LogFile::Off => None,
        LogFile::In(dir) => match open_file_writer(dir) {
            Ok(writer) => Some((dir.clone(), writer)),
            Err(e) => {
                eprintln!("warning: {e}; logging to the console only");
                None
            }
        },
    };

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .with_target(false)
        .with_filter(tracing_subscriber::filter::LevelFilter::INFO);

    let (file_dir, file_layer, guard) = match file {
        Some((dir, (writer, guard))) => {
            let layer = fmt::layer().with_writer(writer).with_ansi(false).with_target(true);
            (Some(dir), Some(layer), Some(guard))
        }
        None => (None, None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .is_ok();
    if !installed {
        tracing::debug!("Subscriber already installed; keeping it");
    }

    LogHandle { file_dir, _guard: guard }
}

fn open_file_writer(
    dir: &Path,
) -> TubscopeResult<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir).map_err(|e| {
        TubscopeError::internal(format!("cannot create log directory {}: {e}", dir.display()))
    })?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)
        .map_err(|e| TubscopeError::internal(format!("cannot open log file: {e}")))?;
    Ok(tracing_appender::non_blocking(appender))
}

fn build_env_filter(explicit: Option<&str>) -> EnvFilter {
    let fallback = || EnvFilter::new(default_log_filter());
    match explicit {
        Some(directives) => EnvFilter::try_new(directives).unwrap_or_else(|_| fallback()),
        None => EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| fallback()),
    }
}

/// The russh and mysql_async crates are chatty below WARN.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "debug,russh=warn,mysql_async=warn"
    } else {
        "info,russh=warn,mysql_async=warn"
    }
}

pub fn log_dir() -> PathBuf {
    crate::config::default_data_dir().join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(default_log_filter()).is_ok());
    }

    #[test]
    fn test_bad_explicit_filter_falls_back() {
        let filter = build_env_filter(Some("tubscope=[[["));
        assert!(filter.to_string().contains("russh=warn"));
    }

    #[test]
    fn test_with_file_overrides_detection() {
        let config = LogConfig::detect(PathBuf::from("/nowhere")).with_file(PathBuf::from("/logs"));
        assert_eq!(config.file, LogFile::In(PathBuf::from("/logs")));
    }

    #[test]
    fn test_file_writer_creates_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("logs");
        let (_writer, _guard) = open_file_writer(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn test_unwritable_dir_is_an_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        assert!(open_file_writer(&blocker.join("logs")).is_err());
    }
}
