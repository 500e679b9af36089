//! Logging for the metricvault binaries
//!
//! Each binary writes its own daily-rolling file under
//! `~/.local/state/metricvault/logs/`, so a long-running collector and an
//! occasional migration never interleave. Events from the main thread are
//! recorded inside a `tool` span naming the binary.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Install the global subscriber for the binary `tool`.
///
/// `RUST_LOG` wins over the configured level. The returned guard flushes
/// pending writes on drop and must live as long as `main`.
pub fn init(config: &LoggingConfig, tool: &str) -> Result<LoggingGuard> {
    let path = Config::log_path(tool);
    let dir = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(Config::state_dir);
    std::fs::create_dir_all(&dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(log_file_name(tool))
        .max_log_files(config.max_files.max(1))
        .build(&dir)
        .map_err(|e| Error::Config(format!("logging: cannot open {}: {}", dir.display(), e)))?;
    let (writer, file_guard) = tracing_appender::non_blocking(appender);

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| Error::Config(format!("logging.level: {}", e)))?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_span_events(FmtSpan::NONE),
        )
        .try_init()
        .map_err(|e| Error::Config(format!("logging: {}", e)))?;

    let span = tracing::info_span!("tool", name = tool, pid = std::process::id()).entered();
    tracing::info!(log = %path.display(), level = %config.level, "Logging initialized");

    Ok(LoggingGuard {
        _span: span,
        _file: file_guard,
    })
}

/// Route logs to the test harness's captured output.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Keeps the file writer and the `tool` span alive
pub struct LoggingGuard {
    _span: tracing::span::EnteredSpan,
    _file: WorkerGuard,
}

pub(crate) fn log_file_name(tool: &str) -> String {
    format!("{}.log", tool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_tool_gets_its_own_file() {
        let migrate = Config::log_path("metricvault-migrate");
        let collector = Config::log_path("metricvault-collector");

        assert_ne!(migrate, collector);
        assert!(migrate.ends_with("logs/metricvault-migrate.log"));
        assert_eq!(migrate.parent(), collector.parent());
    }

    #[test]
    fn test_init_test_is_idempotent() {
        init_test();
        init_test();
        tracing::debug!("still fine");
    }
}
