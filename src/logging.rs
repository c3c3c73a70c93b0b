//! Logging setup for the ActivityPro binary.
//!
//! Logs go to stderr as text or JSON lines. When `[logging] dir` is set they
//! are also written to a daily-rotated `activitypro.log` in that directory.
//! `RUST_LOG` overrides the configured level.

use std::io;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, LoggingSection};

/// Log file name prefix inside the configured directory.
pub const LOG_FILE: &str = "activitypro.log";

/// Guard that must be kept alive for the duration of logging.
///
/// Dropping it flushes and closes the file writer, if there is one.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Build the filter: `RUST_LOG` wins, then `--verbose`, then the config.
pub fn build_filter(config: &LoggingSection, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if verbose { "debug" } else { config.level.as_str() };
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the global subscriber.
pub fn init_logging(config: &LoggingSection, verbose: bool) -> Result<LoggingGuard> {
    let filter = build_filter(config, verbose);
    let json = config.format == LogFormat::Json;

    let (file_writer, file_guard) = match config.dir {
        Some(ref dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    // Each optional layer is an `Option<Layer>` so the stack has one type
    // regardless of format and file output.
    let stderr_text = (!json).then(|| tracing_subscriber::fmt::layer().with_writer(io::stderr));
    let stderr_json = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
    });
    let file_text = file_writer.clone().filter(|_| !json).map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
    });
    let file_json = file_writer.filter(|_| json).map(|writer| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_text)
        .with(stderr_json)
        .with(file_text)
        .with(file_json)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_raises_level() {
        // SAFETY: no other test in this crate reads RUST_LOG.
        unsafe { std::env::remove_var("RUST_LOG") };
        let config = LoggingSection::default();
        assert_eq!(build_filter(&config, true).to_string(), "debug");
        assert_eq!(build_filter(&config, false).to_string(), "info");
    }

    #[test]
    fn test_invalid_level_falls_back_to_info() {
        unsafe { std::env::remove_var("RUST_LOG") };
        let config = LoggingSection {
            level: "activitypro=loud".to_string(),
            ..LoggingSection::default()
        };
        assert_eq!(build_filter(&config, false).to_string(), "info");
    }
}
