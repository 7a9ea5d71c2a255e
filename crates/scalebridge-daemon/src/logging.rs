//! Diagnostics for the daemon.
//!
//! Stdout carries the JSON event stream, so nothing here ever writes to it.
//! Interactive runs get readable stderr output; `--production` adds daily
//! JSON files for later inspection.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Fallback filter consulted when `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV: &str = "SCALEBRIDGE_LOG_LEVEL";

const DEFAULT_FILTER: &str = "info";
const LOG_FILE_PREFIX: &str = "scalebridge";

/// Flushes the non-blocking writers on exit.
static GUARDS: OnceLock<Vec<WorkerGuard>> = OnceLock::new();

/// Where log output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Pretty stderr with span open/close events.
    Interactive,
    /// Compact stderr for the journal plus rolling JSON files.
    Service,
}

impl LogMode {
    /// `--production` selects [`LogMode::Service`].
    #[must_use]
    pub const fn from_production_flag(production: bool) -> Self {
        if production {
            Self::Service
        } else {
            Self::Interactive
        }
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the filter directive does not parse.
pub fn init(mode: LogMode) -> anyhow::Result<()> {
    let filter = filter_from_env()?;
    match mode {
        LogMode::Interactive => init_interactive(filter),
        LogMode::Service => init_service(filter),
    }
    Ok(())
}

fn filter_from_env() -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| DEFAULT_FILTER.to_string());
    Ok(EnvFilter::try_new(directive)?)
}

fn init_interactive(filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE),
        )
        .init();
}

fn init_service(filter: EnvFilter) {
    let dir = log_directory();
    if let Err(error) = std::fs::create_dir_all(&dir) {
        eprintln!("cannot create log directory {}: {error}", dir.display());
    }

    let (files, file_guard) =
        tracing_appender::non_blocking(RollingFileAppender::new(Rotation::DAILY, &dir, LOG_FILE_PREFIX));
    let (stderr, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(files)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(stderr)
                .with_ansi(false),
        )
        .init();

    let _ = GUARDS.set(vec![file_guard, stderr_guard]);
}

/// `/var/log/scalebridge` on Linux, the per-user data directory elsewhere.
fn log_directory() -> PathBuf {
    if cfg!(target_os = "linux") {
        return PathBuf::from("/var/log/scalebridge");
    }
    directories::ProjectDirs::from("", "", "scalebridge")
        .map_or_else(|| PathBuf::from("logs"), |dirs| dirs.data_dir().join("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_flag_selects_service_mode() {
        assert_eq!(LogMode::from_production_flag(true), LogMode::Service);
        assert_eq!(LogMode::from_production_flag(false), LogMode::Interactive);
    }

    #[test]
    fn test_log_directory_is_named_for_the_daemon() {
        let dir = log_directory();
        assert!(dir.to_string_lossy().contains("scalebridge") || dir.ends_with("logs"));
    }
}
