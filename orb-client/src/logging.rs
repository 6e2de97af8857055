//! Logging Infrastructure
//!
//! Console (pretty or JSON) plus optional daily rotating files. The fallback
//! variant also forwards events to a [`FallbackLogger`] so they reach the
//! remote log collector.

use std::fs;
use std::path::Path;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

use crate::logger::FallbackLogger;

/// Rotated application log files kept on disk
const MAX_LOG_FILES: usize = 14;

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn file_appender(dir: &str) -> anyhow::Result<RollingFileAppender> {
    let log_dir = Path::new(dir);
    fs::create_dir_all(log_dir)?;
    Ok(RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("orb-client")
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(log_dir)?)
}

/// Initialize console logging, plus daily rotating files under `log_dir`.
///
/// # Examples
/// ```no_run
/// // Development setup (console only)
/// orb_client::logging::init_logger_with_file("debug", false, None)?;
///
/// // Production setup (console + file)
/// orb_client::logging::init_logger_with_file("info", true, Some("./work_dir/logs"))?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn init_logger_with_file(level: &str, json_format: bool, log_dir: Option<&str>) -> anyhow::Result<()> {
    let console_layer = if json_format {
        fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    let file_layer = match log_dir {
        Some(dir) => Some(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file_appender(dir)?)),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(console_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

/// Console only
pub fn init_logger(level: &str, json_format: bool) -> anyhow::Result<()> {
    init_logger_with_file(level, json_format, None)
}

/// Console logging plus forwarding of events at `forward_level` or above to
/// `logger`. The logger must be started separately.
pub fn init_logger_with_fallback(
    level: &str,
    logger: &FallbackLogger,
    forward_level: Level,
) -> anyhow::Result<()> {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(console_layer)
        .with(logger.layer().with_min_level(forward_level))
        .try_init()?;
    Ok(())
}
