//! Installs Android packages over adb, picking the splits a device needs and falling back
//! through safer install strategies when the package manager refuses.

use std::path::Path;

use anyhow::{Context, Result};
use time::macros::format_description;
use tracing::Level;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, fmt, fmt::time::LocalTime, layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub mod adb;
pub mod bundletool;
pub mod confirm;
pub mod error;
pub mod installer;
pub mod manifest;
pub mod package;
pub mod settings;
pub mod splits;
pub mod staging;
pub mod utils;

/// Human-readable stderr output plus a daily rotated debug log under `<work_dir>/logs`.
///
/// `RUST_LOG` overrides the stderr level. Keep the guard alive until exit to flush the file log.
pub fn setup_logging(work_dir: &Path, debug: bool) -> Result<WorkerGuard> {
    let logs_dir = work_dir.join("logs");
    fs_err::create_dir_all(&logs_dir).context("Failed to create logs directory")?;
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(10)
        .filename_prefix("xapk-installer")
        .filename_suffix("log")
        .build(&logs_dir)
        .context("Failed to initialize file appender")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let timer = LocalTime::new(format_description!("[hour]:[minute]:[second]"));
    let stderr_level = if debug { Level::DEBUG } else { Level::INFO };
    let stderr_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(stderr_level).into())
        .from_env_lossy();

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_timer(timer.clone())
        .with_filter(stderr_filter);
    let file_layer = fmt::layer()
        .with_ansi(false) // Disable ANSI colors
        .with_timer(timer)
        .with_writer(non_blocking)
        .with_filter(LevelFilter::DEBUG);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to set global subscriber")?;
    Ok(guard)
}
