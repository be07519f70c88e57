//! Console plus daily-rotated file logging for the binaries.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{HealerError, Result};

/// Default filter: `RUST_LOG` wins, otherwise `info` (or `debug` when verbose).
fn filter(verbose: bool) -> EnvFilter {
    let fallback = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global subscriber for `component`.
///
/// Files are written to `<log_dir>/<component>.log.<date>`. The returned guard
/// flushes the file writer on drop and must be kept alive by `main`.
pub fn init(component: &str, log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir).map_err(|e| HealerError::io(log_dir, e))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(format!("{component}.log"))
        .build(log_dir)
        .map_err(|e| HealerError::Process(format!("log appender for {}: {e}", log_dir.display())))?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter(verbose))
        .with(fmt::layer().with_target(false))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .map_err(|e| HealerError::Process(format!("logging already initialised: {e}")))?;
    Ok(guard)
}

/// Console-only logging for commands that run before paths are known.
pub fn init_console(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .with_target(false)
        .try_init();
}
