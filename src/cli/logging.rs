//! Tracing setup for the CLI

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Application log file prefix; the appender adds the date
pub const LOG_FILE_PREFIX: &str = "devbench.log";

/// Install the global subscriber
///
/// `RUST_LOG` wins over `level`; `verbose` raises the default to DEBUG.
/// With `file_dir`, a daily-rolling file gets the same events; keep the
/// returned guard alive until exit so buffered lines are flushed.
pub fn init_tracing(level: &str, verbose: bool, file_dir: Option<&Path>) -> Option<WorkerGuard> {
    let default = if verbose { "debug" } else { level };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let console = fmt::layer().with_writer(std::io::stderr).with_filter(filter());

    match file_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(filter());
            let _ = tracing_subscriber::registry().with(console).with(file).try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry().with(console).try_init();
            None
        }
    }
}
