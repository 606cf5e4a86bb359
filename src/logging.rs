//! Tracing subscriber setup.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::{LogFormat, LoggingSection};

/// Environment variable holding a filter directive that overrides the config.
pub const LOG_ENV: &str = "LEADFLOW_LOG";

/// Build the filter: `LEADFLOW_LOG` if set, else `debug` when verbose, else
/// the configured level.
pub fn env_filter(logging: &LoggingSection, verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { logging.level.as_str() };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Initialize tracing for the process.
///
/// Returns the file writer's guard when `[logging] directory` is set; keep it
/// alive until exit so buffered lines are flushed.
pub fn init_tracing(logging: &LoggingSection, verbose: bool) -> Option<WorkerGuard> {
    let stderr_layer = match logging.format {
        LogFormat::Pretty => fmt::layer().with_writer(std::io::stderr).boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    };

    let (file_layer, guard) = match &logging.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "leadflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(env_filter(logging, verbose))
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    if let Err(e) = result {
        eprintln!("Failed to initialize tracing: {}", e);
    }

    guard
}
