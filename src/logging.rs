//! Tracing setup: compact console output plus optional rotated log files.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Installs the global subscriber. Returns the file writer guard, which must
/// stay alive for the process lifetime when file output is enabled.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.filter.clone()));

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    if config.directory.is_empty() {
        tracing_subscriber::registry().with(filter).with(console).init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(&config.directory, "rec-lem-api.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer);
    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    Some(guard)
}
