//! Tracing subscriber setup.

use tracing::Subscriber;
use tracing_subscriber::EnvFilter;

/// Output style of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Builds the filter: `RUST_LOG` when set, otherwise `level` for this crate and warn
/// for everything else.
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,vti_daq={},vti={}", level, level)))
}

/// Builds a subscriber without installing it.
pub fn subscriber(level: &str, format: LogFormat) -> Box<dyn Subscriber + Send + Sync> {
    let builder = tracing_subscriber::fmt().with_env_filter(filter(level));
    match format {
        LogFormat::Pretty => Box::new(builder.with_target(false).finish()),
        LogFormat::Json => Box::new(builder.json().finish()),
    }
}

/// Installs the global subscriber. Calling it twice is harmless.
pub fn init(level: &str, format: LogFormat) {
    if let Err(e) = tracing::subscriber::set_global_default(subscriber(level, format)) {
        tracing::debug!("Tracing subscriber already set: {}", e);
    }
}
