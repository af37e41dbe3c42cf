//! Process-wide tracing setup.
//!
//! Registry code logs through the `log` facade; everything else uses
//! `tracing`. Both end up in the same subscriber.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::ConfigError;

/// Builds the filter: `RUST_LOG` wins, then the configured level.
fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("lingport={},warn", config.level)))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber and bridges `log` records into it.
///
/// Fails if a subscriber or logger is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    let json_layer = config.json.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
    });
    let text_layer = (!config.json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_span_events(FmtSpan::NONE)
            .compact()
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter(config))
        .with(json_layer)
        .with(text_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ConfigError::Logging(e.to_string()))?;
    tracing_log::LogTracer::init().map_err(|e| ConfigError::Logging(e.to_string()))?;

    Ok(())
}
