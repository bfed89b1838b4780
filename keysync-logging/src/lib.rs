//! Structured logging setup for keysync services

use keysync_config::LogFormat;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

/// Build the level filter; `RUST_LOG` wins over the configured level
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging for a keysync process
///
/// - `Json`: one JSON object per line, with file and line numbers (production)
/// - `Console`: human-readable lines (development)
///
/// Every line emitted afterwards can be correlated to `node_id` through the
/// startup record.
pub fn init_logging(
    service_name: &str,
    node_id: &str,
    default_level: &str,
    format: LogFormat,
) -> Result<(), TryInitError> {
    let registry = tracing_subscriber::registry().with(env_filter(default_level));

    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .try_init()?,
        LogFormat::Console => registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .try_init()?,
    }

    tracing::info!(
        service = service_name,
        node_id = node_id,
        format = ?format,
        "Logging initialized"
    );

    Ok(())
}
