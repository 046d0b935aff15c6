use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogFormat;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,hitl_relay=debug";

/// Initialize structured logging.
///
/// - `tracing-subscriber::fmt`, compact or JSON per `format`.
/// - `EnvFilter` for dynamic log levels (`RUST_LOG`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(format: LogFormat) {
    init_with(format, DEFAULT_FILTER);
}

/// Like [`init`] with a different fallback filter.
pub fn init_with(format: LogFormat, default_filter: &str) {
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(filter_layer);
    let result = match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .compact(),
            )
            .try_init(),
    };

    if let Err(err) = result {
        tracing::debug!(error = %err, "tracing subscriber already installed");
    }
}
