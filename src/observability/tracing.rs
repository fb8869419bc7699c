use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use crate::config::{LogFormat, LoggingConfig};
use crate::types::ids::ConnectionId;

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Json => registry.with(fmt::layer().json().with_current_span(true)).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
    };

    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {}", e);
    }
}

pub fn trace_poll_cycle(cycle: u64) -> Span {
    tracing::info_span!(
        "poll_cycle",
        cycle = cycle,
    )
}

pub fn trace_connection(connection_id: &ConnectionId) -> Span {
    tracing::info_span!(
        "ws_connection",
        connection_id = %connection_id,
    )
}
