use std::time::Duration;
use thiserror::Error;
use crate::types::ids::ConnectionId;

#[derive(Error, Debug)]
pub enum Error {
    // Upstream / price source errors
    #[error("Circuit breaker '{name}' open, retry after {retry_after:?}")]
    CircuitOpen {
        name: String,
        retry_after: Duration,
    },

    #[error("Upstream returned status {status}")]
    UpstreamStatus { status: u16 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Fetch timed out after {0:?}")]
    FetchTimeout(Duration),

    #[error("Empty payload")]
    EmptyPayload,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    // Connection errors
    #[error("Connection capacity exceeded: max {max}")]
    CapacityExceeded { max: usize },

    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Send timed out")]
    SendTimeout,

    #[error("Channel closed")]
    ChannelClosed,

    // Store errors
    #[error("Price store error: {0}")]
    Store(String),

    // System errors
    #[error("Already running")]
    AlreadyRunning,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Task error: {0}")]
    TaskError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Stable label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::CircuitOpen { .. } => "circuit_open",
            Error::UpstreamStatus { .. } => "upstream_status",
            Error::Network(_) => "network",
            Error::FetchTimeout(_) => "timeout",
            Error::EmptyPayload => "empty_payload",
            Error::MalformedPayload(_) => "malformed_payload",
            Error::CapacityExceeded { .. } => "capacity_exceeded",
            Error::ConnectionNotFound(_) => "connection_not_found",
            Error::RateLimitExceeded => "rate_limited",
            Error::SendTimeout => "send_timeout",
            Error::ChannelClosed => "channel_closed",
            Error::Store(_) => "store",
            Error::AlreadyRunning => "already_running",
            Error::ConfigError(_) => "config",
            Error::TaskError(_) => "task",
            Error::SerializationError(_) => "serialization",
            Error::MetricsError(_) => "metrics",
            Error::IoError(_) => "io",
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            Error::UpstreamStatus { status: status.as_u16() }
        } else {
            Error::Network(e.to_string())
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::ConfigError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
