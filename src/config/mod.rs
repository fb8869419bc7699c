use std::time::Duration;
use serde::{Deserialize, Serialize};

pub mod loader;

pub use loader::AppConfig;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PollerConfig {
    pub update_interval_secs: u64,
    pub max_consecutive_errors: u32,
    pub error_cooldown_secs: u64,
    pub max_backoff_multiplier: u32,
    pub fetch_timeout_secs: u64,
}

impl PollerConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            update_interval_secs: 15,
            max_consecutive_errors: 5,
            error_cooldown_secs: 60,
            max_backoff_multiplier: 8,
            fetch_timeout_secs: 15,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub vs_currency: String,
    /// Upstream coin ids, e.g. "bitcoin"
    pub symbols: Vec<String>,
    pub min_api_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub use_mock_prices: bool,
    pub mock_seed: u64,
}

impl SourceConfig {
    pub fn min_api_interval(&self) -> Duration {
        Duration::from_secs(self.min_api_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            vs_currency: "usd".to_string(),
            symbols: [
                "bitcoin", "ethereum", "tether", "binancecoin", "solana",
                "ripple", "usd-coin", "cardano", "dogecoin", "tron",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            min_api_interval_secs: 5,
            request_timeout_secs: 10,
            use_mock_prices: false,
            mock_seed: 42,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub half_open_max_probes: u32,
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            half_open_max_probes: 3,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_connections: usize,
    pub heartbeat_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub prune_interval_secs: u64,
    pub max_messages_per_second: usize,
    pub max_violations: usize,
    pub violation_window_secs: u64,
    pub outbound_buffer: usize,
}

impl ConnectionConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    pub fn violation_window(&self) -> Duration {
        Duration::from_secs(self.violation_window_secs)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            max_connections: 1000,
            heartbeat_timeout_secs: 60,
            ping_interval_secs: 25,
            prune_interval_secs: 15,
            max_messages_per_second: 10,
            max_violations: 500,
            violation_window_secs: 60,
            outbound_buffer: 256,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub send_timeout_ms: u64,
    pub status_interval_secs: u64,
}

impl BroadcastConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        BroadcastConfig {
            send_timeout_ms: 2_000,
            status_interval_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub window_secs: u64,
}

impl MetricsConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig { window_secs: 3600 }  // 1 hour
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub redis_url: String,
    pub ttl_secs: u64,
    pub write_timeout_ms: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Bound on a single store read or write.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            backend: CacheBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            ttl_secs: 60,
            write_timeout_ms: 2000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            shutdown_grace_secs: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
