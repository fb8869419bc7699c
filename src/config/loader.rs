use crate::config::*;
use crate::error::{Error, Result};
use config::{Config, ConfigBuilder, Environment, File, builder::DefaultState};
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "PRICE_RELAY";

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub poller: PollerConfig,
    pub source: SourceConfig,
    pub breaker: BreakerConfig,
    pub connections: ConnectionConfig,
    pub broadcast: BroadcastConfig,
    pub metrics: MetricsConfig,
    pub cache: CacheConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Layers `config/default`, `config/<env>` and `PRICE_RELAY_*` variables.
    pub fn load(env: &str) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("source.symbols"),
            );

        Self::from_builder(builder)
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poller.update_interval_secs == 0 {
            return Err(Error::ConfigError("poller.update_interval_secs must be > 0".into()));
        }
        if self.poller.max_consecutive_errors == 0 {
            return Err(Error::ConfigError("poller.max_consecutive_errors must be > 0".into()));
        }
        if self.poller.max_backoff_multiplier == 0 {
            return Err(Error::ConfigError("poller.max_backoff_multiplier must be >= 1".into()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::ConfigError("breaker.failure_threshold must be > 0".into()));
        }
        if self.breaker.half_open_max_probes == 0 {
            return Err(Error::ConfigError("breaker.half_open_max_probes must be > 0".into()));
        }
        if self.connections.max_connections == 0 {
            return Err(Error::ConfigError("connections.max_connections must be > 0".into()));
        }
        if self.connections.outbound_buffer == 0 {
            return Err(Error::ConfigError("connections.outbound_buffer must be > 0".into()));
        }
        // tokio intervals panic on a zero period
        if self.connections.ping_interval_secs == 0
            || self.connections.prune_interval_secs == 0
            || self.broadcast.status_interval_secs == 0
        {
            return Err(Error::ConfigError(
                "ping, prune and status intervals must be > 0".into(),
            ));
        }
        if self.cache.write_timeout_ms == 0 {
            return Err(Error::ConfigError("cache.write_timeout_ms must be > 0".into()));
        }
        if self.source.symbols.is_empty() {
            return Err(Error::ConfigError("source.symbols must not be empty".into()));
        }
        Ok(())
    }
}
