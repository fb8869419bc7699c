pub mod coingecko;
pub mod synthetic;

use std::sync::Arc;
use async_trait::async_trait;
use crate::config::SourceConfig;
use crate::error::Result;
use crate::observability::metrics::MetricsCollector;
use crate::price_infra::RawPriceEntry;
use crate::price_infra::connectors::coingecko::CoinGeckoSource;
use crate::price_infra::connectors::synthetic::SyntheticPriceSource;
use crate::utils::clock::Clock;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Fetch the latest entries for the given upstream ids. Recoverable
    /// upstream problems yield `Ok(vec![])` rather than an error.
    async fn fetch(&self, symbols: &[String]) -> Result<Vec<RawPriceEntry>>;
    fn source_id(&self) -> &str;
}

pub fn build_price_source(
    config: &SourceConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
) -> Result<Arc<dyn PriceSource>> {
    if config.use_mock_prices {
        tracing::info!("Using synthetic price source (use_mock_prices = true)");
        return Ok(Arc::new(SyntheticPriceSource::new(config.mock_seed)));
    }
    Ok(Arc::new(CoinGeckoSource::new(config, clock, metrics)?))
}
