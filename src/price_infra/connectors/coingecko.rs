use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use crate::config::SourceConfig;
use crate::error::{Error, Result};
use crate::observability::metrics::MetricsCollector;
use crate::price_infra::RawPriceEntry;
use crate::price_infra::connectors::PriceSource;
use crate::price_infra::connectors::synthetic::SyntheticPriceSource;
use crate::utils::clock::Clock;
use crate::utils::helper::{coerce_f64, coerce_string};

/// `/coins/markets` client for the CoinGecko REST API.
///
/// Calls are spaced at least `min_api_interval` apart; concurrent callers
/// queue on the same lock. When the host cannot be reached at all the source
/// serves a synthetic walk seeded from the last real prices until the API
/// answers again.
pub struct CoinGeckoSource {
    client: reqwest::Client,
    markets_url: String,
    vs_currency: String,
    min_interval: Duration,
    request_timeout: Duration,
    last_call: Mutex<Option<Instant>>,
    fallback: SyntheticPriceSource,
    using_fallback: AtomicBool,
    outages: AtomicU64,
    error_count: AtomicU64,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
}

impl CoinGeckoSource {
    pub fn new(
        config: &SourceConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("price-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::ConfigError(format!("HTTP client: {}", e)))?;

        Ok(CoinGeckoSource {
            client,
            markets_url: format!("{}/coins/markets", config.base_url.trim_end_matches('/')),
            vs_currency: config.vs_currency.clone(),
            min_interval: config.min_api_interval(),
            request_timeout: config.request_timeout(),
            last_call: Mutex::new(None),
            fallback: SyntheticPriceSource::new(config.mock_seed),
            using_fallback: AtomicBool::new(false),
            outages: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            clock,
            metrics,
        })
    }

    /// Upstream failures that produced an empty result.
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn is_using_fallback(&self) -> bool {
        self.using_fallback.load(Ordering::Relaxed)
    }

    /// Times the source switched to the synthetic fallback.
    pub fn outages(&self) -> u64 {
        self.outages.load(Ordering::Relaxed)
    }

    fn serve_fallback(&self, symbols: &[String], cause: &reqwest::Error) -> Vec<RawPriceEntry> {
        if !self.using_fallback.swap(true, Ordering::Relaxed) {
            self.outages.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %cause, "Price API unreachable, serving synthetic prices");
        }
        self.fallback.tick(symbols)
    }

    fn give_up(&self, err: Error) -> Vec<RawPriceEntry> {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_error(err.kind(), &err.to_string());
        tracing::warn!(kind = err.kind(), "Price API request failed: {}", err);
        Vec::new()
    }

    fn parse_entries(&self, body: Value) -> Result<Vec<RawPriceEntry>> {
        let Value::Array(items) = body else {
            return Err(Error::MalformedPayload("expected a JSON array".into()));
        };
        let total = items.len();
        let entries: Vec<RawPriceEntry> = items.into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect();
        if entries.len() < total {
            tracing::debug!("Skipped {} unparseable market entries", total - entries.len());
        }
        Ok(entries)
    }

    fn remember(&self, entries: &[RawPriceEntry]) {
        for entry in entries {
            if let (Some(id), Some(price)) = (coerce_string(&entry.id), coerce_f64(&entry.current_price)) {
                let change = coerce_f64(&entry.price_change_percentage_24h).unwrap_or(0.0);
                self.fallback.anchor(&id, price, change);
            }
        }
    }
}

#[async_trait]
impl PriceSource for CoinGeckoSource {
    async fn fetch(&self, symbols: &[String]) -> Result<Vec<RawPriceEntry>> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }

        let mut last_call = self.last_call.lock().await;
        if let Some(at) = *last_call {
            let elapsed = self.clock.now().saturating_duration_since(at);
            if elapsed < self.min_interval {
                self.clock.sleep(self.min_interval - elapsed).await;
            }
        }
        *last_call = Some(self.clock.now());

        let ids = symbols.join(",");
        let per_page = symbols.len().to_string();
        let sent = self.client
            .get(&self.markets_url)
            .query(&[
                ("vs_currency", self.vs_currency.as_str()),
                ("ids", ids.as_str()),
                ("order", "market_cap_desc"),
                ("per_page", per_page.as_str()),
                ("page", "1"),
                ("sparkline", "false"),
                ("price_change_percentage", "24h"),
            ])
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(e) if e.is_connect() => return Ok(self.serve_fallback(symbols, &e)),
            Err(e) if e.is_timeout() => return Ok(self.give_up(Error::FetchTimeout(self.request_timeout))),
            Err(e) => return Ok(self.give_up(e.into())),
        };

        if self.using_fallback.swap(false, Ordering::Relaxed) {
            tracing::info!("Price API reachable again, leaving synthetic fallback");
        }

        let status = response.status();
        if !status.is_success() {
            return Ok(self.give_up(Error::UpstreamStatus { status: status.as_u16() }));
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => return Ok(self.give_up(Error::FetchTimeout(self.request_timeout))),
            Err(e) => return Ok(self.give_up(Error::MalformedPayload(e.to_string()))),
        };

        match self.parse_entries(body) {
            Ok(entries) => {
                self.remember(&entries);
                Ok(entries)
            }
            Err(e) => Ok(self.give_up(e)),
        }
    }

    fn source_id(&self) -> &str {
        "coingecko"
    }
}
