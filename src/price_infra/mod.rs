pub mod connectors;
pub mod aggregator;
pub mod cache;
pub mod circuit_breaker;
pub mod poller;
pub mod store;

use std::sync::Arc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::types::price::{PriceChange, PriceSnapshot};

/// Entry as received from a price source. Fields stay untyped until the
/// aggregator coerces them, so a single bad field only drops its own entry.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RawPriceEntry {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub symbol: Value,
    #[serde(default)]
    pub name: Value,
    #[serde(default)]
    pub current_price: Value,
    #[serde(default)]
    pub price_change_percentage_24h: Value,
    #[serde(default)]
    pub market_cap: Value,
    #[serde(default)]
    pub total_volume: Value,
    #[serde(default)]
    pub market_cap_rank: Value,
}

/// Emitted by the poller after a snapshot has been installed.
#[derive(Clone, Debug)]
pub enum PriceEvent {
    Updated {
        snapshot: Arc<PriceSnapshot>,
        changes: Arc<Vec<PriceChange>>,
    },
}
