use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use crate::price_infra::RawPriceEntry;
use crate::types::price::{normalize_symbol, Direction, PriceChange, PriceEntry, PriceSnapshot};
use crate::utils::helper::{coerce_f64, coerce_string, coerce_u32};

pub struct AggregationResult {
    pub snapshot: PriceSnapshot,
    pub changes: Vec<PriceChange>,
    /// Fresh entries that passed normalization
    pub accepted: usize,
    pub rejected: usize,
    /// Previous values kept for symbols whose new entry was rejected
    pub carried_forward: usize,
}

/// Turns a raw fetch result into the next snapshot.
pub struct PriceAggregator;

impl PriceAggregator {
    pub fn new() -> Self {
        PriceAggregator
    }

    pub fn normalize(&self, raw: &RawPriceEntry) -> Option<PriceEntry> {
        let symbol = coerce_string(&raw.symbol)
            .or_else(|| coerce_string(&raw.id))
            .map(|s| normalize_symbol(&s))?;

        let price = coerce_f64(&raw.current_price)?;
        if price < 0.0 {
            return None;
        }

        let id = coerce_string(&raw.id).unwrap_or_else(|| symbol.clone());
        let name = coerce_string(&raw.name).unwrap_or_else(|| id.clone());

        Some(PriceEntry {
            symbol,
            id,
            name,
            price,
            change_24h: coerce_f64(&raw.price_change_percentage_24h).unwrap_or(0.0),
            market_cap: coerce_f64(&raw.market_cap).unwrap_or(0.0).max(0.0),
            volume_24h: coerce_f64(&raw.total_volume).unwrap_or(0.0).max(0.0),
            rank: coerce_u32(&raw.market_cap_rank).unwrap_or(0),
        })
    }

    pub fn aggregate(
        &self,
        previous: &PriceSnapshot,
        raw_entries: Vec<RawPriceEntry>,
        now: DateTime<Utc>,
    ) -> AggregationResult {
        let mut fresh: BTreeMap<String, PriceEntry> = BTreeMap::new();
        let mut rejected_symbols = Vec::new();
        let mut rejected = 0;

        for raw in &raw_entries {
            match self.normalize(raw) {
                Some(entry) => {
                    fresh.entry(entry.symbol.clone()).or_insert(entry);
                }
                None => {
                    rejected += 1;
                    if let Some(symbol) = coerce_string(&raw.symbol).or_else(|| coerce_string(&raw.id)) {
                        rejected_symbols.push(normalize_symbol(&symbol));
                    }
                }
            }
        }

        let accepted = fresh.len();

        let changes: Vec<PriceChange> = fresh.values()
            .map(|entry| {
                let prior = previous.get(&entry.symbol).map(|p| p.price);
                PriceChange {
                    symbol: entry.symbol.clone(),
                    previous: prior,
                    current: entry.price,
                    direction: prior
                        .map(|p| Direction::between(p, entry.price))
                        .unwrap_or(Direction::Unchanged),
                }
            })
            .collect();

        let mut carried_forward = 0;
        for symbol in rejected_symbols {
            if fresh.contains_key(&symbol) {
                continue;
            }
            if let Some(prior) = previous.get(&symbol) {
                fresh.insert(prior.symbol.clone(), prior.clone());
                carried_forward += 1;
            }
        }

        // Snapshot time never moves backwards, even if the wall clock does
        let updated_at = match previous.updated_at() {
            Some(prev) if prev > now => prev,
            _ => now,
        };

        AggregationResult {
            snapshot: PriceSnapshot::new(fresh.into_values(), updated_at),
            changes,
            accepted,
            rejected,
            carried_forward,
        }
    }
}

impl Default for PriceAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn raw(symbol: Value, id: &str, price: Value) -> RawPriceEntry {
        RawPriceEntry {
            id: json!(id),
            symbol,
            name: json!(id),
            current_price: price,
            price_change_percentage_24h: json!(1.25),
            market_cap: json!("1000"),
            total_volume: json!(50),
            market_cap_rank: json!(1),
        }
    }

    #[test]
    fn test_normalize_coerces_fields() {
        let aggregator = PriceAggregator::new();
        let entry = aggregator.normalize(&raw(json!(" BTC "), "bitcoin", json!("65000.5"))).unwrap();

        assert_eq!(entry.symbol, "btc");
        assert_eq!(entry.id, "bitcoin");
        assert_eq!(entry.price, 65000.5);
        assert_eq!(entry.change_24h, 1.25);
        assert_eq!(entry.market_cap, 1000.0);
        assert_eq!(entry.rank, 1);
    }

    #[test]
    fn test_invalid_entries_are_dropped_silently() {
        let aggregator = PriceAggregator::new();
        let result = aggregator.aggregate(
            &PriceSnapshot::empty(),
            vec![
                raw(json!("btc"), "bitcoin", json!(65000.0)),
                raw(json!("eth"), "ethereum", json!("not a number")),
                raw(json!("sol"), "solana", json!(-3.0)),
                raw(json!(null), "", json!(1.0)),
            ],
            Utc::now(),
        );

        assert_eq!(result.accepted, 1);
        assert_eq!(result.rejected, 3);
        assert_eq!(result.snapshot.len(), 1);
        assert!(result.snapshot.get("btc").is_some());
    }

    #[test]
    fn test_directions_against_previous_snapshot() {
        let aggregator = PriceAggregator::new();
        let first = aggregator.aggregate(
            &PriceSnapshot::empty(),
            vec![
                raw(json!("btc"), "bitcoin", json!(100.0)),
                raw(json!("eth"), "ethereum", json!(50.0)),
                raw(json!("sol"), "solana", json!(10.0)),
            ],
            Utc::now(),
        );
        let second = aggregator.aggregate(
            &first.snapshot,
            vec![
                raw(json!("btc"), "bitcoin", json!(101.0)),
                raw(json!("eth"), "ethereum", json!(49.0)),
                raw(json!("sol"), "solana", json!(10.0)),
                raw(json!("ada"), "cardano", json!(0.5)),
            ],
            Utc::now(),
        );

        let direction = |symbol: &str| {
            second.changes.iter().find(|c| c.symbol == symbol).map(|c| c.direction)
        };
        assert_eq!(direction("btc"), Some(Direction::Up));
        assert_eq!(direction("eth"), Some(Direction::Down));
        assert_eq!(direction("sol"), Some(Direction::Unchanged));
        assert_eq!(direction("ada"), Some(Direction::Unchanged));
        let ada = second.changes.iter().find(|c| c.symbol == "ada").unwrap();
        assert_eq!(ada.previous, None);
    }

    #[test]
    fn test_rejected_symbol_keeps_prior_value() {
        let aggregator = PriceAggregator::new();
        let first = aggregator.aggregate(
            &PriceSnapshot::empty(),
            vec![
                raw(json!("btc"), "bitcoin", json!(100.0)),
                raw(json!("eth"), "ethereum", json!(50.0)),
            ],
            Utc::now(),
        );
        let second = aggregator.aggregate(
            &first.snapshot,
            vec![
                raw(json!("btc"), "bitcoin", json!(105.0)),
                raw(json!("eth"), "ethereum", json!("NaN")),
            ],
            Utc::now(),
        );

        assert_eq!(second.carried_forward, 1);
        assert_eq!(second.snapshot.get("eth").map(|e| e.price), Some(50.0));
        assert_eq!(second.snapshot.get("btc").map(|e| e.price), Some(105.0));
        assert!(second.changes.iter().all(|c| c.symbol != "eth"));
    }

    #[test]
    fn test_timestamp_never_moves_backwards() {
        let aggregator = PriceAggregator::new();
        let now = Utc::now();
        let first = aggregator.aggregate(
            &PriceSnapshot::empty(),
            vec![raw(json!("btc"), "bitcoin", json!(100.0))],
            now,
        );
        let second = aggregator.aggregate(
            &first.snapshot,
            vec![raw(json!("btc"), "bitcoin", json!(101.0))],
            now - ChronoDuration::seconds(30),
        );

        assert_eq!(second.snapshot.updated_at(), Some(now));
    }

    proptest! {
        #[test]
        fn prop_direction_matches_price_delta(old in 0.0f64..1e7, new in 0.0f64..1e7) {
            let aggregator = PriceAggregator::new();
            let first = aggregator.aggregate(
                &PriceSnapshot::empty(),
                vec![raw(json!("btc"), "bitcoin", json!(old))],
                Utc::now(),
            );
            let second = aggregator.aggregate(
                &first.snapshot,
                vec![raw(json!("btc"), "bitcoin", json!(new))],
                Utc::now(),
            );

            let expected = if new > old {
                Direction::Up
            } else if new < old {
                Direction::Down
            } else {
                Direction::Unchanged
            };
            prop_assert_eq!(second.changes[0].direction, expected);
        }

        #[test]
        fn prop_snapshot_never_holds_negative_prices(prices in proptest::collection::vec(-1e6f64..1e6, 1..20)) {
            let aggregator = PriceAggregator::new();
            let raw_entries = prices.iter().enumerate()
                .map(|(i, p)| raw(json!(format!("s{}", i)), &format!("coin{}", i), json!(p)))
                .collect();
            let result = aggregator.aggregate(&PriceSnapshot::empty(), raw_entries, Utc::now());

            prop_assert!(result.snapshot.entries().all(|e| e.price >= 0.0 && e.price.is_finite()));
            prop_assert_eq!(result.accepted + result.rejected, prices.len());
        }
    }
}
