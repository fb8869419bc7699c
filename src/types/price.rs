use chrono::{DateTime, Utc};
use im::OrdMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Canonical cache key for a symbol: trimmed and lowercased.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_lowercase()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub symbol: String,
    pub id: String,
    pub name: String,
    pub price: f64,
    pub change_24h: f64,
    pub market_cap: f64,
    pub volume_24h: f64,
    pub rank: u32,
}

impl PriceEntry {
    pub fn is_valid(&self) -> bool {
        !self.symbol.is_empty() && self.price.is_finite() && self.price >= 0.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Unchanged,
}

impl Direction {
    pub fn between(previous: f64, current: f64) -> Self {
        match current.partial_cmp(&previous) {
            Some(Ordering::Greater) => Direction::Up,
            Some(Ordering::Less) => Direction::Down,
            _ => Direction::Unchanged,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
            Direction::Unchanged => write!(f, "unchanged"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceChange {
    pub symbol: String,
    pub previous: Option<f64>,
    pub current: f64,
    pub direction: Direction,
}

/// Immutable symbol -> entry table. A new one is built for every successful
/// poll; readers hold an `Arc` to whichever snapshot was current.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PriceSnapshot {
    entries: OrdMap<String, PriceEntry>,
    #[serde(skip)]
    ids: OrdMap<String, String>,
    updated_at: Option<DateTime<Utc>>,
}

impl PriceSnapshot {
    pub fn empty() -> Self {
        PriceSnapshot::default()
    }

    /// Entries failing `PriceEntry::is_valid` never make it into a snapshot.
    pub fn new(entries: impl IntoIterator<Item = PriceEntry>, updated_at: DateTime<Utc>) -> Self {
        let mut table = OrdMap::new();
        let mut ids = OrdMap::new();

        for mut entry in entries {
            entry.symbol = normalize_symbol(&entry.symbol);
            if !entry.is_valid() {
                continue;
            }
            if !entry.id.is_empty() {
                ids.insert(entry.id.to_lowercase(), entry.symbol.clone());
            }
            table.insert(entry.symbol.clone(), entry);
        }

        PriceSnapshot {
            entries: table,
            ids,
            updated_at: Some(updated_at),
        }
    }

    /// Lookup by symbol, falling back to the source id. Case-insensitive.
    pub fn get(&self, key: &str) -> Option<&PriceEntry> {
        let key = normalize_symbol(key);
        self.entries.get(&key).or_else(|| {
            self.ids
                .get(&key)
                .and_then(|symbol| self.entries.get(symbol))
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = &PriceEntry> {
        self.entries.values()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}
