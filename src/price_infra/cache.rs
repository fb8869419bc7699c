use std::sync::Arc;
use tokio::sync::watch;
use crate::observability::metrics::MetricsCollector;
use crate::types::price::{PriceEntry, PriceSnapshot};

/// Authoritative in-process price table.
///
/// The current snapshot lives behind a `watch` channel: readers clone the
/// `Arc` in O(1) and never observe a half-built table, and the poller (the
/// only writer) swaps in the next snapshot with a single `send_replace`.
pub struct PriceCache {
    current: watch::Sender<Arc<PriceSnapshot>>,
    metrics: Arc<MetricsCollector>,
}

impl PriceCache {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        let (current, _) = watch::channel(Arc::new(PriceSnapshot::empty()));
        PriceCache { current, metrics }
    }

    pub fn current_snapshot(&self) -> Arc<PriceSnapshot> {
        self.current.borrow().clone()
    }

    /// Case-insensitive lookup by symbol or source id.
    pub fn get(&self, symbol: &str) -> Option<PriceEntry> {
        let snapshot = self.current_snapshot();
        match snapshot.get(symbol) {
            Some(entry) => {
                self.metrics.record_cache_hit();
                Some(entry.clone())
            }
            None => {
                self.metrics.record_cache_miss();
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.current.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receiver that is notified every time a snapshot is installed.
    pub fn subscribe(&self) -> watch::Receiver<Arc<PriceSnapshot>> {
        self.current.subscribe()
    }

    pub(crate) fn install(&self, snapshot: PriceSnapshot) -> Arc<PriceSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.current.send_replace(snapshot.clone());
        snapshot
    }
}
