use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use crate::config::PollerConfig;
use crate::error::{Error, Result};
use crate::observability::metrics::MetricsCollector;
use crate::observability::tracing::trace_poll_cycle;
use crate::price_infra::aggregator::PriceAggregator;
use crate::price_infra::cache::PriceCache;
use crate::price_infra::circuit_breaker::CircuitBreaker;
use crate::price_infra::connectors::PriceSource;
use crate::price_infra::store::{price_key, PriceStore};
use crate::price_infra::{PriceEvent, RawPriceEntry};
use crate::types::price::PriceSnapshot;
use crate::utils::clock::Clock;

const EVENT_BUFFER: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Updated { symbols: usize },
    Failed { kind: &'static str },
    Cancelled,
}

#[derive(Clone, Debug, Serialize)]
pub struct PollerStats {
    pub running: bool,
    pub cycles: u64,
    pub successful_cycles: u64,
    pub consecutive_errors: u32,
    pub backoff_multiplier: u32,
    pub next_delay_ms: u64,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct PollState {
    consecutive_errors: u32,
    backoff_multiplier: u32,
    cycles: u64,
    successful_cycles: u64,
    last_update: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl PollState {
    fn reset(&mut self) {
        self.consecutive_errors = 0;
        self.backoff_multiplier = 1;
    }
}

struct StoreTarget {
    store: Arc<dyn PriceStore>,
    ttl: Duration,
    timeout: Duration,
}

/// Periodic fetch loop that owns the write side of the price cache.
///
/// Each cycle fetches through the circuit breaker, aggregates against the
/// current snapshot and installs the result. Failures never touch the cache;
/// they grow the retry delay and eventually put the loop into a cooldown.
pub struct PricePoller {
    source: Arc<dyn PriceSource>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<PriceCache>,
    store: Option<StoreTarget>,
    metrics: Arc<MetricsCollector>,
    aggregator: PriceAggregator,
    config: PollerConfig,
    symbols: Vec<String>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<PriceEvent>,
    state: Mutex<PollState>,
    running: AtomicBool,
}

impl PricePoller {
    pub fn new(
        source: Arc<dyn PriceSource>,
        breaker: Arc<CircuitBreaker>,
        cache: Arc<PriceCache>,
        metrics: Arc<MetricsCollector>,
        config: PollerConfig,
        symbols: Vec<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        PricePoller {
            source,
            breaker,
            cache,
            store: None,
            metrics,
            aggregator: PriceAggregator::new(),
            config,
            symbols,
            clock,
            events,
            state: Mutex::new(PollState {
                consecutive_errors: 0,
                backoff_multiplier: 1,
                cycles: 0,
                successful_cycles: 0,
                last_update: None,
                last_error: None,
            }),
            running: AtomicBool::new(false),
        }
    }

    /// Write every installed snapshot through to `store` with `ttl`. Each
    /// write is abandoned after `timeout` so a stalled backend cannot hold
    /// up the next cycle.
    pub fn with_store(mut self, store: Arc<dyn PriceStore>, ttl: Duration, timeout: Duration) -> Self {
        self.store = Some(StoreTarget { store, ttl, timeout });
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PriceEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.state.lock().consecutive_errors
    }

    /// Delay before the next cycle: `update_interval * backoff_multiplier`.
    pub fn next_delay(&self) -> Duration {
        self.config.update_interval() * self.state.lock().backoff_multiplier
    }

    pub fn stats(&self) -> PollerStats {
        let next_delay_ms = self.next_delay().as_millis() as u64;
        let state = self.state.lock();
        PollerStats {
            running: self.is_running(),
            cycles: state.cycles,
            successful_cycles: state.successful_cycles,
            consecutive_errors: state.consecutive_errors,
            backoff_multiplier: state.backoff_multiplier,
            next_delay_ms,
            last_update: state.last_update,
            last_error: state.last_error.clone(),
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Price poller already running, ignoring second start");
            return;
        }
        tracing::info!(
            symbols = self.symbols.len(),
            interval = ?self.config.update_interval(),
            "Price poller started"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if self.in_cooldown() {
                let cooldown = self.config.error_cooldown();
                tracing::warn!(
                    "Price poller hit {} consecutive errors, cooling down for {:?}",
                    self.config.max_consecutive_errors, cooldown
                );
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = self.clock.sleep(cooldown) => {}
                }
                self.state.lock().reset();
                continue;
            }

            if self.poll_once(&shutdown).await == CycleOutcome::Cancelled {
                break;
            }

            let delay = self.next_delay();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.clock.sleep(delay) => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Price poller stopped");
    }

    /// One fetch-aggregate-install cycle.
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> CycleOutcome {
        let cycle = {
            let mut state = self.state.lock();
            state.cycles += 1;
            state.cycles
        };
        self.cycle(shutdown).instrument(trace_poll_cycle(cycle)).await
    }

    async fn cycle(&self, shutdown: &CancellationToken) -> CycleOutcome {
        let started = self.clock.now();

        let fetched = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return CycleOutcome::Cancelled,
            result = self.breaker.call(|| self.fetch_guarded()) => result,
        };

        let raw = match fetched {
            Ok(raw) => raw,
            Err(e) => return self.on_failure(e),
        };

        let previous = self.cache.current_snapshot();
        let result = self.aggregator.aggregate(&previous, raw, Utc::now());
        if result.accepted == 0 {
            return self.on_failure(Error::MalformedPayload(format!(
                "all {} entries rejected", result.rejected
            )));
        }

        // Shutdown may have started while the fetch was in flight
        if shutdown.is_cancelled() {
            return CycleOutcome::Cancelled;
        }

        let snapshot = self.cache.install(result.snapshot);

        let symbols = snapshot.len();
        {
            let mut state = self.state.lock();
            state.reset();
            state.successful_cycles += 1;
            state.last_update = snapshot.updated_at();
        }
        let elapsed = self.clock.now().saturating_duration_since(started);
        self.metrics.record_update(symbols, elapsed);

        tracing::info!(
            symbols,
            rejected = result.rejected,
            carried_forward = result.carried_forward,
            elapsed_ms = elapsed.as_millis() as u64,
            "Price snapshot installed"
        );

        // No receivers just means nobody is listening yet
        let _ = self.events.send(PriceEvent::Updated {
            snapshot: snapshot.clone(),
            changes: Arc::new(result.changes),
        });

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::debug!("Shutdown during price store write, abandoning it");
            }
            _ = self.write_through(&snapshot) => {}
        }

        CycleOutcome::Updated { symbols }
    }

    async fn fetch_guarded(&self) -> Result<Vec<RawPriceEntry>> {
        let timeout = self.config.fetch_timeout();
        let entries = tokio::time::timeout(timeout, self.source.fetch(&self.symbols))
            .await
            .map_err(|_| Error::FetchTimeout(timeout))??;
        if entries.is_empty() {
            return Err(Error::EmptyPayload);
        }
        Ok(entries)
    }

    async fn write_through(&self, snapshot: &PriceSnapshot) {
        let Some(target) = &self.store else {
            return;
        };

        let mut values = Vec::with_capacity(snapshot.len());
        for entry in snapshot.entries() {
            match serde_json::to_string(entry) {
                Ok(json) => values.push((price_key(&entry.symbol), json)),
                Err(e) => tracing::warn!("Failed to serialize {}: {}", entry.symbol, e),
            }
        }

        let err = match tokio::time::timeout(target.timeout, target.store.put_many(&values, target.ttl)).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(_) => Error::Store(format!("write timed out after {:?}", target.timeout)),
        };
        self.metrics.record_error(err.kind(), &err.to_string());
        tracing::warn!(backend = target.store.backend(), "Price store write failed: {}", err);
    }

    fn on_failure(&self, err: Error) -> CycleOutcome {
        let kind = err.kind();
        let (errors, multiplier) = {
            let mut state = self.state.lock();
            state.consecutive_errors = state.consecutive_errors.saturating_add(1);
            if state.consecutive_errors >= 2 {
                state.backoff_multiplier = state.backoff_multiplier
                    .saturating_mul(2)
                    .min(self.config.max_backoff_multiplier.max(1));
            }
            state.last_error = Some(err.to_string());
            (state.consecutive_errors, state.backoff_multiplier)
        };

        self.metrics.record_error(kind, &err.to_string());
        if err.is_circuit_open() {
            tracing::debug!("Skipping fetch: {}", err);
        } else {
            tracing::warn!(
                consecutive_errors = errors,
                backoff_multiplier = multiplier,
                "Price poll failed: {}", err
            );
        }

        CycleOutcome::Failed { kind }
    }

    fn in_cooldown(&self) -> bool {
        self.state.lock().consecutive_errors >= self.config.max_consecutive_errors
    }
}
