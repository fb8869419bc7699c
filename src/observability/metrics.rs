use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use crate::error::Result;
use crate::utils::clock::Clock;

const MAX_ERROR_MESSAGE_LEN: usize = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    Closed,
    Rejected,
    Pruned,
    Throttled,
}

impl ConnectionEvent {
    fn label(&self) -> &'static str {
        match self {
            ConnectionEvent::Opened => "opened",
            ConnectionEvent::Closed => "closed",
            ConnectionEvent::Rejected => "rejected",
            ConnectionEvent::Pruned => "pruned",
            ConnectionEvent::Throttled => "throttled",
        }
    }
}

/// Time-bounded sample log. Entries older than `window` are dropped lazily
/// whenever the window is written or read.
#[derive(Debug)]
struct RollingWindow {
    window: Duration,
    samples: VecDeque<(Instant, f64)>,
}

impl RollingWindow {
    fn new(window: Duration) -> Self {
        RollingWindow {
            window,
            samples: VecDeque::new(),
        }
    }

    fn push(&mut self, now: Instant, value: f64) {
        self.prune(now);
        // Keep timestamps monotonic even if callers race on `now`
        let at = match self.samples.back() {
            Some(&(last, _)) if last > now => last,
            _ => now,
        };
        self.samples.push_back((at, value));
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.saturating_duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn stats(&mut self, now: Instant) -> WindowStats {
        self.prune(now);
        let count = self.samples.len();
        let sum: f64 = self.samples.iter().map(|(_, v)| v).sum();
        let max = self.samples.iter().map(|(_, v)| *v).fold(0.0, f64::max);
        WindowStats { count, sum, max }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct WindowStats {
    count: usize,
    sum: f64,
    max: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConnectionSummary {
    pub active: i64,
    pub opened: u64,
    pub closed: u64,
    pub rejected: u64,
    pub pruned: u64,
    pub throttled_messages: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct BroadcastSummary {
    pub broadcasts: u64,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricsSummary {
    pub window_secs: u64,
    pub uptime_secs: u64,
    pub total_updates: u64,
    pub updates_in_window: usize,
    pub symbols_updated_in_window: f64,
    pub updates_per_minute: f64,
    pub total_errors: u64,
    pub errors_in_window: usize,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub last_error: Option<ErrorRecord>,
    pub last_update: Option<DateTime<Utc>>,
    pub avg_processing_ms: f64,
    pub max_processing_ms: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub connections: ConnectionSummary,
    pub broadcasts: BroadcastSummary,
    pub breaker_transitions: u64,
}

struct PrometheusMetrics {
    registry: Registry,
    updates: IntCounter,
    errors: IntCounterVec,
    cache_requests: IntCounterVec,
    connection_events: IntCounterVec,
    active_connections: IntGauge,
    deliveries: IntCounter,
    send_failures: IntCounter,
    update_duration: Histogram,
    breaker_transitions: IntCounterVec,
}

impl PrometheusMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let updates = IntCounter::new(
            "price_updates_total",
            "Total number of successful price poll cycles"
        )?;
        let errors = IntCounterVec::new(
            Opts::new("price_errors_total", "Errors by kind"),
            &["kind"],
        )?;
        let cache_requests = IntCounterVec::new(
            Opts::new("price_cache_requests_total", "Price cache lookups by result"),
            &["result"],
        )?;
        let connection_events = IntCounterVec::new(
            Opts::new("ws_connection_events_total", "WebSocket connection lifecycle events"),
            &["event"],
        )?;
        let active_connections = IntGauge::new(
            "ws_active_connections",
            "Currently registered WebSocket connections"
        )?;
        let deliveries = IntCounter::new(
            "ws_messages_delivered_total",
            "Messages delivered to connection queues"
        )?;
        let send_failures = IntCounter::new(
            "ws_send_failures_total",
            "Failed or timed out sends"
        )?;
        let update_duration = Histogram::with_opts(
            HistogramOpts::new(
                "price_update_duration_seconds",
                "Duration of a successful poll cycle"
            ).buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0])
        )?;
        let breaker_transitions = IntCounterVec::new(
            Opts::new("circuit_breaker_transitions_total", "Circuit breaker state transitions"),
            &["breaker", "to"],
        )?;

        registry.register(Box::new(updates.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(cache_requests.clone()))?;
        registry.register(Box::new(connection_events.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(deliveries.clone()))?;
        registry.register(Box::new(send_failures.clone()))?;
        registry.register(Box::new(update_duration.clone()))?;
        registry.register(Box::new(breaker_transitions.clone()))?;

        Ok(PrometheusMetrics {
            registry,
            updates,
            errors,
            cache_requests,
            connection_events,
            active_connections,
            deliveries,
            send_failures,
            update_duration,
            breaker_transitions,
        })
    }
}

/// Passive observer fed by the poller, cache, registry and broadcaster.
///
/// Counters are monotonic for the lifetime of the collector. The rolling
/// windows bound memory to roughly `window` worth of samples; `summary` reads
/// them without coordinating with writers, so counts are only eventually
/// consistent under concurrent recording.
pub struct MetricsCollector {
    clock: Arc<dyn Clock>,
    started_at: Instant,
    window: Duration,

    updates: Mutex<RollingWindow>,
    errors: Mutex<RollingWindow>,
    durations: Mutex<RollingWindow>,

    total_updates: AtomicU64,
    total_errors: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    connections_rejected: AtomicU64,
    connections_pruned: AtomicU64,
    messages_throttled: AtomicU64,
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    send_failures: AtomicU64,
    breaker_transitions: AtomicU64,

    errors_by_kind: DashMap<String, u64>,
    last_error: Mutex<Option<ErrorRecord>>,
    last_update: Mutex<Option<DateTime<Utc>>>,

    prom: PrometheusMetrics,
}

impl MetricsCollector {
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        let started_at = clock.now();
        Ok(MetricsCollector {
            clock,
            started_at,
            window,
            updates: Mutex::new(RollingWindow::new(window)),
            errors: Mutex::new(RollingWindow::new(window)),
            durations: Mutex::new(RollingWindow::new(window)),
            total_updates: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            connections_pruned: AtomicU64::new(0),
            messages_throttled: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            breaker_transitions: AtomicU64::new(0),
            errors_by_kind: DashMap::new(),
            last_error: Mutex::new(None),
            last_update: Mutex::new(None),
            prom: PrometheusMetrics::new()?,
        })
    }

    /// One successful poll cycle that installed `symbols` entries.
    pub fn record_update(&self, symbols: usize, duration: Duration) {
        let now = self.clock.now();
        self.total_updates.fetch_add(1, Ordering::Relaxed);
        self.updates.lock().push(now, symbols as f64);
        self.durations.lock().push(now, duration.as_secs_f64() * 1000.0);
        *self.last_update.lock() = Some(Utc::now());

        self.prom.updates.inc();
        self.prom.update_duration.observe(duration.as_secs_f64());
    }

    pub fn record_error(&self, kind: &str, message: &str) {
        let now = self.clock.now();
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.errors.lock().push(now, 1.0);
        *self.errors_by_kind.entry(kind.to_string()).or_insert(0) += 1;

        let mut message = message.to_string();
        if message.len() > MAX_ERROR_MESSAGE_LEN {
            let mut cut = MAX_ERROR_MESSAGE_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        *self.last_error.lock() = Some(ErrorRecord {
            kind: kind.to_string(),
            message,
            at: Utc::now(),
        });

        self.prom.errors.with_label_values(&[kind]).inc();
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.prom.cache_requests.with_label_values(&["hit"]).inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.prom.cache_requests.with_label_values(&["miss"]).inc();
    }

    pub fn record_connection_event(&self, event: ConnectionEvent) {
        let counter = match event {
            ConnectionEvent::Opened => &self.connections_opened,
            ConnectionEvent::Closed => &self.connections_closed,
            ConnectionEvent::Rejected => &self.connections_rejected,
            ConnectionEvent::Pruned => &self.connections_pruned,
            ConnectionEvent::Throttled => &self.messages_throttled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.prom.connection_events.with_label_values(&[event.label()]).inc();
    }

    pub fn set_active_connections(&self, active: usize) {
        self.prom.active_connections.set(active as i64);
    }

    pub fn record_broadcast(&self, delivered: usize, failed: usize) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        self.send_failures.fetch_add(failed as u64, Ordering::Relaxed);
        self.prom.deliveries.inc_by(delivered as u64);
        self.prom.send_failures.inc_by(failed as u64);
    }

    pub fn record_breaker_transition(&self, breaker: &str, to: &str) {
        self.breaker_transitions.fetch_add(1, Ordering::Relaxed);
        self.prom.breaker_transitions.with_label_values(&[breaker, to]).inc();
    }

    pub fn summary(&self) -> MetricsSummary {
        let now = self.clock.now();
        let updates = self.updates.lock().stats(now);
        let errors = self.errors.lock().stats(now);
        let durations = self.durations.lock().stats(now);

        let uptime = now.saturating_duration_since(self.started_at);
        let observed = uptime.min(self.window).as_secs_f64();
        let updates_per_minute = if observed > 0.0 {
            updates.count as f64 * 60.0 / observed
        } else {
            0.0
        };

        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = cache_hits + cache_misses;
        let cache_hit_rate = if lookups > 0 {
            cache_hits as f64 / lookups as f64
        } else {
            0.0
        };

        let avg_processing_ms = if durations.count > 0 {
            durations.sum / durations.count as f64
        } else {
            0.0
        };

        MetricsSummary {
            window_secs: self.window.as_secs(),
            uptime_secs: uptime.as_secs(),
            total_updates: self.total_updates.load(Ordering::Relaxed),
            updates_in_window: updates.count,
            symbols_updated_in_window: updates.sum,
            updates_per_minute,
            total_errors: self.total_errors.load(Ordering::Relaxed),
            errors_in_window: errors.count,
            errors_by_kind: self.errors_by_kind.iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            last_error: self.last_error.lock().clone(),
            last_update: *self.last_update.lock(),
            avg_processing_ms,
            max_processing_ms: durations.max,
            cache_hits,
            cache_misses,
            cache_hit_rate,
            connections: ConnectionSummary {
                active: self.prom.active_connections.get(),
                opened: self.connections_opened.load(Ordering::Relaxed),
                closed: self.connections_closed.load(Ordering::Relaxed),
                rejected: self.connections_rejected.load(Ordering::Relaxed),
                pruned: self.connections_pruned.load(Ordering::Relaxed),
                throttled_messages: self.messages_throttled.load(Ordering::Relaxed),
            },
            broadcasts: BroadcastSummary {
                broadcasts: self.broadcasts.load(Ordering::Relaxed),
                delivered: self.delivered.load(Ordering::Relaxed),
                failed: self.send_failures.load(Ordering::Relaxed),
            },
            breaker_transitions: self.breaker_transitions.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition of the mirrored counters.
    pub fn render_prometheus(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.prom.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
