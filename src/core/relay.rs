use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use axum::Router;
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use crate::api::broadcaster::Broadcaster;
use crate::api::protocol::StatusPayload;
use crate::api::registry::{ConnectionRegistry, DisconnectReason};
use crate::api::rest::{create_router, ApiState};
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::observability::metrics::MetricsCollector;
use crate::price_infra::cache::PriceCache;
use crate::price_infra::circuit_breaker::CircuitBreaker;
use crate::price_infra::connectors::{build_price_source, PriceSource};
use crate::price_infra::poller::PricePoller;
use crate::price_infra::store::build_store;
use crate::utils::clock::{Clock, TokioClock};
use crate::utils::task_supervisor::TaskSupervisor;

/// Owns every component of one relay instance and the background tasks
/// that drive them. A relay starts at most once.
pub struct PriceRelay {
    config: AppConfig,
    source_id: String,
    api: Arc<ApiState>,
    broadcaster: Arc<Broadcaster>,
    shutdown: CancellationToken,
    supervisor: Mutex<TaskSupervisor>,
    started: AtomicBool,
}

impl PriceRelay {
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let metrics = Arc::new(MetricsCollector::new(config.metrics.window(), clock.clone())?);
        let source = build_price_source(&config.source, clock.clone(), metrics.clone())?;
        Self::assemble(config, source, clock, metrics)
    }

    /// Relay over a caller-supplied source and clock.
    pub fn with_source(config: AppConfig, source: Arc<dyn PriceSource>, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(MetricsCollector::new(config.metrics.window(), clock.clone())?);
        Self::assemble(config, source, clock, metrics)
    }

    fn assemble(
        config: AppConfig,
        source: Arc<dyn PriceSource>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let source_id = source.source_id().to_string();
        let cache = Arc::new(PriceCache::new(metrics.clone()));
        let breaker = Arc::new(
            CircuitBreaker::new("price_source", &config.breaker, clock.clone())
                .with_metrics(metrics.clone()),
        );
        let store = build_store(&config.cache, clock.clone())?;

        let poller = Arc::new(
            PricePoller::new(
                source,
                breaker.clone(),
                cache.clone(),
                metrics.clone(),
                config.poller.clone(),
                config.source.symbols.clone(),
                clock.clone(),
            )
            .with_store(store.clone(), config.cache.ttl(), config.cache.write_timeout()),
        );

        let registry = Arc::new(ConnectionRegistry::new(
            config.connections.clone(),
            clock,
            metrics.clone(),
        ));
        let broadcaster = Arc::new(Broadcaster::new(
            registry.clone(),
            metrics.clone(),
            config.broadcast.send_timeout(),
        ));

        let api = Arc::new(ApiState {
            cache,
            registry,
            poller,
            breaker,
            metrics,
            store: Some(store),
            store_timeout: config.cache.write_timeout(),
            ping_interval: config.connections.ping_interval(),
        });

        Ok(PriceRelay {
            config,
            source_id,
            api,
            broadcaster,
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(TaskSupervisor::new()),
            started: AtomicBool::new(false),
        })
    }

    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        tracing::info!(
            source = %self.source_id,
            symbols = self.config.source.symbols.len(),
            "Starting price relay"
        );

        let mut supervisor = self.supervisor.lock().await;

        // Subscribe before the poller can publish its first snapshot
        let events = self.api.poller.subscribe();
        supervisor.spawn(
            "broadcaster",
            self.broadcaster.clone().run(events, self.shutdown.child_token()),
        );
        supervisor.spawn(
            "price_poller",
            self.api.poller.clone().run(self.shutdown.child_token()),
        );
        supervisor.spawn(
            "status_ticker",
            status_loop(
                self.api.clone(),
                self.broadcaster.clone(),
                self.config.broadcast.status_interval(),
                self.shutdown.child_token(),
            ),
        );
        supervisor.spawn(
            "idle_pruner",
            prune_loop(
                self.api.registry.clone(),
                self.config.connections.prune_interval(),
                self.shutdown.child_token(),
            ),
        );

        Ok(())
    }

    /// Cancels every task, closes every connection and waits up to the
    /// configured grace period before aborting stragglers.
    pub async fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("Stopping price relay");
        self.shutdown.cancel();

        let closed = self.api.registry.close_all(DisconnectReason::Shutdown);
        if closed > 0 {
            tracing::info!("Closed {} connections", closed);
        }

        let grace = Duration::from_secs(self.config.server.shutdown_grace_secs);
        self.supervisor.lock().await.shutdown_all(grace).await;
        tracing::info!("Price relay stopped");
    }

    /// Errors if a background task exited while the relay should be running.
    pub async fn check_tasks(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.supervisor.lock().await.check_health()
    }

    pub fn router(&self) -> Router {
        create_router(self.api.clone())
    }

    pub fn status(&self) -> StatusPayload {
        self.api.status()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn cache(&self) -> &Arc<PriceCache> {
        &self.api.cache
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.api.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.api.metrics
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

async fn status_loop(
    api: Arc<ApiState>,
    broadcaster: Arc<Broadcaster>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = broadcaster.broadcast_status(api.status()).await {
                    tracing::error!("Status broadcast failed: {}", e);
                }
            }
        }
    }
}

async fn prune_loop(registry: Arc<ConnectionRegistry>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                registry.prune_idle();
            }
        }
    }
}
