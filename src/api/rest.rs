use axum::{
    Router,
    routing::get,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use crate::api::protocol::StatusPayload;
use crate::api::registry::{ConnectionInfo, ConnectionRegistry};
use crate::api::websocket::websocket_handler;
use crate::observability::metrics::{MetricsCollector, MetricsSummary};
use crate::price_infra::cache::PriceCache;
use crate::price_infra::circuit_breaker::{BreakerStats, CircuitBreaker, CircuitState};
use crate::price_infra::poller::{PollerStats, PricePoller};
use crate::price_infra::store::{price_key, PriceStore};
use crate::types::price::PriceEntry;

/// Everything the HTTP and WebSocket handlers read from.
pub struct ApiState {
    pub cache: Arc<PriceCache>,
    pub registry: Arc<ConnectionRegistry>,
    pub poller: Arc<PricePoller>,
    pub breaker: Arc<CircuitBreaker>,
    pub metrics: Arc<MetricsCollector>,
    pub store: Option<Arc<dyn PriceStore>>,
    pub store_timeout: Duration,
    pub ping_interval: Duration,
}

impl ApiState {
    pub fn status(&self) -> StatusPayload {
        StatusPayload {
            connections: self.registry.len(),
            running: self.poller.is_running(),
            cache_size: self.cache.len(),
            last_update: self.cache.current_snapshot().updated_at(),
            consecutive_errors: self.poller.consecutive_errors(),
            circuit_state: self.breaker.state(),
            timestamp: Utc::now(),
        }
    }
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/prices", get(list_prices))
        .route("/api/prices/:symbol", get(get_price))
        .route("/api/status", get(get_status))
        .route("/api/metrics", get(get_metrics))
        .route("/metrics", get(prometheus_metrics))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    running: bool,
    cache_size: usize,
    connections: usize,
    circuit_state: CircuitState,
    last_update: Option<DateTime<Utc>>,
}

async fn health_check(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let status = state.status();
    let healthy = status.running
        && status.cache_size > 0
        && status.circuit_state != CircuitState::Open;

    Json(HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        running: status.running,
        cache_size: status.cache_size,
        connections: status.connections,
        circuit_state: status.circuit_state,
        last_update: status.last_update,
    })
}

#[derive(Serialize)]
struct PricesResponse {
    prices: BTreeMap<String, PriceEntry>,
    count: usize,
    updated_at: Option<DateTime<Utc>>,
}

async fn list_prices(State(state): State<Arc<ApiState>>) -> Json<PricesResponse> {
    let snapshot = state.cache.current_snapshot();
    Json(PricesResponse {
        prices: snapshot.entries()
            .map(|e| (e.symbol.clone(), e.clone()))
            .collect(),
        count: snapshot.len(),
        updated_at: snapshot.updated_at(),
    })
}

async fn get_price(
    State(state): State<Arc<ApiState>>,
    Path(symbol): Path<String>,
) -> Response {
    if let Some(entry) = state.cache.get(&symbol) {
        return Json(entry).into_response();
    }

    // The write-through store can still answer for a symbol that dropped
    // out of the latest snapshot
    if let Some(store) = &state.store {
        match tokio::time::timeout(state.store_timeout, store.get(&price_key(&symbol))).await {
            Ok(Ok(Some(raw))) => match serde_json::from_str::<PriceEntry>(&raw) {
                Ok(entry) => return Json(entry).into_response(),
                Err(e) => tracing::warn!("Corrupt store entry for {}: {}", symbol, e),
            },
            Ok(Ok(None)) => {}
            Ok(Err(e)) => tracing::warn!("Price store lookup failed: {}", e),
            Err(_) => tracing::warn!(
                backend = store.backend(),
                "Price store lookup timed out after {:?}", state.store_timeout
            ),
        }
    }

    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "not_found", "symbol": symbol.to_lowercase() })),
    ).into_response()
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    status: StatusPayload,
    poller: PollerStats,
    breaker: BreakerStats,
    max_connections: usize,
    clients: Vec<ConnectionInfo>,
}

async fn get_status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.status(),
        poller: state.poller.stats(),
        breaker: state.breaker.stats(),
        max_connections: state.registry.capacity(),
        clients: state.registry.connections(),
    })
}

async fn get_metrics(State(state): State<Arc<ApiState>>) -> Json<MetricsSummary> {
    Json(state.metrics.summary())
}

async fn prometheus_metrics(State(state): State<Arc<ApiState>>) -> Response {
    match state.metrics.render_prometheus() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ).into_response(),
        Err(e) => {
            tracing::error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
