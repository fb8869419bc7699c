use std::sync::Arc;
use std::time::Duration;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use crate::api::protocol::{ServerMessage, StatusPayload};
use crate::api::registry::{ConnectionRegistry, DisconnectReason};
use crate::error::Result;
use crate::observability::metrics::MetricsCollector;
use crate::price_infra::PriceEvent;
use crate::types::ids::ConnectionId;
use crate::types::price::{PriceChange, PriceSnapshot};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Fans events out to every subscribed connection.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<MetricsCollector>,
    send_timeout: Duration,
    // Held for a whole fan-out so every connection sees broadcasts in order
    order: Mutex<()>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: Arc<MetricsCollector>, send_timeout: Duration) -> Self {
        Broadcaster {
            registry,
            metrics,
            send_timeout,
            order: Mutex::new(()),
        }
    }

    pub async fn broadcast_price_update(
        &self,
        snapshot: &PriceSnapshot,
        changes: &[PriceChange],
    ) -> Result<BroadcastReport> {
        self.fan_out(&ServerMessage::price_update(snapshot, changes)).await
    }

    pub async fn broadcast_status(&self, status: StatusPayload) -> Result<BroadcastReport> {
        self.fan_out(&ServerMessage::Status(status)).await
    }

    async fn fan_out(&self, message: &ServerMessage) -> Result<BroadcastReport> {
        let Some(channel) = message.channel() else {
            return Ok(BroadcastReport::default());
        };
        let payload = message.to_json()?;

        let _order = self.order.lock().await;
        let targets = self.registry.active_for_channel(channel);
        if targets.is_empty() {
            return Ok(BroadcastReport::default());
        }

        let sends = targets.iter().map(|connection| {
            let payload = payload.clone();
            async move { (connection.id(), connection.send(payload, self.send_timeout).await) }
        });
        let results = join_all(sends).await;

        let failed: Vec<ConnectionId> = results.iter()
            .filter_map(|(id, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    tracing::debug!(connection_id = %id, "Send failed: {}", e);
                    Some(*id)
                }
            })
            .collect();

        // Only after every send has settled
        for id in &failed {
            self.registry.unregister(id, DisconnectReason::SendFailed);
        }

        let report = BroadcastReport {
            attempted: targets.len(),
            delivered: targets.len() - failed.len(),
            failed: failed.len(),
        };
        self.metrics.record_broadcast(report.delivered, report.failed);
        tracing::debug!(
            channel,
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast complete"
        );
        Ok(report)
    }

    /// Forwards poller events until shutdown or until the poller goes away.
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<PriceEvent>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(PriceEvent::Updated { snapshot, changes }) => {
                    if let Err(e) = self.broadcast_price_update(&snapshot, &changes).await {
                        tracing::error!("Price broadcast failed: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Broadcaster lagged, skipped {} price events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::info!("Broadcaster stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::api::protocol::CHANNEL_PRICES;
    use crate::api::registry::ConnectionHandle;
    use crate::config::ConnectionConfig;
    use crate::price_infra::circuit_breaker::CircuitState;
    use crate::types::price::{Direction, PriceEntry};
    use crate::utils::clock::ManualClock;

    fn setup(outbound_buffer: usize) -> (Arc<ConnectionRegistry>, Arc<MetricsCollector>, Broadcaster) {
        let clock = Arc::new(ManualClock::new());
        let metrics = Arc::new(MetricsCollector::new(Duration::from_secs(3600), clock.clone()).unwrap());
        let config = ConnectionConfig { outbound_buffer, ..ConnectionConfig::default() };
        let registry = Arc::new(ConnectionRegistry::new(config, clock, metrics.clone()));
        let broadcaster = Broadcaster::new(registry.clone(), metrics.clone(), Duration::from_millis(100));
        (registry, metrics, broadcaster)
    }

    /// Registers a connection and discards its welcome frame.
    fn connect(registry: &ConnectionRegistry) -> ConnectionHandle {
        let mut handle = registry.register().unwrap();
        handle.outbound.try_recv().unwrap();
        handle
    }

    fn snapshot(price: f64) -> PriceSnapshot {
        PriceSnapshot::new(
            vec![PriceEntry {
                symbol: "btc".to_string(),
                id: "bitcoin".to_string(),
                name: "Bitcoin".to_string(),
                price,
                change_24h: 0.0,
                market_cap: 0.0,
                volume_24h: 0.0,
                rank: 1,
            }],
            Utc::now(),
        )
    }

    fn change(price: f64) -> Vec<PriceChange> {
        vec![PriceChange {
            symbol: "btc".to_string(),
            previous: None,
            current: price,
            direction: Direction::Unchanged,
        }]
    }

    #[tokio::test]
    async fn test_one_failed_send_does_not_stop_others() {
        let (registry, metrics, broadcaster) = setup(16);
        let mut handles: Vec<ConnectionHandle> = (0..5).map(|_| connect(&registry)).collect();
        let broken = handles.remove(2);
        let broken_id = broken.connection.id();
        drop(broken.outbound);

        let report = broadcaster.broadcast_price_update(&snapshot(100.0), &change(100.0)).await.unwrap();

        assert_eq!(report, BroadcastReport { attempted: 5, delivered: 4, failed: 1 });
        assert!(registry.get(&broken_id).is_none());
        assert_eq!(registry.len(), 4);
        for handle in handles.iter_mut() {
            let message = handle.outbound.recv().await.unwrap();
            assert!(message.contains("\"type\":\"price_update\""));
        }
        assert_eq!(metrics.summary().broadcasts.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_connection_times_out_and_is_removed() {
        let (registry, _metrics, broadcaster) = setup(1);
        let stalled = connect(&registry);
        let mut healthy = connect(&registry);

        broadcaster.broadcast_price_update(&snapshot(1.0), &change(1.0)).await.unwrap();
        healthy.outbound.recv().await.unwrap();

        // The stalled client never drains its single-slot buffer
        let report = broadcaster.broadcast_price_update(&snapshot(2.0), &change(2.0)).await.unwrap();

        assert_eq!(report.failed, 1);
        assert!(registry.get(&stalled.connection.id()).is_none());
        assert!(healthy.outbound.recv().await.unwrap().contains("\"price\":2.0"));
    }

    #[tokio::test]
    async fn test_only_subscribers_receive_channel() {
        let (registry, _metrics, broadcaster) = setup(16);
        let mut prices_only = connect(&registry);
        let mut status_only = connect(&registry);
        registry.unsubscribe(&prices_only.connection.id(), &["status".to_string()]).unwrap();
        registry.unsubscribe(&status_only.connection.id(), &[CHANNEL_PRICES.to_string()]).unwrap();

        broadcaster.broadcast_status(StatusPayload {
            connections: 2,
            running: true,
            cache_size: 0,
            last_update: None,
            consecutive_errors: 0,
            circuit_state: CircuitState::Closed,
            timestamp: Utc::now(),
        }).await.unwrap();

        assert!(status_only.outbound.recv().await.unwrap().contains("\"type\":\"status\""));
        assert!(prices_only.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_preserves_event_order() {
        let (registry, _metrics, broadcaster) = setup(16);
        let broadcaster = Arc::new(broadcaster);
        let mut handle = connect(&registry);
        let (tx, rx) = broadcast::channel(16);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(broadcaster.clone().run(rx, shutdown.clone()));

        for price in [1.0, 2.0, 3.0] {
            tx.send(PriceEvent::Updated {
                snapshot: Arc::new(snapshot(price)),
                changes: Arc::new(change(price)),
            }).unwrap();
        }

        for expected in ["\"price\":1.0", "\"price\":2.0", "\"price\":3.0"] {
            assert!(handle.outbound.recv().await.unwrap().contains(expected));
        }

        shutdown.cancel();
        task.await.unwrap();
    }
}
