use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::api::protocol::{ServerMessage, DEFAULT_CHANNELS};
use crate::api::rate_limit::{InboundRateLimiter, RateDecision};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::observability::metrics::{ConnectionEvent, MetricsCollector};
use crate::types::ids::ConnectionId;
use crate::utils::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientClosed,
    SendFailed,
    Idle,
    RateLimited,
    UpgradeFailed,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::ClientClosed => "client_closed",
            DisconnectReason::SendFailed => "send_failed",
            DisconnectReason::Idle => "idle",
            DisconnectReason::RateLimited => "rate_limited",
            DisconnectReason::UpgradeFailed => "upgrade_failed",
            DisconnectReason::Shutdown => "shutdown",
        }
    }
}

/// One registered client. The socket itself is owned by the connection's
/// writer task; everything else talks to it through `outbound`.
pub struct Connection {
    id: ConnectionId,
    connected_at: DateTime<Utc>,
    subscriptions: DashSet<String>,
    last_seen: Mutex<Instant>,
    messages_sent: AtomicU64,
    limiter: Mutex<InboundRateLimiter>,
    outbound: mpsc::Sender<Arc<str>>,
    closed: CancellationToken,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.contains(channel)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.subscriptions.iter().map(|c| c.clone()).collect();
        channels.sort();
        channels
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    /// Fires once when the connection is unregistered.
    pub fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Queue `payload`, waiting at most `timeout` for buffer space.
    pub async fn send(&self, payload: Arc<str>, timeout: Duration) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        match tokio::time::timeout(timeout, self.outbound.send(payload)).await {
            Ok(Ok(())) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => Err(Error::SendTimeout),
        }
    }

    /// Direct reply without waiting; a full buffer drops the message.
    pub fn reply(&self, message: &ServerMessage) -> Result<()> {
        let payload = message.to_json()?;
        self.outbound.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::SendTimeout,
            mpsc::error::TrySendError::Closed(_) => Error::ChannelClosed,
        })?;
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Returned by `register`: the shared connection plus the receiving end of
/// its outbound queue, which belongs to the socket writer.
pub struct ConnectionHandle {
    pub connection: Arc<Connection>,
    pub outbound: mpsc::Receiver<Arc<str>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    pub subscriptions: Vec<String>,
    pub messages_sent: u64,
    pub idle_ms: u64,
}

/// Live WebSocket connections.
///
/// Capacity is reserved with an atomic counter before the connection is
/// created, so concurrent handshakes can never overshoot `max_connections`.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    reserved: AtomicUsize,
    config: ConnectionConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
}

impl ConnectionRegistry {
    pub fn new(config: ConnectionConfig, clock: Arc<dyn Clock>, metrics: Arc<MetricsCollector>) -> Self {
        ConnectionRegistry {
            connections: DashMap::new(),
            reserved: AtomicUsize::new(0),
            config,
            clock,
            metrics,
        }
    }

    pub fn register(&self) -> Result<ConnectionHandle> {
        let max = self.config.max_connections;
        let reserved = self.reserved.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            if n < max { Some(n + 1) } else { None }
        });
        if reserved.is_err() {
            self.metrics.record_connection_event(ConnectionEvent::Rejected);
            tracing::warn!("Rejecting connection: capacity {} reached", max);
            return Err(Error::CapacityExceeded { max });
        }

        let (tx, rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let subscriptions = DashSet::new();
        for channel in DEFAULT_CHANNELS {
            subscriptions.insert(channel.to_string());
        }

        let connection = Arc::new(Connection {
            id: ConnectionId::new(),
            connected_at: Utc::now(),
            subscriptions,
            last_seen: Mutex::new(self.clock.now()),
            messages_sent: AtomicU64::new(0),
            limiter: Mutex::new(InboundRateLimiter::new(
                self.config.max_messages_per_second,
                self.config.max_violations,
                self.config.violation_window(),
            )),
            outbound: tx,
            closed: CancellationToken::new(),
        });

        // Queued before the connection is visible to broadcasts so it is
        // always the first frame the client sees
        let welcome = ServerMessage::Connection {
            connection_id: connection.id.to_string(),
            channels: connection.subscriptions(),
            server_time: Utc::now(),
        };
        if let Err(e) = connection.reply(&welcome) {
            tracing::warn!(connection_id = %connection.id, "Failed to queue welcome message: {}", e);
        }

        self.connections.insert(connection.id, connection.clone());
        self.metrics.record_connection_event(ConnectionEvent::Opened);
        self.metrics.set_active_connections(self.connections.len());
        tracing::info!(connection_id = %connection.id, "Connection registered ({} active)", self.len());

        Ok(ConnectionHandle { connection, outbound: rx })
    }

    /// Removes the connection and fires its close signal. Returns `false`
    /// when it was already gone, so callers can race freely.
    pub fn unregister(&self, id: &ConnectionId, reason: DisconnectReason) -> bool {
        let Some((_, connection)) = self.connections.remove(id) else {
            return false;
        };
        self.reserved.fetch_sub(1, Ordering::AcqRel);
        connection.closed.cancel();

        let event = match reason {
            DisconnectReason::Idle => ConnectionEvent::Pruned,
            _ => ConnectionEvent::Closed,
        };
        self.metrics.record_connection_event(event);
        self.metrics.set_active_connections(self.connections.len());
        tracing::info!(
            connection_id = %id,
            reason = reason.as_str(),
            "Connection unregistered ({} active)", self.connections.len()
        );
        true
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| c.clone())
    }

    pub fn for_each_active<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for entry in self.connections.iter() {
            if !entry.is_closed() {
                f(entry.value());
            }
        }
    }

    /// Snapshot of open connections subscribed to `channel`.
    pub fn active_for_channel(&self, channel: &str) -> Vec<Arc<Connection>> {
        let mut targets = Vec::new();
        self.for_each_active(|c| {
            if c.is_subscribed(channel) {
                targets.push(c.clone());
            }
        });
        targets
    }

    pub fn subscribe(&self, id: &ConnectionId, channels: &[String]) -> Result<Vec<String>> {
        let connection = self.get(id).ok_or(Error::ConnectionNotFound(*id))?;
        for channel in channels {
            connection.subscriptions.insert(channel.clone());
        }
        Ok(connection.subscriptions())
    }

    pub fn unsubscribe(&self, id: &ConnectionId, channels: &[String]) -> Result<Vec<String>> {
        let connection = self.get(id).ok_or(Error::ConnectionNotFound(*id))?;
        for channel in channels {
            connection.subscriptions.remove(channel);
        }
        Ok(connection.subscriptions())
    }

    /// Any inbound frame, pong or heartbeat counts as liveness.
    pub fn touch(&self, id: &ConnectionId) {
        if let Some(connection) = self.connections.get(id) {
            *connection.last_seen.lock() = self.clock.now();
        }
    }

    /// Applies the inbound rate limit to one client message.
    pub fn check_inbound(&self, id: &ConnectionId) -> Result<RateDecision> {
        let connection = self.get(id).ok_or(Error::ConnectionNotFound(*id))?;
        let decision = connection.limiter.lock().check(self.clock.now());
        if decision != RateDecision::Allow {
            self.metrics.record_connection_event(ConnectionEvent::Throttled);
        }
        Ok(decision)
    }

    /// Unregisters every connection silent for longer than the heartbeat
    /// timeout. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let now = self.clock.now();
        let timeout = self.config.heartbeat_timeout();
        let stale: Vec<ConnectionId> = self.connections.iter()
            .filter(|c| now.saturating_duration_since(*c.last_seen.lock()) > timeout)
            .map(|c| *c.key())
            .collect();

        let pruned = stale.iter()
            .filter(|id| self.unregister(id, DisconnectReason::Idle))
            .count();
        if pruned > 0 {
            tracing::info!("Pruned {} idle connections", pruned);
        }
        pruned
    }

    pub fn close_all(&self, reason: DisconnectReason) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| *c.key()).collect();
        ids.iter().filter(|id| self.unregister(id, reason)).count()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let now = self.clock.now();
        self.connections.iter()
            .map(|c| ConnectionInfo {
                id: c.id.to_string(),
                connected_at: c.connected_at,
                subscriptions: c.subscriptions(),
                messages_sent: c.messages_sent(),
                idle_ms: now.saturating_duration_since(*c.last_seen.lock()).as_millis() as u64,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.config.max_connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::protocol::{CHANNEL_PRICES, CHANNEL_STATUS};
    use crate::utils::clock::ManualClock;

    fn registry(max_connections: usize) -> (Arc<ManualClock>, Arc<MetricsCollector>, ConnectionRegistry) {
        let clock = Arc::new(ManualClock::new());
        let metrics = Arc::new(MetricsCollector::new(Duration::from_secs(3600), clock.clone()).unwrap());
        let config = ConnectionConfig { max_connections, ..ConnectionConfig::default() };
        let registry = ConnectionRegistry::new(config, clock.clone(), metrics.clone());
        (clock, metrics, registry)
    }

    #[test]
    fn test_capacity_is_enforced_and_released() {
        let (_clock, metrics, registry) = registry(2);

        let first = registry.register().unwrap();
        let _second = registry.register().unwrap();
        assert!(matches!(registry.register(), Err(Error::CapacityExceeded { max: 2 })));

        registry.unregister(&first.connection.id(), DisconnectReason::ClientClosed);
        assert!(registry.register().is_ok());
        assert_eq!(metrics.summary().connections.rejected, 1);
    }

    #[test]
    fn test_welcome_is_queued_before_registration_completes() {
        let (_clock, _metrics, registry) = registry(10);
        let mut handle = registry.register().unwrap();

        let welcome: serde_json::Value =
            serde_json::from_str(&handle.outbound.try_recv().unwrap()).unwrap();
        assert_eq!(welcome["type"], "connection");
        assert_eq!(welcome["connection_id"], handle.connection.id().to_string());
        assert_eq!(welcome["channels"], serde_json::json!([CHANNEL_PRICES, CHANNEL_STATUS]));
        assert_eq!(handle.connection.messages_sent(), 1);
        assert!(handle.outbound.try_recv().is_err());
    }

    #[test]
    fn test_unregister_twice_is_noop() {
        let (_clock, metrics, registry) = registry(10);
        let handle = registry.register().unwrap();
        let id = handle.connection.id();
        let signal = handle.connection.close_signal();

        assert!(registry.unregister(&id, DisconnectReason::ClientClosed));
        assert!(!registry.unregister(&id, DisconnectReason::SendFailed));

        assert!(signal.is_cancelled());
        assert!(registry.is_empty());
        assert_eq!(metrics.summary().connections.closed, 1);
        assert!(registry.register().is_ok());
    }

    #[test]
    fn test_default_and_explicit_subscriptions() {
        let (_clock, _metrics, registry) = registry(10);
        let handle = registry.register().unwrap();
        let id = handle.connection.id();

        assert_eq!(registry.active_for_channel(CHANNEL_PRICES).len(), 1);
        let remaining = registry.unsubscribe(&id, &[CHANNEL_PRICES.to_string()]).unwrap();
        assert_eq!(remaining, vec![CHANNEL_STATUS.to_string()]);
        assert!(registry.active_for_channel(CHANNEL_PRICES).is_empty());

        registry.subscribe(&id, &[CHANNEL_PRICES.to_string()]).unwrap();
        assert_eq!(registry.active_for_channel(CHANNEL_PRICES).len(), 1);

        let missing = ConnectionId::new();
        assert!(matches!(registry.subscribe(&missing, &[]), Err(Error::ConnectionNotFound(_))));
    }

    #[test]
    fn test_hundred_messages_in_a_second_keeps_connection() {
        let (clock, metrics, registry) = registry(10);
        let handle = registry.register().unwrap();
        let id = handle.connection.id();

        let mut processed = 0;
        for _ in 0..100 {
            if registry.check_inbound(&id).unwrap() == RateDecision::Allow {
                processed += 1;
            }
            clock.advance(Duration::from_millis(9));
        }

        assert!(processed <= 10);
        assert!(registry.get(&id).is_some());
        assert_eq!(metrics.summary().connections.throttled_messages, 100 - processed);
    }

    #[test]
    fn test_prune_idle_removes_only_silent_connections() {
        let (clock, metrics, registry) = registry(10);
        let quiet = registry.register().unwrap();
        let chatty = registry.register().unwrap();

        clock.advance(Duration::from_secs(45));
        registry.touch(&chatty.connection.id());
        clock.advance(Duration::from_secs(20));

        assert_eq!(registry.prune_idle(), 1);
        assert!(registry.get(&quiet.connection.id()).is_none());
        assert!(registry.get(&chatty.connection.id()).is_some());
        assert_eq!(metrics.summary().connections.pruned, 1);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (_clock, _metrics, registry) = registry(10);
        let mut handle = registry.register().unwrap();
        let connection = handle.connection.clone();
        assert!(handle.outbound.try_recv().unwrap().contains("\"type\":\"connection\""));

        connection.send(Arc::from("hello"), Duration::from_millis(50)).await.unwrap();
        assert_eq!(handle.outbound.recv().await.as_deref(), Some("hello"));

        registry.close_all(DisconnectReason::Shutdown);
        assert!(matches!(
            connection.send(Arc::from("late"), Duration::from_millis(50)).await,
            Err(Error::ChannelClosed)
        ));
    }
}
