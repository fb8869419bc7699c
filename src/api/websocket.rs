use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use crate::api::protocol::{parse_client_message, ClientCommand, ServerMessage};
use crate::api::rate_limit::RateDecision;
use crate::api::registry::{Connection, ConnectionHandle, ConnectionRegistry, DisconnectReason};
use crate::api::rest::ApiState;
use crate::error::Error;
use crate::observability::tracing::trace_connection;

/// `GET /ws`. Capacity is claimed before the upgrade so a full relay
/// answers with a plain 503 instead of accepting and closing.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> Response {
    let handle = match state.registry.register() {
        Ok(handle) => handle,
        Err(Error::CapacityExceeded { max }) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": "capacity_exceeded",
                    "message": format!("Server is at capacity ({} connections)", max),
                })),
            ).into_response();
        }
        Err(e) => {
            tracing::error!("Connection registration failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let id = handle.connection.id();
    let registry = state.registry.clone();
    ws.on_failed_upgrade(move |e| {
        tracing::warn!(connection_id = %id, "WebSocket upgrade failed: {}", e);
        registry.unregister(&id, DisconnectReason::UpgradeFailed);
    })
    .on_upgrade(move |socket| {
        let span = trace_connection(&id);
        handle_socket(socket, state, handle).instrument(span)
    })
}

async fn handle_socket(socket: WebSocket, state: Arc<ApiState>, handle: ConnectionHandle) {
    let ConnectionHandle { connection, outbound } = handle;
    let id = connection.id();
    let (sink, mut stream) = socket.split();

    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        connection.close_signal(),
        state.ping_interval,
    ));

    let reason = read_loop(&mut stream, &state.registry, &connection).await;
    state.registry.unregister(&id, reason);

    if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
        tracing::debug!("Writer did not finish in time");
    }
}

/// Owns the socket sink: drains the outbound queue and keeps the link
/// alive with pings until the connection's close signal fires.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Arc<str>>,
    closed: CancellationToken,
    ping_every: Duration,
) {
    let mut ping = interval(ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ping.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = closed.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }

            payload = outbound.recv() => {
                let Some(payload) = payload else { break };
                if sink.send(Message::Text(payload.to_string())).await.is_err() {
                    break;
                }
            }

            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    stream: &mut SplitStream<WebSocket>,
    registry: &ConnectionRegistry,
    connection: &Arc<Connection>,
) -> DisconnectReason {
    let id = connection.id();
    let closed = connection.close_signal();
    let mut throttle_notified = false;

    loop {
        let frame = tokio::select! {
            biased;
            // Unregistered elsewhere (send failure, idle prune, shutdown)
            _ = closed.cancelled() => return DisconnectReason::Shutdown,
            frame = stream.next() => frame,
        };

        let payload = match frame {
            Some(Ok(Message::Text(text))) => Some(Ok(text)),
            Some(Ok(Message::Binary(bytes))) => Some(String::from_utf8(bytes).map_err(|_| ())),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => None,
            Some(Ok(Message::Close(_))) | None => return DisconnectReason::ClientClosed,
            Some(Err(e)) => {
                tracing::debug!("WebSocket read error: {}", e);
                return DisconnectReason::ClientClosed;
            }
        };

        registry.touch(&id);

        // Every inbound frame counts against the limit, control frames included
        match registry.check_inbound(&id) {
            Ok(RateDecision::Allow) => throttle_notified = false,
            Ok(RateDecision::Drop) => {
                if !throttle_notified {
                    let _ = connection.reply(&ServerMessage::error(
                        "rate_limited",
                        "Too many messages, excess messages are dropped",
                    ));
                    throttle_notified = true;
                }
                continue;
            }
            Ok(RateDecision::Disconnect) => {
                tracing::warn!("Disconnecting client after repeated rate limit violations");
                let _ = connection.reply(&ServerMessage::error(
                    "rate_limited",
                    "Rate limit exceeded repeatedly, closing connection",
                ));
                return DisconnectReason::RateLimited;
            }
            Err(_) => return DisconnectReason::Shutdown,
        }

        let text = match payload {
            Some(Ok(text)) => text,
            Some(Err(())) => {
                let _ = connection.reply(&ServerMessage::error("invalid_message", "Binary frames must be UTF-8 JSON"));
                continue;
            }
            None => continue,
        };

        let reply = match parse_client_message(&text) {
            Ok(ClientCommand::Ping) => ServerMessage::Pong { timestamp: Utc::now() },
            Ok(ClientCommand::Subscribe(channels)) => match registry.subscribe(&id, &channels) {
                Ok(_) => ServerMessage::Subscribed { channels },
                Err(_) => return DisconnectReason::Shutdown,
            },
            Ok(ClientCommand::Unsubscribe(channels)) => match registry.unsubscribe(&id, &channels) {
                Ok(_) => ServerMessage::Unsubscribed { channels },
                Err(_) => return DisconnectReason::Shutdown,
            },
            Err(e) => {
                tracing::debug!("Invalid client message: {}", e);
                ServerMessage::error("invalid_message", e.to_string())
            }
        };

        if let Err(e) = connection.reply(&reply) {
            tracing::debug!("Dropped reply: {}", e);
        }
    }
}
