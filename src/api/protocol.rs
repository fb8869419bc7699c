use std::collections::BTreeMap;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::error::{Error, Result};
use crate::price_infra::circuit_breaker::CircuitState;
use crate::types::price::{Direction, PriceChange, PriceEntry, PriceSnapshot};

pub const CHANNEL_PRICES: &str = "prices";
pub const CHANNEL_STATUS: &str = "status";

/// Every connection starts subscribed to these.
pub const DEFAULT_CHANNELS: [&str; 2] = [CHANNEL_PRICES, CHANNEL_STATUS];

pub fn is_known_channel(channel: &str) -> bool {
    DEFAULT_CHANNELS.contains(&channel)
}

// ============================================================================
// Client -> Server
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Ping,
}

#[derive(Debug, Deserialize)]
struct ClientEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    channels: Option<Vec<String>>,
}

/// Accepts `{"channels":[...]}` as shorthand for subscribe, the typed
/// `subscribe` / `unsubscribe` forms, and `ping` / `heartbeat`.
pub fn parse_client_message(text: &str) -> Result<ClientCommand> {
    let envelope: ClientEnvelope = serde_json::from_str(text)
        .map_err(|e| Error::MalformedPayload(e.to_string()))?;

    match (envelope.kind.as_deref(), envelope.channels) {
        (Some("ping") | Some("heartbeat"), _) => Ok(ClientCommand::Ping),
        (Some("subscribe") | None, Some(channels)) => {
            Ok(ClientCommand::Subscribe(known_channels(channels)?))
        }
        (Some("unsubscribe"), Some(channels)) => {
            Ok(ClientCommand::Unsubscribe(known_channels(channels)?))
        }
        (Some("subscribe") | Some("unsubscribe") | None, None) => {
            Err(Error::MalformedPayload("missing channels".into()))
        }
        (Some(other), _) => Err(Error::MalformedPayload(format!("unknown message type '{}'", other))),
    }
}

fn known_channels(channels: Vec<String>) -> Result<Vec<String>> {
    let mut known: Vec<String> = channels.iter()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| is_known_channel(c))
        .collect();
    known.sort();
    known.dedup();
    if known.is_empty() {
        return Err(Error::MalformedPayload(format!(
            "no known channels in {:?}, expected any of {:?}", channels, DEFAULT_CHANNELS
        )));
    }
    Ok(known)
}

// ============================================================================
// Server -> Client
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub connections: usize,
    pub running: bool,
    pub cache_size: usize,
    pub last_update: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub circuit_state: CircuitState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connection {
        connection_id: String,
        channels: Vec<String>,
        server_time: DateTime<Utc>,
    },
    PriceUpdate {
        prices: BTreeMap<String, PriceEntry>,
        changes: BTreeMap<String, Direction>,
        timestamp: DateTime<Utc>,
    },
    Status(StatusPayload),
    Subscribed {
        channels: Vec<String>,
    },
    Unsubscribed {
        channels: Vec<String>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn price_update(snapshot: &PriceSnapshot, changes: &[PriceChange]) -> Self {
        ServerMessage::PriceUpdate {
            prices: snapshot.entries()
                .map(|e| (e.symbol.clone(), e.clone()))
                .collect(),
            changes: changes.iter()
                .map(|c| (c.symbol.clone(), c.direction))
                .collect(),
            timestamp: snapshot.updated_at().unwrap_or_else(Utc::now),
        }
    }

    /// Client-facing error. `message` must never carry upstream error text.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn channel(&self) -> Option<&'static str> {
        match self {
            ServerMessage::PriceUpdate { .. } => Some(CHANNEL_PRICES),
            ServerMessage::Status(_) => Some(CHANNEL_STATUS),
            _ => None,
        }
    }

    /// Serialized once and shared by every recipient.
    pub fn to_json(&self) -> Result<Arc<str>> {
        Ok(Arc::from(serde_json::to_string(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_parse_client_messages() {
        assert_eq!(
            parse_client_message(r#"{"channels":["prices"]}"#).unwrap(),
            ClientCommand::Subscribe(vec!["prices".to_string()])
        );
        assert_eq!(
            parse_client_message(r#"{"type":"unsubscribe","channels":["STATUS","status"]}"#).unwrap(),
            ClientCommand::Unsubscribe(vec!["status".to_string()])
        );
        assert_eq!(parse_client_message(r#"{"type":"ping"}"#).unwrap(), ClientCommand::Ping);
        assert_eq!(parse_client_message(r#"{"type":"heartbeat"}"#).unwrap(), ClientCommand::Ping);
    }

    #[test]
    fn test_rejects_bad_client_messages() {
        assert!(parse_client_message("not json").is_err());
        assert!(parse_client_message(r#"{"type":"subscribe"}"#).is_err());
        assert!(parse_client_message(r#"{"type":"dance"}"#).is_err());
        assert!(parse_client_message(r#"{"channels":["orders"]}"#).is_err());
    }

    #[test]
    fn test_price_update_wire_shape() {
        let snapshot = PriceSnapshot::new(
            vec![PriceEntry {
                symbol: "btc".to_string(),
                id: "bitcoin".to_string(),
                name: "Bitcoin".to_string(),
                price: 65000.0,
                change_24h: 1.5,
                market_cap: 0.0,
                volume_24h: 0.0,
                rank: 1,
            }],
            Utc::now(),
        );
        let changes = vec![PriceChange {
            symbol: "btc".to_string(),
            previous: Some(64000.0),
            current: 65000.0,
            direction: Direction::Up,
        }];

        let message = ServerMessage::price_update(&snapshot, &changes);
        assert_eq!(message.channel(), Some(CHANNEL_PRICES));

        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "price_update");
        assert_eq!(value["prices"]["btc"]["price"], 65000.0);
        assert_eq!(value["changes"]["btc"], "up");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_status_is_flattened_under_type_tag() {
        let message = ServerMessage::Status(StatusPayload {
            connections: 3,
            running: true,
            cache_size: 10,
            last_update: None,
            consecutive_errors: 0,
            circuit_state: CircuitState::HalfOpen,
            timestamp: Utc::now(),
        });

        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["connections"], 3);
        assert_eq!(value["circuit_state"], "half_open");
    }
}
