//! End-to-end WebSocket behaviour against a real listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures::{SinkExt, StreamExt};
use price_relay::config::AppConfig;
use price_relay::core::PriceRelay;
use price_relay::price_infra::connectors::synthetic::SyntheticPriceSource;
use price_relay::utils::clock::TokioClock;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay(max_connections: usize) -> (Arc<PriceRelay>, SocketAddr) {
    let mut config = AppConfig::default();
    config.poller.update_interval_secs = 1;
    config.connections.max_connections = max_connections;
    config.source.symbols = vec!["bitcoin".to_string(), "ethereum".to_string()];
    config.server.shutdown_grace_secs = 1;

    let relay = Arc::new(
        PriceRelay::with_source(config, Arc::new(SyntheticPriceSource::new(11)), Arc::new(TokioClock))
            .unwrap(),
    );
    relay.start().await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = relay.router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (relay, addr)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    client
}

/// Reads text frames until one with the given `type` arrives.
async fn next_of_type(client: &mut Client, kind: &str) -> Value {
    let wait = async {
        while let Some(frame) = client.next().await {
            if let Message::Text(text) = frame.unwrap() {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["type"] == kind {
                    return value;
                }
            }
        }
        panic!("socket closed before a {} message", kind);
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", kind))
}

#[tokio::test]
async fn test_welcome_then_price_updates() {
    let (relay, addr) = spawn_relay(10).await;
    let mut client = connect(addr).await;

    let welcome = next_of_type(&mut client, "connection").await;
    assert!(welcome["connection_id"].is_string());
    assert_eq!(welcome["channels"], serde_json::json!(["prices", "status"]));

    let update = next_of_type(&mut client, "price_update").await;
    assert!(update["prices"]["btc"]["price"].as_f64().unwrap() > 0.0);
    assert!(update["changes"]["eth"].is_string());

    relay.stop().await;
}

#[tokio::test]
async fn test_third_connection_rejected_at_capacity() {
    let (relay, addr) = spawn_relay(2).await;
    let mut first = connect(addr).await;
    let mut second = connect(addr).await;

    match connect_async(format!("ws://{}/ws", addr)).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 503);
        }
        Err(other) => panic!("expected HTTP 503, got {:?}", other),
        Ok(_) => panic!("third connection should have been rejected"),
    }

    next_of_type(&mut first, "price_update").await;
    next_of_type(&mut second, "price_update").await;
    assert_eq!(relay.registry().len(), 2);
    assert_eq!(relay.metrics().summary().connections.rejected, 1);

    relay.stop().await;
}

#[tokio::test]
async fn test_ping_and_subscription_commands() {
    let (relay, addr) = spawn_relay(10).await;
    let mut client = connect(addr).await;
    next_of_type(&mut client, "connection").await;

    client.send(Message::Text(r#"{"type":"ping"}"#.to_string())).await.unwrap();
    let pong = next_of_type(&mut client, "pong").await;
    assert!(pong["timestamp"].is_string());

    client
        .send(Message::Text(r#"{"type":"unsubscribe","channels":["prices"]}"#.to_string()))
        .await
        .unwrap();
    let ack = next_of_type(&mut client, "unsubscribed").await;
    assert_eq!(ack["channels"], serde_json::json!(["prices"]));

    client.send(Message::Text("nonsense".to_string())).await.unwrap();
    let error = next_of_type(&mut client, "error").await;
    assert_eq!(error["code"], "invalid_message");

    relay.stop().await;
}

#[tokio::test]
async fn test_flood_is_throttled_without_disconnect() {
    let (relay, addr) = spawn_relay(10).await;
    let mut client = connect(addr).await;
    next_of_type(&mut client, "connection").await;

    for _ in 0..100 {
        client.send(Message::Text(r#"{"type":"ping"}"#.to_string())).await.unwrap();
    }

    let notice = next_of_type(&mut client, "error").await;
    assert_eq!(notice["code"], "rate_limited");
    assert_eq!(relay.registry().len(), 1);

    // Still subscribed and still served
    next_of_type(&mut client, "price_update").await;

    relay.stop().await;
}

#[tokio::test]
async fn test_control_and_binary_frames_are_throttled() {
    let (relay, addr) = spawn_relay(10).await;
    let mut client = connect(addr).await;
    next_of_type(&mut client, "connection").await;

    for _ in 0..50 {
        client.send(Message::Ping(Vec::new())).await.unwrap();
    }
    for _ in 0..50 {
        client.send(Message::Binary(vec![0xff, 0xfe])).await.unwrap();
    }

    let mut invalid_replies = 0;
    loop {
        let error = next_of_type(&mut client, "error").await;
        match error["code"].as_str() {
            Some("invalid_message") => invalid_replies += 1,
            Some("rate_limited") => break,
            other => panic!("unexpected error code {:?}", other),
        }
    }

    // The pings alone use up the first second's budget
    assert!(invalid_replies < 10);
    tokio::time::timeout(Duration::from_secs(5), async {
        while relay.metrics().summary().connections.throttled_messages < 80 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("control frames were not throttled");
    assert_eq!(relay.registry().len(), 1);

    relay.stop().await;
}

#[tokio::test]
async fn test_client_close_unregisters() {
    let (relay, addr) = spawn_relay(10).await;
    let mut client = connect(addr).await;
    next_of_type(&mut client, "connection").await;
    assert_eq!(relay.registry().len(), 1);

    client.close(None).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !relay.registry().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("connection was not unregistered");

    relay.stop().await;
}
