use std::time::Duration;
use config::{Config, File, FileFormat};
use price_relay::config::AppConfig;
use price_relay::core::PriceRelay;
use price_relay::price_infra::circuit_breaker::CircuitState;
use price_relay::Error;

fn mock_config() -> AppConfig {
    let builder = Config::builder().add_source(File::from_str(
        r#"
        [poller]
        update_interval_secs = 1

        [source]
        symbols = ["bitcoin", "ethereum", "dogecoin"]
        use_mock_prices = true
        mock_seed = 3

        [server]
        shutdown_grace_secs = 1
        "#,
        FileFormat::Toml,
    ));
    AppConfig::from_builder(builder).unwrap()
}

#[tokio::test]
async fn test_mock_relay_serves_prices_until_stopped() {
    let relay = PriceRelay::new(mock_config()).unwrap();
    let mut updates = relay.cache().subscribe();

    relay.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), updates.changed())
        .await
        .expect("no snapshot within 5s")
        .unwrap();

    let first = relay.cache().get("BTC").unwrap().price;
    tokio::time::timeout(Duration::from_secs(5), updates.changed())
        .await
        .expect("no second snapshot within 5s")
        .unwrap();
    let second = relay.cache().get("btc").unwrap().price;

    assert!(first > 0.0 && second > 0.0);
    assert!(((second - first) / first).abs() <= 0.015);

    let status = relay.status();
    assert!(status.running);
    assert_eq!(status.cache_size, 3);
    assert_eq!(status.circuit_state, CircuitState::Closed);
    assert_eq!(status.consecutive_errors, 0);

    relay.stop().await;
    assert!(!relay.status().running);
    assert!(matches!(relay.start().await, Err(Error::AlreadyRunning)));
}

#[tokio::test]
async fn test_snapshot_timestamps_never_decrease() {
    let relay = PriceRelay::new(mock_config()).unwrap();
    let mut updates = relay.cache().subscribe();
    relay.start().await.unwrap();

    let mut last = None;
    for _ in 0..3 {
        tokio::time::timeout(Duration::from_secs(5), updates.changed())
            .await
            .unwrap()
            .unwrap();
        let at = updates.borrow_and_update().updated_at();
        assert!(at.is_some());
        assert!(at >= last);
        last = at;
    }

    assert!(relay.metrics().summary().total_updates >= 3);
    relay.stop().await;
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut config = AppConfig::default();
    config.source.symbols.clear();

    assert!(matches!(PriceRelay::new(config), Err(Error::ConfigError(_))));
}
