use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use price_relay::config::AppConfig;
use price_relay::core::PriceRelay;
use price_relay::observability::tracing::init_tracing;

const TASK_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
    let config = AppConfig::load(&env).context("failed to load configuration")?;
    init_tracing(&config.logging);

    let bind_addr = config.server.bind_addr.clone();
    let relay = Arc::new(PriceRelay::new(config).context("failed to build relay")?);
    relay.start().await?;

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    tracing::info!("Listening on {} (env: {})", bind_addr, env);

    let shutdown = relay.shutdown_token();
    let server = axum::serve(listener, relay.router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    let server = tokio::spawn(async move { server.await });

    let mut task_check = tokio::time::interval(TASK_CHECK_INTERVAL);
    task_check.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = task_check.tick() => {
                if let Err(e) = relay.check_tasks().await {
                    tracing::error!("Background task failure, shutting down: {}", e);
                    break;
                }
            }
        }
    }

    relay.stop().await;
    server.await.context("server task panicked")??;
    Ok(())
}
