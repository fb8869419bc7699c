use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use crate::config::{CacheBackend, CacheConfig};
use crate::error::Result;
use crate::types::price::normalize_symbol;
use crate::utils::clock::Clock;

pub const PRICE_KEY_PREFIX: &str = "crypto:price:";

/// `crypto:price:<lowercase symbol>`
pub fn price_key(symbol: &str) -> String {
    format!("{}{}", PRICE_KEY_PREFIX, normalize_symbol(symbol))
}

/// Write-through key-value layer populated by the poller and read by
/// simple endpoints that do not hold a reference to the in-process cache.
#[async_trait]
pub trait PriceStore: Send + Sync {
    async fn put_many(&self, entries: &[(String, String)], ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    fn backend(&self) -> &'static str;
}

pub struct InMemoryPriceStore {
    values: DashMap<String, (String, Instant)>,
    clock: Arc<dyn Clock>,
}

impl InMemoryPriceStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        InMemoryPriceStore {
            values: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl PriceStore for InMemoryPriceStore {
    async fn put_many(&self, entries: &[(String, String)], ttl: Duration) -> Result<()> {
        let expires_at = self.clock.now() + ttl;
        for (key, value) in entries {
            self.values.insert(key.clone(), (value.clone(), expires_at));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let expired = match self.values.get(key) {
            Some(entry) if entry.1 > now => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.values.remove(key);
        }
        Ok(None)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

pub struct RedisPriceStore {
    client: redis::Client,
    connection: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisPriceStore {
    pub fn new(redis_url: &str) -> Result<Self> {
        Ok(RedisPriceStore {
            client: redis::Client::open(redis_url)?,
            connection: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        tracing::info!("Connected to Redis price store");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_connection(&self) {
        *self.connection.lock().await = None;
    }
}

#[async_trait]
impl PriceStore for RedisPriceStore {
    async fn put_many(&self, entries: &[(String, String)], ttl: Duration) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            pipe.set_ex(key, value, ttl.as_secs().max(1)).ignore();
        }
        let result: redis::RedisResult<()> = pipe.query_async(&mut conn).await;
        if result.is_err() {
            self.reset_connection().await;
        }
        Ok(result?)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<Option<String>> = conn.get(key).await;
        if result.is_err() {
            self.reset_connection().await;
        }
        Ok(result?)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

pub fn build_store(config: &CacheConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn PriceStore>> {
    let store: Arc<dyn PriceStore> = match config.backend {
        CacheBackend::Memory => Arc::new(InMemoryPriceStore::new(clock)),
        CacheBackend::Redis => Arc::new(RedisPriceStore::new(&config.redis_url)?),
    };
    tracing::info!("Price store backend: {}", store.backend());
    Ok(store)
}
