//! Fixed-window per-client rate limiting.
//!
//! Each client gets a counter that lives for one 60 second window. The first
//! request of a window creates the counter with a 60 second expiry; later
//! requests are denied once the counter reaches the limit, otherwise the
//! counter is incremented. Bursts of up to twice the limit are possible
//! across a window boundary.
//!
//! The limiter is fail-open: a missing, unreachable or slow counter store
//! never blocks a request.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{CounterBackend, RateLimitConfig};

/// Length of one counting window.
pub const WINDOW_SECS: u64 = 60;

const KEY_PREFIX: &str = "rate_limit:";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("counter store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Shared counter storage. Implementations must make `incr` atomic for a
/// single key; the limiter adds no locking of its own.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    async fn set_ex(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError>;

    async fn incr(&self, key: &str) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    fn backend(&self) -> &'static str;
}

/// Redis-backed counters over a shared, auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl RedisCounterStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1u64).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Process-local counters with the same expiry semantics as Redis.
///
/// Only suitable for a single gateway instance; counters are not shared
/// across replicas.
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, (u64, Option<Instant>)>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn live(entry: &(u64, Option<Instant>), now: Instant) -> bool {
    entry.1.map_or(true, |expires| expires > now)
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if live(entry, now) => Ok(Some(entry.0)),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        // Every new window passes through here, so expired clients are swept
        // at the same rate they arrive.
        entries.retain(|_, entry| live(entry, now));
        entries.insert(key.to_string(), (value, Some(now + ttl)));
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        // A counter that never went through `set_ex` still expires with the window.
        let fresh = (0, Some(now + Duration::from_secs(WINDOW_SECS)));
        let entry = entries.entry(key.to_string()).or_insert(fresh);
        if !live(entry, now) {
            *entry = fresh;
        }
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied { retry_after_secs: u64 },
}

/// Counter store availability, as reported by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Connected,
    Disabled,
    Unavailable,
}

impl StoreStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreStatus::Connected => "connected",
            StoreStatus::Disabled => "disabled",
            StoreStatus::Unavailable => "unavailable",
        }
    }
}

enum Backing {
    Disabled,
    /// Configured but could not be reached at startup.
    Unavailable,
    Active(Arc<dyn CounterStore>),
}

pub struct RateLimiter {
    backing: Backing,
    limit: u64,
    store_timeout: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, limit: u64, store_timeout: Duration) -> Self {
        Self {
            backing: Backing::Active(store),
            limit,
            store_timeout,
        }
    }

    pub fn disabled(limit: u64) -> Self {
        Self {
            backing: Backing::Disabled,
            limit,
            store_timeout: Duration::ZERO,
        }
    }

    /// Build the limiter described by `config`, connecting to Redis if needed.
    ///
    /// A Redis that cannot be reached leaves the limiter in fail-open mode
    /// instead of failing startup.
    pub async fn from_config(config: &RateLimitConfig) -> Self {
        let store_timeout = Duration::from_millis(config.store_timeout_ms);
        if !config.enabled {
            tracing::info!("Rate limiting disabled by configuration");
            return Self::disabled(config.per_minute);
        }

        match config.backend {
            CounterBackend::Memory => Self::new(
                Arc::new(MemoryCounterStore::new()),
                config.per_minute,
                store_timeout,
            ),
            CounterBackend::Redis => {
                let connect = RedisCounterStore::connect(&config.redis_url);
                match tokio::time::timeout(Duration::from_secs(5), connect).await {
                    Ok(Ok(store)) => {
                        tracing::info!(limit = config.per_minute, "Rate limiter connected to Redis");
                        Self::new(Arc::new(store), config.per_minute, store_timeout)
                    }
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "Redis connection failed, rate limiting will fail open");
                        Self::unavailable(config.per_minute)
                    }
                    Err(_) => {
                        tracing::error!("Redis connection timed out, rate limiting will fail open");
                        Self::unavailable(config.per_minute)
                    }
                }
            }
        }
    }

    fn unavailable(limit: u64) -> Self {
        Self {
            backing: Backing::Unavailable,
            limit,
            store_timeout: Duration::ZERO,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Decide whether `client_key` may make another request in this window.
    /// Store failures are logged and allow the request.
    pub async fn allow(&self, client_key: &str) -> RateDecision {
        let store = match &self.backing {
            Backing::Active(store) => store.as_ref(),
            Backing::Disabled => return RateDecision::Allowed,
            Backing::Unavailable => {
                tracing::warn!("Counter store unavailable, skipping rate limiting");
                return RateDecision::Allowed;
            }
        };

        match self.check(store, client_key).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    client = %client_key,
                    backend = store.backend(),
                    "Rate limiting error, allowing request"
                );
                RateDecision::Allowed
            }
        }
    }

    async fn check(
        &self,
        store: &dyn CounterStore,
        client_key: &str,
    ) -> Result<RateDecision, StoreError> {
        let key = format!("{KEY_PREFIX}{client_key}");

        match self.bounded(store.get(&key)).await? {
            None => {
                self.bounded(store.set_ex(&key, 1, Duration::from_secs(WINDOW_SECS)))
                    .await?;
                Ok(RateDecision::Allowed)
            }
            Some(count) if count >= self.limit => {
                tracing::warn!(
                    client = %client_key,
                    count = count,
                    limit = self.limit,
                    "Rate limit exceeded"
                );
                Ok(RateDecision::Denied {
                    retry_after_secs: WINDOW_SECS,
                })
            }
            Some(_) => {
                self.bounded(store.incr(&key)).await?;
                Ok(RateDecision::Allowed)
            }
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.store_timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.store_timeout))?
    }

    pub async fn status(&self) -> StoreStatus {
        match &self.backing {
            Backing::Disabled => StoreStatus::Disabled,
            Backing::Unavailable => StoreStatus::Unavailable,
            Backing::Active(store) => match self.bounded(store.ping()).await {
                Ok(()) => StoreStatus::Connected,
                Err(_) => StoreStatus::Unavailable,
            },
        }
    }
}

/// Identity used as the rate-limit key: the first `X-Forwarded-For` entry
/// when present, otherwise the peer address.
pub fn client_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}
