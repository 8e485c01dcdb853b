//! Counter cache backing the quota and bandwidth ledgers.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use moka::future::Cache;
use moka::Expiry;
use redis::AsyncCommands;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache connection error: {0}")]
    Connection(String),
    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// Integer counters with optional expiry.
#[async_trait]
pub trait CounterCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<i64>, CacheError>;
    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), CacheError>;
    /// Add `delta` (missing keys start at 0) and return the new value.
    /// A `ttl` refreshes the key's expiry.
    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>)
        -> Result<i64, CacheError>;
}

// ============================================================================
// Redis
// ============================================================================

pub struct RedisCache {
    pool: Pool,
    prefix: String,
}

impl RedisCache {
    pub fn new(
        url: &str,
        prefix: &str,
        pool_size: usize,
        timeout: Duration,
    ) -> Result<Self, CacheError> {
        let pool = Config::from_url(url)
            .builder()
            .map(|b| {
                b.max_size(pool_size)
                    .wait_timeout(Some(timeout))
                    .create_timeout(Some(timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| CacheError::Connection(e.to_string()))?
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))
    }
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl CounterCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<i64>, CacheError> {
        let mut conn = self.conn().await?;
        conn.get(self.key(key))
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let key = self.key(key);
        let result: redis::RedisResult<()> = match ttl {
            Some(ttl) => {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl_ms(ttl))
                    .query_async(&mut conn)
                    .await
            }
            None => conn.set(&key, value).await,
        };
        result.map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn incr(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, CacheError> {
        let mut conn = self.conn().await?;
        let key = self.key(key);

        let mut pipe = redis::pipe();
        pipe.atomic().cmd("INCRBY").arg(&key).arg(delta);
        if let Some(ttl) = ttl {
            pipe.cmd("PEXPIRE").arg(&key).arg(ttl_ms(ttl)).ignore();
        }
        let (value,): (i64,) = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(value)
    }
}

// ============================================================================
// In-process
// ============================================================================

/// How a write affects the counter's expiry, mirroring Redis: `SET` without
/// a TTL clears it, `INCRBY` keeps it.
#[derive(Debug, Clone, Copy)]
enum Ttl {
    Keep,
    Never,
    After(Duration),
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: i64,
    ttl: Ttl,
}

struct CounterExpiry;

impl Expiry<String, Counter> for CounterExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        counter: &Counter,
        _created_at: Instant,
    ) -> Option<Duration> {
        match counter.ttl {
            Ttl::After(ttl) => Some(ttl),
            Ttl::Keep | Ttl::Never => None,
        }
    }

    fn expire_after_update(
        &self,
        _key: &String,
        counter: &Counter,
        _updated_at: Instant,
        remaining: Option<Duration>,
    ) -> Option<Duration> {
        match counter.ttl {
            Ttl::After(ttl) => Some(ttl),
            Ttl::Keep => remaining,
            Ttl::Never => None,
        }
    }
}

/// Single-process counters; used when no Redis is configured and in tests.
/// Expired counters are evicted, so old bandwidth periods do not pile up.
pub struct MemoryCache {
    entries: Cache<String, Counter>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self {
            entries: Cache::builder().expire_after(CounterExpiry).build(),
        }
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live counters, after evicting expired ones.
    pub async fn live_entries(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }
}

#[async_trait]
impl CounterCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<i64>, CacheError> {
        Ok(self.entries.get(key).await.map(|c| c.value))
    }

    async fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), CacheError> {
        let ttl = ttl.map(Ttl::After).unwrap_or(Ttl::Never);
        self.entries
            .insert(key.to_string(), Counter { value, ttl })
            .await;
        Ok(())
    }

    async fn incr(
        &self,
        key: &str,
        delta: i64,
        ttl: Option<Duration>,
    ) -> Result<i64, CacheError> {
        let ttl = ttl.map(Ttl::After).unwrap_or(Ttl::Keep);
        let entry = self
            .entries
            .entry_by_ref(key)
            .and_upsert_with(|current| async move {
                let value = current.map(|e| e.into_value().value).unwrap_or(0) + delta;
                Counter { value, ttl }
            })
            .await;
        Ok(entry.into_value().value)
    }
}
