//! Redis store.
//!
//! TTLs are enforced by Redis itself (`PSETEX`). Prefix deletes enumerate
//! with `SCAN MATCH` and then `DEL` each batch. The two steps are not atomic:
//! a key written between a scan page and its delete can survive, and only
//! its TTL bounds how long.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;

use super::backend::{CacheStore, StoreSnapshot, clamp_ttl, pattern_prefix};
use super::error::CacheError;

/// Bounds for establishing the initial Redis connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_total: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            max_total: Duration::from_secs(10),
        }
    }
}

/// Run `op` until it succeeds or one of the policy's caps is hit.
///
/// Backoff doubles after each failure up to `max_backoff`. A retry is not
/// attempted if its sleep would push the total past `max_total`. On failure
/// returns the number of attempts made and the last error.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &ConnectPolicy, mut op: F) -> Result<T, (u32, E)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let out_of_attempts = attempt >= policy.max_attempts.max(1);
                let out_of_time = started.elapsed() + backoff > policy.max_total;
                if out_of_attempts || out_of_time {
                    return Err((attempt, e));
                }
                tracing::info!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Redis not reachable yet, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
            }
        }
    }
}

pub struct RedisStore {
    pool: Pool,
    scan_count: usize,
}

impl RedisStore {
    pub fn new(pool: Pool, scan_count: usize) -> Self {
        Self {
            pool,
            scan_count: scan_count.max(1),
        }
    }

    /// Build a pool for `url` and wait until Redis answers `PING`,
    /// within the bounds of `policy`.
    pub async fn connect(
        url: &str,
        pool_size: usize,
        timeout: Duration,
        scan_count: usize,
        policy: &ConnectPolicy,
    ) -> Result<Self, CacheError> {
        let mut redis_config = deadpool_redis::Config::from_url(url);
        let mut pool_config = deadpool_redis::PoolConfig::new(pool_size.max(1));
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| CacheError::Connect {
                attempts: 0,
                reason: e.to_string(),
            })?;

        let store = Self::new(pool, scan_count);
        retry_with_backoff(policy, || store.ping())
            .await
            .map_err(|(attempts, e)| CacheError::Connect {
                attempts,
                reason: e.to_string(),
            })?;

        Ok(store)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Collect all keys matching a Redis glob pattern.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.pool.get().await?;
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(self.scan_count)
                .query_async(&mut conn)
                .await?;
            found.extend(keys);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        // SCAN may return a key more than once
        found.sort();
        found.dedup();
        Ok(found)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>, CacheError> {
        let mut conn = self.pool.get().await?;
        let data: Option<Vec<u8>> = conn.get(key).await?;
        Ok(data.map(Arc::new))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        let ttl_ms = ttl_millis(ttl);
        if ttl_ms == 0 {
            conn.del::<_, ()>(key).await?;
        } else {
            conn.pset_ex::<_, _, ()>(key, value, ttl_ms).await?;
        }
        Ok(())
    }

    async fn delete_exact(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.pool.get().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn delete_by_prefix(&self, pattern: &str) -> Result<u64, CacheError> {
        let prefix = pattern_prefix(pattern)?;
        let keys = self.scan(&format!("{}*", escape_glob(prefix))).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.pool.get().await?;
        let mut removed = 0u64;
        for batch in keys.chunks(self.scan_count) {
            let deleted: u64 = conn.del(batch.to_vec()).await?;
            removed += deleted;
        }
        tracing::debug!(pattern = %pattern, removed, "Redis prefix delete");
        Ok(removed)
    }

    async fn size_and_enumerate(&self) -> Result<StoreSnapshot, CacheError> {
        let keys = self.scan("*").await?;
        Ok(StoreSnapshot::from_keys(keys))
    }
}

/// Escape Redis glob metacharacters so a prefix is matched literally.
/// `PSETEX` argument for `ttl`, clamped to [`MAX_TTL`](super::backend::MAX_TTL).
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(clamp_ttl(ttl).as_millis()).unwrap_or(u64::MAX)
}

fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\' | '^' | '-') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
