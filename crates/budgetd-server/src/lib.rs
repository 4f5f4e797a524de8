pub mod budgets;
pub mod cache;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod server;

pub use cache::{BackendHealth, BackendSelector, Cache, CacheGate, CacheRoute, Invalidator, KeyDeriver, TenantId};
pub use config::{AppConfig, AuthConfig, CacheConfig, RedisConfig, ServerConfig};
pub use observability::init_tracing;
pub use server::{AppState, BudgetdServer, ServerBuilder, build_app};

use cache::{LocalStore, RedisStore};

/// Create the response cache based on configuration.
///
/// ## Cache Modes
///
/// - **Redis disabled**: local-only cache (DashMap)
/// - **Redis enabled**: connect to Redis with bounded retry, fall back to local on failure
///
/// ## Graceful Degradation
///
/// If Redis cannot be reached within the retry budget, the server starts on
/// the local store and stays there. The returned cache always works.
pub async fn create_cache(cfg: &AppConfig) -> Cache {
    let keys = KeyDeriver::new(cfg.cache.key_namespace.clone()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "invalid cache key namespace, using the default");
        KeyDeriver::default()
    });
    let local = LocalStore::with_sweeper(cfg.cache.sweep_interval());

    let backend = if cfg.redis.enabled {
        tracing::info!(url = %cfg.redis.url, "Connecting to Redis");
        match RedisStore::connect(
            &cfg.redis.url,
            cfg.redis.pool_size,
            cfg.redis.timeout(),
            cfg.redis.scan_count,
            &cfg.redis.connect_policy(),
        )
        .await
        {
            Ok(store) => {
                tracing::info!("Connected to Redis");
                BackendSelector::with_remote(std::sync::Arc::new(store), local)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to connect to Redis. Falling back to local cache.");
                BackendSelector::local_only(local)
            }
        }
    } else {
        tracing::info!("Redis disabled, using local cache only");
        BackendSelector::local_only(local)
    };

    Cache::new(keys, backend).with_max_payload_bytes(cfg.cache.max_payload_bytes)
}
