//! Tenant-scoped response cache.
//!
//! ## Architecture
//!
//! - **Redis store**: shared across instances, TTL enforced by Redis
//! - **Local store (DashMap)**: per-instance fallback with its own expiry sweep
//! - **Selector**: routes every call to exactly one of the two
//!
//! ```text
//! GET request → cache_gate → KeyDeriver → BackendSelector → Redis | Local
//! write       → handler    → Invalidator → BackendSelector → Redis | Local
//! ```
//!
//! ## Graceful Degradation
//!
//! If Redis is disabled or unreachable at startup, the local store serves
//! all traffic. If Redis fails later, the selector demotes to the local store
//! for good. Callers never see cache errors.

pub mod backend;
pub mod error;
pub mod gate;
pub mod invalidate;
pub mod key;
pub mod local;
pub mod remote;
pub mod selector;

use std::sync::Arc;

pub use backend::{CacheStore, MAX_TTL, StoreSnapshot};
pub use error::CacheError;
pub use gate::{CacheGate, CacheRoute, X_CACHE, cache_gate};
pub use invalidate::Invalidator;
pub use key::{CacheParams, KeyDeriver, KeyError, TenantId, derive_key};
pub use local::LocalStore;
pub use remote::{ConnectPolicy, RedisStore, retry_with_backoff};
pub use selector::{BackendHealth, BackendSelector};

/// Default upper bound for a cacheable response body (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Cheaply clonable handle shared by the gate, the invalidator and diagnostics.
#[derive(Clone)]
pub struct Cache {
    keys: Arc<KeyDeriver>,
    backend: Arc<BackendSelector>,
    max_payload_bytes: usize,
}

impl Cache {
    pub fn new(keys: KeyDeriver, backend: BackendSelector) -> Self {
        Self {
            keys: Arc::new(keys),
            backend: Arc::new(backend),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    /// Local-only cache in the default namespace, without a sweep task.
    pub fn local() -> Self {
        Self::new(KeyDeriver::default(), BackendSelector::local_only(LocalStore::new()))
    }

    pub fn with_max_payload_bytes(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    pub fn keys(&self) -> &KeyDeriver {
        &self.keys
    }

    pub fn backend(&self) -> &BackendSelector {
        &self.backend
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    pub fn health(&self) -> BackendHealth {
        self.backend.current()
    }

    pub fn invalidator(&self) -> Invalidator {
        Invalidator::new(Arc::clone(&self.keys), Arc::clone(&self.backend))
    }

    /// Middleware state for one cacheable route.
    pub fn gate(&self, endpoint: impl Into<String>, ttl_secs: u64) -> CacheGate {
        CacheGate::new(self.clone(), CacheRoute::new(endpoint, ttl_secs))
    }

    /// Live keys of one tenant in the active store.
    pub async fn tenant_snapshot(&self, tenant: &TenantId) -> StoreSnapshot {
        let Ok(pattern) = self.keys.tenant_pattern(tenant) else {
            return StoreSnapshot::default();
        };
        let Ok(prefix) = backend::pattern_prefix(&pattern) else {
            return StoreSnapshot::default();
        };
        let keys = self
            .snapshot()
            .await
            .keys
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect();
        StoreSnapshot::from_keys(keys)
    }

    /// Live keys in the active store. Empty when the store cannot be listed.
    pub async fn snapshot(&self) -> StoreSnapshot {
        match self.backend.size_and_enumerate().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "failed to enumerate cache keys");
                StoreSnapshot::default()
            }
        }
    }
}
