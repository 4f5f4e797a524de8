//! Invalidation of a tenant's cached responses after a successful write.

use std::sync::Arc;

use super::error::CacheError;
use super::key::{KeyDeriver, TenantId};
use super::selector::BackendSelector;

/// Removes cached entries on behalf of mutating handlers.
///
/// Call it only after the write has succeeded. Failures are logged and
/// swallowed; a key that survives is still bounded by its TTL.
#[derive(Clone)]
pub struct Invalidator {
    keys: Arc<KeyDeriver>,
    backend: Arc<BackendSelector>,
}

impl Invalidator {
    pub fn new(keys: Arc<KeyDeriver>, backend: Arc<BackendSelector>) -> Self {
        Self { keys, backend }
    }

    /// Drop every variant of `endpoint` for `tenant`, or everything the
    /// tenant has cached when `endpoint` is `None`.
    ///
    /// Endpoint scope covers the bare key and every `{endpoint}:` parameter
    /// variant, and nothing else: invalidating `budget` leaves `budgets` and
    /// `budget-summary` alone.
    pub async fn invalidate(&self, tenant: &TenantId, endpoint: Option<&str>) {
        let scope = endpoint.unwrap_or("*");
        match self.try_invalidate(tenant, endpoint).await {
            Ok(removed) => {
                tracing::debug!(tenant = %tenant, endpoint = %scope, removed, "cache invalidated");
                crate::metrics::record_invalidation(scope);
            }
            Err(e) => {
                tracing::warn!(
                    tenant = %tenant,
                    endpoint = %scope,
                    error = %e,
                    "cache invalidation failed"
                );
            }
        }
    }

    /// Invalidate several endpoints, e.g. a collection and its detail view.
    pub async fn invalidate_endpoints(&self, tenant: &TenantId, endpoints: &[&str]) {
        for &endpoint in endpoints {
            self.invalidate(tenant, Some(endpoint)).await;
        }
    }

    async fn try_invalidate(&self, tenant: &TenantId, endpoint: Option<&str>) -> Result<u64, CacheError> {
        match endpoint {
            Some(endpoint) => {
                let bare = self.keys.endpoint_key(tenant, endpoint)?;
                let pattern = self.keys.endpoint_pattern(tenant, endpoint)?;
                self.backend.delete_exact(&bare).await?;
                self.backend.delete_by_prefix(&pattern).await
            }
            None => {
                let pattern = self.keys.tenant_pattern(tenant)?;
                self.backend.delete_by_prefix(&pattern).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheParams, LocalStore};
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(60);

    async fn seeded() -> (Invalidator, Arc<BackendSelector>, Arc<KeyDeriver>) {
        let keys = Arc::new(KeyDeriver::default());
        let backend = Arc::new(BackendSelector::local_only(LocalStore::new()));
        for (tenant, endpoint, limit) in [
            (1u64, "budgets", None),
            (1, "budgets", Some(10)),
            (1, "budgets", Some(20)),
            (1, "budget-summary", None),
            (1, "categories", Some(10)),
            (2, "budgets", None),
            (2, "budgets", Some(10)),
            (11, "budgets", None),
        ] {
            let params = match limit {
                Some(limit) => CacheParams::new().with("limit", limit),
                None => CacheParams::new(),
            };
            let key = keys.derive(&TenantId::from(tenant), endpoint, &params).unwrap();
            backend.set(&key, b"cached".to_vec(), TTL).await.unwrap();
        }
        (
            Invalidator::new(keys.clone(), backend.clone()),
            backend,
            keys,
        )
    }

    async fn remaining(backend: &BackendSelector) -> Vec<String> {
        backend.size_and_enumerate().await.unwrap().keys
    }

    #[tokio::test]
    async fn test_invalidate_endpoint_is_scoped() {
        let (invalidator, backend, _) = seeded().await;

        invalidator.invalidate(&TenantId::from(1u64), Some("budgets")).await;

        assert_eq!(
            remaining(&backend).await,
            vec![
                "user:11:budgets",
                "user:1:budget-summary",
                "user:1:categories:limit=10",
                "user:2:budgets",
                "user:2:budgets:limit=10",
            ]
        );
    }

    #[tokio::test]
    async fn test_invalidate_whole_tenant() {
        let (invalidator, backend, _) = seeded().await;

        invalidator.invalidate(&TenantId::from(1u64), None).await;

        assert_eq!(
            remaining(&backend).await,
            vec!["user:11:budgets", "user:2:budgets", "user:2:budgets:limit=10"]
        );
    }

    #[tokio::test]
    async fn test_invalidate_endpoints() {
        let (invalidator, backend, keys) = seeded().await;
        let tenant = TenantId::from(1u64);

        invalidator
            .invalidate_endpoints(&tenant, &["budgets", "budget-summary"])
            .await;

        let bare = keys.endpoint_key(&tenant, "budget-summary").unwrap();
        assert!(backend.get(&bare).await.unwrap().is_none());
        assert_eq!(remaining(&backend).await.len(), 4);
    }

    #[tokio::test]
    async fn test_invalid_tenant_is_absorbed() {
        let (invalidator, backend, _) = seeded().await;

        invalidator.invalidate(&TenantId::new(""), None).await;
        invalidator.invalidate(&TenantId::new("1:*"), Some("budgets")).await;

        assert_eq!(remaining(&backend).await.len(), 8);
    }
}
