//! Backend selection with one-way demotion.
//!
//! The selector starts either on Redis (`Remote`) or on the local store
//! (`Fallback`). The first operational error from Redis demotes it to the
//! local store for the rest of the process lifetime. There is no way back
//! short of a restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::backend::{CacheStore, StoreSnapshot};
use super::error::CacheError;
use super::local::LocalStore;

const REMOTE: u8 = 0;
const FALLBACK: u8 = 1;

/// Which store is currently serving cache traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendHealth {
    Remote,
    Fallback,
}

impl BackendHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendHealth::Remote => "remote",
            BackendHealth::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for BackendHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct BackendSelector {
    state: AtomicU8,
    remote: Option<Arc<dyn CacheStore>>,
    local: LocalStore,
}

impl BackendSelector {
    /// Serve everything from the local store.
    pub fn local_only(local: LocalStore) -> Self {
        Self {
            state: AtomicU8::new(FALLBACK),
            remote: None,
            local,
        }
    }

    /// Serve from `remote` until it fails, then from `local`.
    pub fn with_remote(remote: Arc<dyn CacheStore>, local: LocalStore) -> Self {
        Self {
            state: AtomicU8::new(REMOTE),
            remote: Some(remote),
            local,
        }
    }

    pub fn current(&self) -> BackendHealth {
        match self.state.load(Ordering::Acquire) {
            REMOTE => BackendHealth::Remote,
            _ => BackendHealth::Fallback,
        }
    }

    /// Switch permanently to the local store.
    ///
    /// Returns `true` only for the caller that performed the transition, so
    /// concurrent failures log and count the demotion once.
    pub fn demote_to_fallback(&self, reason: &dyn std::fmt::Display) -> bool {
        let demoted = self
            .state
            .compare_exchange(REMOTE, FALLBACK, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if demoted {
            tracing::warn!(
                reason = %reason,
                "Redis cache backend failed; switching to local cache until restart"
            );
            crate::metrics::record_backend_demotion();
        }
        demoted
    }

    fn active(&self) -> (BackendHealth, &dyn CacheStore) {
        match (self.current(), &self.remote) {
            (BackendHealth::Remote, Some(remote)) => (BackendHealth::Remote, remote.as_ref()),
            _ => (BackendHealth::Fallback, &self.local as &dyn CacheStore),
        }
    }

    /// Demote if `result` is an operational failure of the remote store.
    fn observe<T>(&self, served_by: BackendHealth, result: Result<T, CacheError>) -> Result<T, CacheError> {
        if let Err(e) = &result {
            if served_by == BackendHealth::Remote && e.is_operational() {
                self.demote_to_fallback(e);
            }
        }
        result
    }

    pub async fn get(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>, CacheError> {
        let (served_by, store) = self.active();
        let result = store.get(key).await;
        self.observe(served_by, result)
    }

    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let (served_by, store) = self.active();
        let result = store.set(key, value, ttl).await;
        self.observe(served_by, result)
    }

    pub async fn delete_exact(&self, key: &str) -> Result<(), CacheError> {
        let (served_by, store) = self.active();
        let result = store.delete_exact(key).await;
        self.observe(served_by, result)
    }

    pub async fn delete_by_prefix(&self, pattern: &str) -> Result<u64, CacheError> {
        let (served_by, store) = self.active();
        let result = store.delete_by_prefix(pattern).await;
        self.observe(served_by, result)
    }

    pub async fn size_and_enumerate(&self) -> Result<StoreSnapshot, CacheError> {
        let (served_by, store) = self.active();
        let result = store.size_and_enumerate().await;
        self.observe(served_by, result)
    }

    /// Name of the store that would serve the next call.
    pub fn active_store_name(&self) -> &'static str {
        self.active().1.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Redis stand-in whose every call fails.
    #[derive(Default)]
    struct DownStore {
        calls: AtomicUsize,
    }

    impl DownStore {
        fn fail<T>(&self) -> Result<T, CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::Pool("connection refused".into()))
        }
    }

    #[async_trait]
    impl CacheStore for DownStore {
        fn name(&self) -> &'static str {
            "down"
        }
        async fn get(&self, _: &str) -> Result<Option<Arc<Vec<u8>>>, CacheError> {
            self.fail()
        }
        async fn set(&self, _: &str, _: Vec<u8>, _: Duration) -> Result<(), CacheError> {
            self.fail()
        }
        async fn delete_exact(&self, _: &str) -> Result<(), CacheError> {
            self.fail()
        }
        async fn delete_by_prefix(&self, _: &str) -> Result<u64, CacheError> {
            self.fail()
        }
        async fn size_and_enumerate(&self) -> Result<StoreSnapshot, CacheError> {
            self.fail()
        }
    }

    #[tokio::test]
    async fn test_local_only_reports_fallback() {
        let selector = BackendSelector::local_only(LocalStore::new());
        assert_eq!(selector.current(), BackendHealth::Fallback);
        assert_eq!(selector.active_store_name(), "local");
        assert!(!selector.demote_to_fallback(&"noop"));
    }

    #[tokio::test]
    async fn test_remote_failure_demotes_once() {
        let remote = Arc::new(DownStore::default());
        let selector = BackendSelector::with_remote(remote.clone(), LocalStore::new());
        assert_eq!(selector.current(), BackendHealth::Remote);

        // First failure is reported as an error and demotes
        assert!(selector.get("user:1:budgets").await.is_err());
        assert_eq!(selector.current(), BackendHealth::Fallback);

        // Later calls never touch the remote store again
        selector
            .set("user:1:budgets", b"[]".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        let value = selector.get("user:1:budgets").await.unwrap();
        assert_eq!(value, Some(Arc::new(b"[]".to_vec())));
        assert_eq!(selector.delete_by_prefix("user:1:*").await.unwrap(), 1);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert!(!selector.demote_to_fallback(&"again"));
    }

    #[tokio::test]
    async fn test_bad_pattern_does_not_demote() {
        let selector = BackendSelector::with_remote(Arc::new(LocalStore::new()), LocalStore::new());
        assert!(selector.delete_by_prefix("user:*:x*").await.is_err());
        assert_eq!(selector.current(), BackendHealth::Remote);
    }

    #[tokio::test]
    async fn test_concurrent_demotion_has_single_winner() {
        let selector = Arc::new(BackendSelector::with_remote(
            Arc::new(DownStore::default()),
            LocalStore::new(),
        ));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let selector = Arc::clone(&selector);
            handles.push(tokio::spawn(async move { selector.demote_to_fallback(&"boom") }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(selector.current(), BackendHealth::Fallback);
    }

    #[test]
    fn test_health_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&BackendHealth::Remote).unwrap(), "\"remote\"");
        assert_eq!(BackendHealth::Fallback.to_string(), "fallback");
    }
}
