//! In-process fallback store backed by `DashMap`.
//!
//! Expiry is enforced twice: lazily on read, and by a periodic sweep that
//! purges entries nobody reads again. Prefix deletes scan the whole map.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;

use super::backend::{CacheStore, StoreSnapshot, clamp_ttl, pattern_prefix};
use super::error::CacheError;

/// A cached payload with its absolute expiry.
///
/// The data is wrapped in `Arc` so hits only bump a reference count.
#[derive(Clone, Debug)]
struct LocalEntry {
    data: Arc<Vec<u8>>,
    /// `None` when the deadline is past what `Instant` can represent
    expires_at: Option<Instant>,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

pub struct LocalStore {
    entries: Arc<DashMap<String, LocalEntry>>,
    sweeper: Option<JoinHandle<()>>,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore {
    /// Create a store without a background sweep (expiry on read only).
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            sweeper: None,
        }
    }

    /// Create a store and start its expiry sweep on the current tokio runtime.
    ///
    /// The sweep task is aborted when the store is dropped.
    pub fn with_sweeper(interval: Duration) -> Self {
        let entries = Arc::new(DashMap::new());
        let sweeper = spawn_sweeper(Arc::clone(&entries), interval);
        Self {
            entries,
            sweeper: Some(sweeper),
        }
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        sweep(&self.entries)
    }

    /// Number of entries held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
    }
}

fn sweep(entries: &DashMap<String, LocalEntry>) -> usize {
    let now = Instant::now();
    let mut removed = 0;
    entries.retain(|_, entry| {
        if entry.is_expired(now) {
            removed += 1;
            false
        } else {
            true
        }
    });
    removed
}

fn spawn_sweeper(entries: Arc<DashMap<String, LocalEntry>>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = sweep(&entries);
            if removed > 0 {
                tracing::debug!(removed, remaining = entries.len(), "local cache sweep");
            }
        }
    })
}

#[async_trait]
impl CacheStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>, CacheError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(Arc::clone(&entry.data)));
            }
            // Release the read guard before removing
            drop(entry);
            // A concurrent set may have replaced the entry meanwhile; keep it if so.
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        if ttl.is_zero() {
            self.entries.remove(key);
            return Ok(());
        }
        let entry = LocalEntry {
            data: Arc::new(value),
            expires_at: Instant::now().checked_add(clamp_ttl(ttl)),
        };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete_exact(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_by_prefix(&self, pattern: &str) -> Result<u64, CacheError> {
        let prefix = pattern_prefix(pattern)?;
        let mut removed = 0u64;
        self.entries.retain(|key, _| {
            if key.starts_with(prefix) {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn size_and_enumerate(&self) -> Result<StoreSnapshot, CacheError> {
        let now = Instant::now();
        let keys = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        Ok(StoreSnapshot::from_keys(keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_get_set() {
        let store = LocalStore::new();
        store.set("user:1:budgets", b"[1,2]".to_vec(), MINUTE).await.unwrap();

        let value = store.get("user:1:budgets").await.unwrap();
        assert_eq!(value, Some(Arc::new(b"[1,2]".to_vec())));
        assert!(store.get("user:2:budgets").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_twice_overwrites() {
        let store = LocalStore::new();
        store.set("k", b"v".to_vec(), MINUTE).await.unwrap();
        store.set("k", b"v".to_vec(), MINUTE).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(Arc::new(b"v".to_vec())));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_expiration_on_read() {
        let store = LocalStore::new();
        store.set("k", b"v".to_vec(), Duration::from_millis(30)).await.unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.get("k").await.unwrap().is_none());
        // Evicted by the read itself
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_zero_ttl_removes() {
        let store = LocalStore::new();
        store.set("k", b"v".to_vec(), MINUTE).await.unwrap();
        store.set("k", b"w".to_vec(), Duration::ZERO).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_huge_ttl_is_stored_without_overflow() {
        let store = LocalStore::new();
        store
            .set("k", b"v".to_vec(), Duration::from_secs(u64::MAX))
            .await
            .unwrap();
        store.set("max", b"m".to_vec(), Duration::MAX).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(Arc::new(b"v".to_vec())));
        assert!(store.get("max").await.unwrap().is_some());
        assert_eq!(store.sweep_expired(), 0);
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let store = LocalStore::new();
        for i in 0..3 {
            store
                .set(&format!("short-{i}"), vec![i], Duration::from_millis(10))
                .await
                .unwrap();
        }
        store.set("long", vec![9], MINUTE).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.sweep_expired(), 3);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_background_sweeper_purges_unread_entries() {
        let store = LocalStore::with_sweeper(Duration::from_millis(20));
        store.set("k", b"v".to_vec(), Duration::from_millis(10)).await.unwrap();
        assert_eq!(store.len(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_delete_by_prefix_is_scoped() {
        let store = LocalStore::new();
        for key in [
            "user:1:budgets",
            "user:1:budgets:limit=10",
            "user:1:categories",
            "user:2:budgets:limit=10",
            "user:10:budgets",
        ] {
            store.set(key, b"x".to_vec(), MINUTE).await.unwrap();
        }

        let removed = store.delete_by_prefix("user:1:budgets*").await.unwrap();
        assert_eq!(removed, 2);

        let snapshot = store.size_and_enumerate().await.unwrap();
        assert_eq!(
            snapshot.keys,
            vec!["user:10:budgets", "user:1:categories", "user:2:budgets:limit=10"]
        );

        let removed = store.delete_by_prefix("user:1:*").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.size_and_enumerate().await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_delete_by_prefix_rejects_mid_wildcards() {
        let store = LocalStore::new();
        assert!(matches!(
            store.delete_by_prefix("user:*:budgets*").await,
            Err(CacheError::InvalidPattern(_))
        ));
        assert!(store.delete_by_prefix("user:1:budgets").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_exact() {
        let store = LocalStore::new();
        store.set("a", b"1".to_vec(), MINUTE).await.unwrap();
        store.set("ab", b"2".to_vec(), MINUTE).await.unwrap();

        store.delete_exact("a").await.unwrap();
        store.delete_exact("missing").await.unwrap();

        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("ab").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_enumerate_hides_expired() {
        let store = LocalStore::new();
        store.set("old", b"1".to_vec(), Duration::from_millis(10)).await.unwrap();
        store.set("new", b"2".to_vec(), MINUTE).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        let snapshot = store.size_and_enumerate().await.unwrap();
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.keys, vec!["new".to_string()]);
    }
}
