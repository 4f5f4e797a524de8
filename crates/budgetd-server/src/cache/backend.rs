//! Storage contract shared by the Redis store and the local fallback store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::error::CacheError;

/// Key-value storage for opaque cached payloads.
///
/// Implementations own their entries exclusively; a payload written to one
/// store is never visible through another.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short backend name for logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Get a payload. Expired entries are reported as absent.
    async fn get(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>, CacheError>;

    /// Store a payload that expires after `ttl`. A zero TTL removes the key.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Remove a single key. Missing keys are not an error.
    async fn delete_exact(&self, key: &str) -> Result<(), CacheError>;

    /// Remove every key starting with the pattern's prefix.
    ///
    /// `pattern` must end with a single `*` and contain no other `*`,
    /// e.g. `user:1:budgets:*` or `user:1:*`. Returns the number of keys removed.
    async fn delete_by_prefix(&self, pattern: &str) -> Result<u64, CacheError>;

    /// Count and list all live keys. Diagnostic only.
    async fn size_and_enumerate(&self) -> Result<StoreSnapshot, CacheError>;
}

/// Keys currently held by a store.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub count: usize,
    pub keys: Vec<String>,
}

impl StoreSnapshot {
    pub fn from_keys(mut keys: Vec<String>) -> Self {
        keys.sort();
        Self {
            count: keys.len(),
            keys,
        }
    }
}

/// Longest TTL a store keeps an entry for. Longer TTLs are clamped.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.min(MAX_TTL)
}

/// Literal prefix of a trailing-wildcard pattern.
pub fn pattern_prefix(pattern: &str) -> Result<&str, CacheError> {
    match pattern.strip_suffix('*') {
        Some(prefix) if !prefix.contains('*') => Ok(prefix),
        _ => Err(CacheError::InvalidPattern(pattern.to_string())),
    }
}
