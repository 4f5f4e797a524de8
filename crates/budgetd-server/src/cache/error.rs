//! Errors raised inside the cache layer.
//!
//! None of these ever reach an HTTP response: the gate and the invalidator
//! log them and carry on as if the cache were empty.

use super::key::KeyError;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Redis command error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis connection failed after {attempts} attempt(s): {reason}")]
    Connect { attempts: u32, reason: String },

    #[error("invalid prefix pattern '{0}': expected a single trailing '*'")]
    InvalidPattern(String),

    #[error("cache codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Key(#[from] KeyError),
}

impl CacheError {
    /// Whether the error came from talking to the backend (as opposed to
    /// a bad argument). Only these demote the remote backend.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            CacheError::Pool(_) | CacheError::Redis(_) | CacheError::Connect { .. }
        )
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        CacheError::Pool(e.to_string())
    }
}
