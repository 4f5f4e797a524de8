use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

use crate::cache::{ConnectPolicy, DEFAULT_MAX_PAYLOAD_BYTES, KeyDeriver, MAX_TTL};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,
    /// Response cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// How the upstream gateway hands us the authenticated user
    #[serde(default)]
    pub auth: AuthConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Redis validation
        if self.redis.enabled {
            if self.redis.url.is_empty() {
                return Err("redis.enabled=true requires redis.url".into());
            }
            if self.redis.pool_size == 0 {
                return Err("redis.pool_size must be > 0".into());
            }
            if self.redis.connect_max_attempts == 0 {
                return Err("redis.connect_max_attempts must be > 0".into());
            }
        }
        // Cache validation
        KeyDeriver::new(self.cache.key_namespace.clone())
            .map_err(|e| format!("cache.key_namespace is invalid: {e}"))?;
        if self.cache.sweep_interval_secs == 0 {
            return Err("cache.sweep_interval_secs must be > 0".into());
        }
        if self.cache.default_ttl_secs == 0 || self.cache.default_ttl_secs > MAX_TTL.as_secs() {
            return Err(format!(
                "cache.default_ttl_secs must be between 1 and {}",
                MAX_TTL.as_secs()
            ));
        }
        // Auth validation
        if axum::http::HeaderName::from_bytes(self.auth.tenant_header.as_bytes()).is_err() {
            return Err("auth.tenant_header must be a valid header name".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis (gracefully degrades without it)
    /// Default: false (local cache only)
    #[serde(default)]
    pub enabled: bool,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Per-operation timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Startup connection attempts before falling back to the local cache
    #[serde(default = "default_connect_max_attempts")]
    pub connect_max_attempts: u32,

    /// First retry delay; doubles after every failed attempt
    #[serde(default = "default_connect_initial_backoff_ms")]
    pub connect_initial_backoff_ms: u64,

    /// Upper bound for a single retry delay
    #[serde(default = "default_connect_max_backoff_ms")]
    pub connect_max_backoff_ms: u64,

    /// Upper bound for the whole startup connection phase
    #[serde(default = "default_connect_max_total_ms")]
    pub connect_max_total_ms: u64,

    /// `SCAN COUNT` hint and `DEL` batch size for prefix invalidation
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_redis_pool_size() -> usize {
    10
}
fn default_redis_timeout_ms() -> u64 {
    1000
}
fn default_connect_max_attempts() -> u32 {
    5
}
fn default_connect_initial_backoff_ms() -> u64 {
    100
}
fn default_connect_max_backoff_ms() -> u64 {
    2000
}
fn default_connect_max_total_ms() -> u64 {
    10_000
}
fn default_scan_count() -> usize {
    100
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            connect_max_attempts: default_connect_max_attempts(),
            connect_initial_backoff_ms: default_connect_initial_backoff_ms(),
            connect_max_backoff_ms: default_connect_max_backoff_ms(),
            connect_max_total_ms: default_connect_max_total_ms(),
            scan_count: default_scan_count(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_policy(&self) -> ConnectPolicy {
        ConnectPolicy {
            max_attempts: self.connect_max_attempts,
            initial_backoff: Duration::from_millis(self.connect_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.connect_max_backoff_ms),
            max_total: Duration::from_millis(self.connect_max_total_ms),
        }
    }
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Disable to serve every request from the handlers
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// First segment of every cache key
    #[serde(default = "default_key_namespace")]
    pub key_namespace: String,

    /// How often the local store purges expired entries
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Responses with larger bodies are served but not cached
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// TTL for routes that do not set their own
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
}

fn default_cache_enabled() -> bool {
    true
}
fn default_key_namespace() -> String {
    crate::cache::key::DEFAULT_NAMESPACE.to_string()
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_max_payload_bytes() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}
fn default_ttl_secs() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            key_namespace: default_key_namespace(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_payload_bytes: default_max_payload_bytes(),
            default_ttl_secs: default_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Header carrying the authenticated user id, set by the auth gateway
    #[serde(default = "default_tenant_header")]
    pub tenant_header: String,
}

fn default_tenant_header() -> String {
    "x-user-id".into()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            tenant_header: default_tenant_header(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or("budgetd.toml"));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., BUDGETD__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("BUDGETD")
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
