//! Response caching middleware for tenant-scoped GET routes.
//!
//! ```text
//! GET + tenant → derive key → backend hit?  ── yes → stored response (x-cache: HIT)
//!                                  │
//!                                  no → handler → 2xx? → store, respond (x-cache: MISS)
//! ```
//!
//! Anything else (other methods, no tenant, a key that cannot be derived)
//! goes straight to the handler. Backend errors count as misses.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, HttpBody};
use axum::extract::{FromRequestParts, RawPathParams, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use super::Cache;
use super::error::CacheError;
use super::key::{CacheParams, TenantId};

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Per-route caching configuration supplied at route registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRoute {
    endpoint: String,
    ttl: Duration,
}

impl CacheRoute {
    pub fn new(endpoint: impl Into<String>, ttl_secs: u64) -> Self {
        Self::with_ttl(endpoint, Duration::from_secs(ttl_secs))
    }

    pub fn with_ttl(endpoint: impl Into<String>, ttl: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            ttl,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// State for [`cache_gate`]: the shared cache plus one route's settings.
#[derive(Clone)]
pub struct CacheGate {
    cache: Cache,
    route: Arc<CacheRoute>,
}

impl CacheGate {
    pub fn new(cache: Cache, route: CacheRoute) -> Self {
        Self {
            cache,
            route: Arc::new(route),
        }
    }

    pub fn route(&self) -> &CacheRoute {
        &self.route
    }

    async fn lookup(&self, key: &str) -> Option<Response> {
        let data = match self.cache.backend().get(key).await {
            Ok(Some(data)) => data,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "cache lookup failed, treating as miss");
                return None;
            }
        };

        match CachedResponse::decode(&data) {
            Ok(cached) => {
                tracing::debug!(key = %key, "cache hit");
                Some(cached.into_response())
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "dropping undecodable cache entry");
                if let Err(e) = self.cache.backend().delete_exact(key).await {
                    tracing::debug!(key = %key, error = %e, "failed to drop cache entry");
                }
                None
            }
        }
    }

    /// Persist a successful response and hand it back unchanged.
    async fn store(&self, key: &str, response: Response) -> Response {
        if !response.status().is_success() {
            return response;
        }

        let limit = self.cache.max_payload_bytes();
        let size = match response.body().size_hint().exact() {
            Some(size) if size as usize <= limit => size as usize,
            _ => {
                tracing::debug!(key = %key, limit, "response body unbounded or too large, not cached");
                return with_cache_header(response, "MISS");
            }
        };

        let (mut parts, body) = response.into_parts();
        let bytes = match axum::body::to_bytes(body, size).await {
            Ok(bytes) => bytes,
            Err(e) => {
                // The body is gone; keep the handler's status and headers.
                tracing::warn!(key = %key, error = %e, "failed to read response body, not cached");
                parts.headers.remove(header::CONTENT_LENGTH);
                parts.headers.insert(X_CACHE, HeaderValue::from_static("MISS"));
                return Response::from_parts(parts, Body::empty());
            }
        };

        let cached = CachedResponse {
            status: parts.status.as_u16(),
            content_type: parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned),
            body: bytes.to_vec(),
        };
        let stored = match cached.encode() {
            Ok(encoded) => self.cache.backend().set(key, encoded, self.route.ttl()).await,
            Err(e) => Err(e),
        };
        match stored {
            Ok(()) => {
                tracing::debug!(key = %key, ttl_secs = self.route.ttl().as_secs(), "cache set");
                crate::metrics::record_cache_store(self.route.endpoint());
            }
            Err(e) => tracing::warn!(key = %key, error = %e, "cache store failed"),
        }

        parts.headers.insert(X_CACHE, HeaderValue::from_static("MISS"));
        Response::from_parts(parts, Body::from(bytes))
    }
}

/// Middleware: serve GET responses from the cache, or cache what the handler returns.
///
/// Attach with `axum::middleware::from_fn_with_state(gate, cache_gate)` on
/// the method router of a cacheable route. The tenant must already be in
/// the request extensions.
pub async fn cache_gate(State(gate): State<CacheGate>, req: Request, next: Next) -> Response {
    if req.method() != Method::GET {
        return next.run(req).await;
    }
    let Some(tenant) = req.extensions().get::<TenantId>().cloned() else {
        return next.run(req).await;
    };

    let (mut parts, body) = req.into_parts();
    let params = request_params(&mut parts).await;
    let req = Request::from_parts(parts, body);

    let endpoint = gate.route().endpoint();
    let key = match gate.cache.keys().derive(&tenant, endpoint, &params) {
        Ok(key) => key,
        Err(e) => {
            tracing::debug!(endpoint = %endpoint, error = %e, "no cache key, bypassing cache");
            return next.run(req).await;
        }
    };

    if let Some(response) = gate.lookup(&key).await {
        crate::metrics::record_cache_hit(endpoint);
        return response;
    }
    crate::metrics::record_cache_miss(endpoint);

    let response = next.run(req).await;
    gate.store(&key, response).await
}

/// Query parameters merged with path parameters (path wins on name clashes).
async fn request_params(parts: &mut Parts) -> CacheParams {
    let mut params = CacheParams::new();
    if let Some(query) = parts.uri.query() {
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params.append(name, &value);
        }
    }
    if let Ok(path) = RawPathParams::from_request_parts(parts, &()).await {
        for (name, value) in &path {
            params.insert(name, value);
        }
    }
    params
}

fn with_cache_header(mut response: Response, value: &'static str) -> Response {
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static(value));
    response
}

/// What the gate keeps for a response: enough to replay it byte for byte.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct CachedResponse {
    status: u16,
    content_type: Option<String>,
    body: Vec<u8>,
}

impl CachedResponse {
    fn encode(&self) -> Result<Vec<u8>, CacheError> {
        rmp_serde::to_vec(self).map_err(|e| CacheError::Codec(e.to_string()))
    }

    fn decode(data: &[u8]) -> Result<Self, CacheError> {
        rmp_serde::from_slice(data).map_err(|e| CacheError::Codec(e.to_string()))
    }
}

impl IntoResponse for CachedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        if let Some(content_type) = self.content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
            response.headers_mut().insert(header::CONTENT_TYPE, content_type);
        }
        with_cache_header(response, "HIT")
    }
}
