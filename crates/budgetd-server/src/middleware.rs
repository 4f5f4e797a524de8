use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::{
    Json,
    body::Body,
    http::{HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use uuid::Uuid;

use crate::cache::TenantId;

// =============================================================================
// Tenant Resolution
// =============================================================================

/// Header the upstream authentication gateway uses for the user id.
#[derive(Debug, Clone)]
pub struct TenantHeader(pub HeaderName);

impl Default for TenantHeader {
    fn default() -> Self {
        Self(HeaderName::from_static("x-user-id"))
    }
}

impl TenantHeader {
    pub fn new(name: &str) -> Result<Self, String> {
        HeaderName::from_bytes(name.as_bytes())
            .map(Self)
            .map_err(|e| format!("invalid tenant header '{name}': {e}"))
    }
}

/// Attach the authenticated user's [`TenantId`] to the request.
///
/// Authentication itself happens upstream; this only copies the identity
/// it resolved into the request extensions. Requests without the header
/// carry no tenant, which the cache gate treats as "do not cache".
pub async fn resolve_tenant(
    State(header): State<TenantHeader>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let tenant = req
        .headers()
        .get(&header.0)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(TenantId::new);

    match tenant {
        Some(tenant) => {
            tracing::trace!(tenant = %tenant, "tenant resolved");
            req.extensions_mut().insert(tenant);
        }
        None => {
            // Never trust a tenant injected by an earlier layer or the client
            req.extensions_mut().remove::<TenantId>();
        }
    }

    next.run(req).await
}

/// Extractor for handlers that require an authenticated user.
///
/// Rejects with 401 when no tenant was resolved.
#[derive(Debug, Clone)]
pub struct RequireTenant(pub TenantId);

impl<S: Send + Sync> FromRequestParts<S> for RequireTenant {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantId>()
            .cloned()
            .map(RequireTenant)
            .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "Authentication required"))
    }
}

// =============================================================================
// Other Middleware
// =============================================================================

/// Tag each request with an `x-request-id`, reusing the caller's when present,
/// and echo it on the response.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let name = HeaderName::from_static("x-request-id");

    let id = match req.headers().get(&name) {
        Some(id) => id.clone(),
        None => HeaderValue::from_str(&Uuid::new_v4().to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("unknown")),
    };
    req.extensions_mut().insert(id.clone());

    let mut res = next.run(req).await;
    res.headers_mut().insert(name, id);
    res
}

pub fn error_response(status: StatusCode, msg: &str) -> Response {
    (status, Json(json!({ "error": msg }))).into_response()
}
