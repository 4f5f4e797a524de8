use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::Serialize;
use serde_json::json;

use crate::cache::{BackendHealth, StoreSnapshot};
use crate::middleware::RequireTenant;
use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct CacheHealthResponse {
    pub backend: BackendHealth,
    pub store: &'static str,
}

pub async fn root() -> impl IntoResponse {
    Json(json!({
        "service": "budgetd",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "ok",
    }))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Ready as soon as the cache backend has been decided; a fallback cache
/// is degraded, not unavailable.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let body = json!({
        "status": "ready",
        "cache": state.cache.health(),
    });
    (StatusCode::OK, Json(body))
}

/// `GET /cache/health`: which store currently serves cache traffic.
pub async fn cache_health(State(state): State<AppState>) -> Json<CacheHealthResponse> {
    Json(CacheHealthResponse {
        backend: state.cache.health(),
        store: state.cache.backend().active_store_name(),
    })
}

/// `GET /cache/keys`: count and list of the caller's own live keys.
pub async fn cache_keys(
    State(state): State<AppState>,
    RequireTenant(tenant): RequireTenant,
) -> Json<StoreSnapshot> {
    Json(state.cache.tenant_snapshot(&tenant).await)
}

/// `GET /metrics`: Prometheus text format.
pub async fn metrics() -> impl IntoResponse {
    match crate::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}
