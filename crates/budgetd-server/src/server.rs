use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, middleware, routing::get};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::budgets::{self, BudgetStore};
use crate::cache::Cache;
use crate::{config::AppConfig, handlers, middleware as app_middleware};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub cache: Cache,
    pub budgets: Arc<BudgetStore>,
}

pub struct BudgetdServer {
    addr: SocketAddr,
    app: Router,
}

pub fn build_app(cfg: &AppConfig, cache: Cache) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    let tenant_header = app_middleware::TenantHeader::new(&cfg.auth.tenant_header).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "falling back to the default tenant header");
        app_middleware::TenantHeader::default()
    });

    let gated = cfg.cache.enabled.then_some(&cache);
    if gated.is_none() {
        tracing::info!("response cache disabled, GET routes are served uncached");
    }
    let budget_routes = budgets::routes(gated, cfg.cache.default_ttl_secs);

    let state = AppState {
        cache: cache.clone(),
        budgets: Arc::new(BudgetStore::new()),
    };

    Router::new()
        // Health and info endpoints
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics))
        // Cache diagnostics
        .route("/cache/health", get(handlers::cache_health))
        .route("/cache/keys", get(handlers::cache_keys))
        .merge(budget_routes)
        .with_state(state)
        // Middleware stack (order: tenant -> request id -> cors/trace -> body limit)
        .layer(middleware::from_fn_with_state(
            tenant_header,
            app_middleware::resolve_tenant,
        ))
        .layer(middleware::from_fn(app_middleware::request_id))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                        span.record("http.status_code", tracing::field::display(res.status().as_u16()));
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            cache = res
                                .headers()
                                .get(crate::cache::X_CACHE)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("-"),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    cache: Option<Cache>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
            cache: None,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Use an already constructed cache instead of connecting one from config.
    pub fn with_cache(mut self, cache: Cache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Connect the cache (Redis with bounded retry, else local) and build the router.
    pub async fn build(self) -> anyhow::Result<BudgetdServer> {
        self.config.validate().map_err(anyhow::Error::msg)?;

        let cache = match self.cache {
            Some(cache) => cache,
            None => crate::create_cache(&self.config).await,
        };
        tracing::info!(backend = %cache.health(), "response cache ready");

        let app = build_app(&self.config, cache);
        Ok(BudgetdServer {
            addr: self.addr,
            app,
        })
    }
}

impl BudgetdServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    shutdown_on(tokio::signal::ctrl_c()).await
}

/// Resolves when `signal` fires. If the listener itself fails, the error is
/// logged and this never resolves, so the server keeps serving.
async fn shutdown_on(signal: impl Future<Output = std::io::Result<()>>) {
    match signal.await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for Ctrl+C, graceful shutdown disabled");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_healthz() {
        let app = build_app(&AppConfig::default(), Cache::local());
        let res = app
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_disabled_cache_leaves_responses_unmarked() {
        let mut cfg = AppConfig::default();
        cfg.cache.enabled = false;
        let app = build_app(&cfg, Cache::local());

        let res = app
            .oneshot(
                Request::get("/budgets")
                    .header("x-user-id", "1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(!res.headers().contains_key("x-cache"));
    }

    #[tokio::test]
    async fn test_shutdown_waits_on_the_signal() {
        shutdown_on(async { Ok(()) }).await;

        let failed = shutdown_on(async { Err(std::io::Error::other("no signal handler")) });
        let waited = tokio::time::timeout(std::time::Duration::from_millis(50), failed).await;
        assert!(waited.is_err(), "a failed listener must not stop the server");
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let mut cfg = AppConfig::default();
        cfg.server.port = 0;
        assert!(ServerBuilder::new().with_config(cfg).build().await.is_err());
    }
}
