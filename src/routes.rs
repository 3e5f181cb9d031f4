//! Router assembly and middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────────┐
//! │  Performance Logger  │ ← latency log, slow-request warning
//! ├──────────────────────┤
//! │  Trace / Request ID  │ ← span per request, X-Request-Id
//! ├──────────────────────┤
//! │  CORS                │
//! ├──────────────────────┤
//! │  Security Headers    │ ← CSP and friends on every response
//! ├──────────────────────┤
//! │  Compression         │ ← > threshold, unless X-No-Compression
//! ├──────────────────────┤
//! │  Body Limit          │
//! └──────────┬───────────┘
//!            │
//!   /health, /ready ─────────────────────────▶ handler
//!            │
//!   everything else
//!            ▼
//! ┌──────────────────────┐
//! │  Rate Limit: general │ ← 429 + retryAfter
//! │  Rate Limit: api     │   (/api/*)
//! │  Rate Limit: auth    │   (/api/auth/*)
//! ├──────────────────────┤
//! │  Principal           │ ← X-User-Id from a trusted gateway
//! ├──────────────────────┤
//! │  De-duplicator       │ ← coalesces identical GETs
//! └──────────┬───────────┘
//!            ▼
//!         Handler
//! ```
//!
//! # Route Groups
//!
//! - `/health`, `/ready` - probes, never rate limited
//! - `/api/stats` - pipeline statistics
//! - any `/api/*` routes supplied by the application

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Request};
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, info_span};

use crate::error::{AppError, AppResult};
use crate::handlers;
use crate::middleware::{
    DedupLayer, PerfLoggerLayer, RateLimitLayer, RequestIdLayer, SecurityHeadersLayer,
    compression_layer, honor_no_compression, resolve_principal,
};
use crate::state::AppState;

/// Built-in `/api` routes, merged ahead of the application's own.
pub fn api_routes() -> Router<AppState> {
    Router::new().route("/api/stats", get(handlers::stats))
}

/// Build the application router.
///
/// `api` carries the application's routes (with their full `/api/...`
/// paths). They are merged with [`api_routes`] and run behind the rate
/// limiters, principal resolution and GET de-duplication.
///
/// # Errors
///
/// Returns `AppError::ConfigError` if the security header set cannot be
/// built from the configured CSP origin.
pub fn build_router(state: AppState, api: Router<AppState>) -> AppResult<Router> {
    let config = state.config.clone();
    let proxies = state.trusted_proxies.clone();
    let limiters = &state.rate_limiters;

    // =========================================================================
    // Rate-limited routes (innermost layer first)
    // =========================================================================
    let limited = api_routes()
        .merge(api)
        .fallback(not_found)
        .layer(DedupLayer::new(state.coalescer.clone()))
        .layer(axum::middleware::from_fn_with_state(
            proxies.clone(),
            resolve_principal,
        ))
        .layer(RateLimitLayer::new(limiters.auth.clone(), proxies.clone()).scoped_to("/api/auth"))
        .layer(RateLimitLayer::new(limiters.api.clone(), proxies.clone()).scoped_to("/api"))
        .layer(RateLimitLayer::new(limiters.general.clone(), proxies));

    for policy in [
        limiters.general.policy(),
        limiters.api.policy(),
        limiters.auth.policy(),
    ] {
        info!(
            policy = policy.name,
            window_secs = policy.window.as_secs(),
            max_requests = policy.max_requests,
            "Rate limit policy configured"
        );
    }

    // =========================================================================
    // Probes plus the shared outer stack (applied bottom to top)
    // =========================================================================
    let security = SecurityHeadersLayer::new(&config.csp_connect_origin)?;

    info!(
        max_size_mb = config.max_request_body_size / (1024 * 1024),
        compression_threshold = config.compression_threshold,
        dedup_ttl_ms = u64::try_from(config.dedup_ttl.as_millis()).unwrap_or(u64::MAX),
        "Request pipeline configured"
    );

    let router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .merge(limited)
        .layer(DefaultBodyLimit::max(config.max_request_body_size))
        .layer(compression_layer(config.compression_threshold))
        .layer(axum::middleware::from_fn(honor_no_compression))
        .layer(security)
        .layer(build_cors_layer(&config.cors_allowed_origins))
        .layer(RequestIdLayer::new())
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
            info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = tracing::field::Empty,
            )
        }))
        .layer(PerfLoggerLayer::new(config.slow_request_threshold));

    Ok(router.with_state(state))
}

async fn not_found() -> AppError {
    AppError::NotFound("No route matches this path".to_string())
}

/// Build CORS layer from configuration.
///
/// `*` anywhere in the list allows any origin.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::{StatusCode, header};
    use tower::ServiceExt;

    #[test]
    fn test_build_cors_layer_any() {
        let origins = vec!["*".to_string()];
        let _layer = build_cors_layer(&origins);
    }

    #[test]
    fn test_build_cors_layer_specific() {
        let origins = vec![
            "https://exampro.example".to_string(),
            "https://admin.exampro.example".to_string(),
        ];
        let _layer = build_cors_layer(&origins);
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404_with_headers() {
        let state = AppState::new(Config::default());
        let app = build_router(state.clone(), Router::new()).unwrap();

        let response = app
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key(header::CONTENT_SECURITY_POLICY));
        assert!(response.headers().contains_key("x-request-id"));
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_csp_origin_rejected() {
        let config = Config {
            csp_connect_origin: "http://bad\u{7f}origin".to_string(),
            ..Config::default()
        };
        let state = AppState::new(config);

        assert!(build_router(state.clone(), Router::new()).is_err());
        state.shutdown().await;
    }
}
