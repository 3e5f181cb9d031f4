//! Fixed-window rate limiting middleware.
//!
//! # Algorithm
//!
//! Each client IP owns a bucket holding the start of its current window and
//! the number of requests accepted in it. A request is accepted while the
//! count is below the policy maximum; afterwards every request fails with 429
//! until the window expires, at which point the bucket resets. The window
//! starts at the client's first request, not on a global clock.
//!
//! Three limiters run side by side with independent policies:
//!
//! | Policy  | Scope          | Window | Max |
//! |---------|----------------|--------|-----|
//! | general | every request  | 15 min | 100 |
//! | api     | `/api/*`       | 1 min  | 300 |
//! | auth    | `/api/auth/*`  | 1 min  | 300 |
//!
//! Counters live in process memory. Several service instances each enforce
//! their own limit; there is no cross-instance coordination.
//!
//! # Response Headers
//!
//! Every response that went through a limiter carries `RateLimit-Limit`,
//! `RateLimit-Remaining` and `RateLimit-Reset` (seconds). When limiters are
//! nested the innermost one's values are kept.
//!
//! On 429 the retry hint is in the JSON body:
//!
//! ```json
//! { "error": "Too many requests from this IP, please try again later.", "retryAfter": 873 }
//! ```

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use dashmap::DashMap;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::ip::{TrustedProxyConfig, client_ip};
use crate::error::AppError;
use crate::metrics;

pub const RATELIMIT_LIMIT_HEADER: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATELIMIT_REMAINING_HEADER: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const RATELIMIT_RESET_HEADER: HeaderName = HeaderName::from_static("ratelimit-reset");

/// Window length and request budget for one endpoint group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Label used in logs and metrics.
    pub name: &'static str,
    /// Length of one counting window.
    pub window: Duration,
    /// Requests accepted per client per window.
    pub max_requests: u32,
    /// Message returned to throttled clients.
    pub message: &'static str,
}

impl RateLimitPolicy {
    /// 100 requests per 15 minutes, applied to all traffic.
    pub fn general() -> Self {
        Self {
            name: "general",
            window: Duration::from_secs(15 * 60),
            max_requests: 100,
            message: "Too many requests from this IP, please try again later.",
        }
    }

    /// 300 requests per minute on authentication endpoints.
    pub fn auth() -> Self {
        Self {
            name: "auth",
            window: Duration::from_secs(60),
            max_requests: 300,
            message: "Too many authentication attempts, please try again later.",
        }
    }

    /// 300 requests per minute on the JSON API.
    pub fn api() -> Self {
        Self {
            name: "api",
            window: Duration::from_secs(60),
            max_requests: 300,
            message: "Too many API requests, please try again later.",
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests;
        self
    }
}

/// Per-client counter for the current window.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start: Instant,
    count: u32,
}

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_after: Duration,
    },
    Throttled {
        limit: u32,
        retry_after: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Round a duration up to whole seconds, never below one.
pub fn ceil_secs(d: Duration) -> u64 {
    d.as_secs()
        .saturating_add(u64::from(d.subsec_nanos() > 0))
        .max(1)
}

/// In-memory fixed-window limiter keyed by client IP.
///
/// Cloning is cheap and clones share the same buckets.
#[derive(Clone)]
pub struct FixedWindowLimiter {
    policy: Arc<RateLimitPolicy>,
    buckets: Arc<DashMap<String, Bucket>>,
}

impl FixedWindowLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
            buckets: Arc::new(DashMap::new()),
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Count a request from `key` and decide whether it may proceed.
    pub fn check(&self, key: &str) -> Decision {
        let now = Instant::now();
        let window = self.policy.window;
        let limit = self.policy.max_requests;

        let mut bucket = match self.buckets.get_mut(key) {
            Some(bucket) => bucket,
            None => self.buckets.entry(key.to_owned()).or_insert(Bucket {
                window_start: now,
                count: 0,
            }),
        };

        if now.duration_since(bucket.window_start) >= window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        let reset_after = (bucket.window_start + window).saturating_duration_since(now);

        if bucket.count >= limit {
            return Decision::Throttled {
                limit,
                retry_after: reset_after,
            };
        }

        bucket.count += 1;
        Decision::Allowed {
            limit,
            remaining: limit - bucket.count,
            reset_after,
        }
    }

    /// Drop buckets whose window has ended. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let window = self.policy.window;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.window_start) < window);
        before.saturating_sub(self.buckets.len())
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Tower layer enforcing one [`FixedWindowLimiter`].
///
/// # Example
///
/// ```rust,ignore
/// let auth = FixedWindowLimiter::new(RateLimitPolicy::auth());
/// let app = Router::new()
///     .route("/api/auth/login", post(login))
///     .layer(RateLimitLayer::new(auth, Arc::new(TrustedProxyConfig::default())).scoped_to("/api/auth"));
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: FixedWindowLimiter,
    trusted_proxies: Arc<TrustedProxyConfig>,
    scope: Option<Arc<str>>,
}

impl RateLimitLayer {
    pub fn new(limiter: FixedWindowLimiter, trusted_proxies: Arc<TrustedProxyConfig>) -> Self {
        Self {
            limiter,
            trusted_proxies,
            scope: None,
        }
    }

    /// Only count requests whose path is `prefix` or lies below it.
    pub fn scoped_to(mut self, prefix: &str) -> Self {
        self.scope = Some(Arc::from(prefix.trim_end_matches('/')));
        self
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
            scope: self.scope.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: FixedWindowLimiter,
    trusted_proxies: Arc<TrustedProxyConfig>,
    scope: Option<Arc<str>>,
}

fn in_scope(path: &str, scope: Option<&str>) -> bool {
    match scope {
        None => true,
        Some(prefix) => path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/')),
    }
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // Swap in a ready clone, keeping the service that was polled
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if !in_scope(req.uri().path(), self.scope.as_deref()) {
            return Box::pin(async move { inner.call(req).await });
        }

        let client_ip = client_ip(&req, &self.trusted_proxies);
        let decision = self.limiter.check(&client_ip);
        let policy = self.limiter.policy.clone();

        match decision {
            Decision::Allowed {
                limit,
                remaining,
                reset_after,
            } => {
                Box::pin(async move {
                    let mut response = inner.call(req).await?;
                    insert_rate_limit_headers(&mut response, limit, remaining, reset_after, false);
                    Ok(response)
                })
            }
            Decision::Throttled { limit, retry_after } => {
                let retry_after_secs = ceil_secs(retry_after);

                warn!(
                    client_ip = %client_ip,
                    path = %req.uri().path(),
                    policy = policy.name,
                    retry_after_secs,
                    "Rate limit exceeded for IP"
                );
                metrics::record_rate_limit_rejection(policy.name);

                let mut response =
                    AppError::throttled(policy.message, retry_after_secs).into_response();
                insert_rate_limit_headers(&mut response, limit, 0, retry_after, true);

                Box::pin(async move { Ok(response) })
            }
        }
    }
}

/// Add the standard rate-limit headers.
///
/// With `overwrite == false` an existing value is kept, so the limiter closest
/// to the handler decides what the client sees.
fn insert_rate_limit_headers(
    response: &mut Response<Body>,
    limit: u32,
    remaining: u32,
    reset_after: Duration,
    overwrite: bool,
) {
    let headers = response.headers_mut();
    if !overwrite && headers.contains_key(RATELIMIT_LIMIT_HEADER) {
        debug!("Inner rate limiter already set headers");
        return;
    }
    headers.insert(RATELIMIT_LIMIT_HEADER, HeaderValue::from(limit));
    headers.insert(RATELIMIT_REMAINING_HEADER, HeaderValue::from(remaining));
    headers.insert(RATELIMIT_RESET_HEADER, HeaderValue::from(ceil_secs(reset_after)));
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use tower::ServiceExt;

    fn policy(window_secs: u64, max: u32) -> RateLimitPolicy {
        RateLimitPolicy::general()
            .with_window(Duration::from_secs(window_secs))
            .with_max_requests(max)
    }

    #[test]
    fn test_default_policies() {
        assert_eq!(RateLimitPolicy::general().window, Duration::from_secs(900));
        assert_eq!(RateLimitPolicy::general().max_requests, 100);
        assert_eq!(RateLimitPolicy::auth().window, Duration::from_secs(60));
        assert_eq!(RateLimitPolicy::api().max_requests, 300);
        assert_eq!(
            RateLimitPolicy::general().message,
            "Too many requests from this IP, please try again later."
        );
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(1000)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(1001)), 2);
        assert_eq!(ceil_secs(Duration::ZERO), 1);
        assert_eq!(ceil_secs(Duration::from_secs(900)), 900);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allows_exactly_max_then_throttles() {
        let limiter = FixedWindowLimiter::new(policy(60, 3));

        for expected_remaining in [2, 1, 0] {
            match limiter.check("1.2.3.4") {
                Decision::Allowed { remaining, .. } => assert_eq!(remaining, expected_remaining),
                other => panic!("unexpected {other:?}"),
            }
        }

        match limiter.check("1.2.3.4") {
            Decision::Throttled { retry_after, limit } => {
                assert_eq!(limit, 3);
                assert_eq!(ceil_secs(retry_after), 60);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_shrinks_as_window_ages() {
        let limiter = FixedWindowLimiter::new(policy(60, 1));
        assert!(limiter.check("a").is_allowed());

        tokio::time::advance(Duration::from_millis(20_500)).await;

        match limiter.check("a") {
            Decision::Throttled { retry_after, .. } => assert_eq!(ceil_secs(retry_after), 40),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reset_readmits_client() {
        let limiter = FixedWindowLimiter::new(policy(10, 1));
        assert!(limiter.check("a").is_allowed());
        assert!(!limiter.check("a").is_allowed());

        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(limiter.check("a").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clients_are_independent() {
        let limiter = FixedWindowLimiter::new(policy(60, 1));
        assert!(limiter.check("a").is_allowed());
        assert!(!limiter.check("a").is_allowed());
        assert!(limiter.check("b").is_allowed());
        assert_eq!(limiter.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let limiter = FixedWindowLimiter::new(policy(10, 5));
        limiter.check("old");
        tokio::time::advance(Duration::from_secs(6)).await;
        limiter.check("new");
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn test_scope_matching() {
        assert!(in_scope("/anything", None));
        assert!(in_scope("/api/auth", Some("/api/auth")));
        assert!(in_scope("/api/auth/login", Some("/api/auth")));
        assert!(!in_scope("/api/authors", Some("/api/auth")));
        assert!(!in_scope("/api/stats", Some("/api/auth")));
    }

    fn limited_app(max: u32, scope: Option<&str>) -> Router {
        let mut layer = RateLimitLayer::new(
            FixedWindowLimiter::new(policy(60, max)),
            Arc::new(TrustedProxyConfig::default()),
        );
        if let Some(scope) = scope {
            layer = layer.scoped_to(scope);
        }
        Router::new()
            .route("/api/auth/login", get(|| async { "ok" }))
            .route("/api/stats", get(|| async { "ok" }))
            .layer(layer)
    }

    async fn get_status(app: &Router, uri: &str) -> Response<Body> {
        app.clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_layer_rejects_with_retry_hint() {
        let app = limited_app(2, None);

        let first = get_status(&app, "/api/stats").await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()[RATELIMIT_LIMIT_HEADER], "2");
        assert_eq!(first.headers()[RATELIMIT_REMAINING_HEADER], "1");

        get_status(&app, "/api/stats").await;
        let throttled = get_status(&app, "/api/stats").await;
        assert_eq!(throttled.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(throttled.headers()[RATELIMIT_REMAINING_HEADER], "0");

        let body = axum::body::to_bytes(throttled.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            json["error"],
            "Too many requests from this IP, please try again later."
        );
        assert_eq!(json["retryAfter"], 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scoped_layer_ignores_other_paths() {
        let app = limited_app(1, Some("/api/auth"));

        for _ in 0..5 {
            let response = get_status(&app, "/api/stats").await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key(RATELIMIT_LIMIT_HEADER));
        }

        assert_eq!(get_status(&app, "/api/auth/login").await.status(), StatusCode::OK);
        assert_eq!(
            get_status(&app, "/api/auth/login").await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_buckets() {
        let limiter = FixedWindowLimiter::new(policy(60, 1));
        let clone = limiter.clone();
        assert!(limiter.check("a").is_allowed());
        assert!(!clone.check("a").is_allowed());
    }
}
