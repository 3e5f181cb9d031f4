//! Content-Security-Policy and related hardening headers.
//!
//! Every response leaves the service with the same policy:
//!
//! | Directive     | Sources                              |
//! |---------------|--------------------------------------|
//! | `default-src` | `'self'`                             |
//! | `style-src`   | `'self'` `'unsafe-inline'`           |
//! | `script-src`  | `'self'`                             |
//! | `img-src`     | `'self'` `data:` `https:`            |
//! | `connect-src` | `'self'` + the code-execution origin |
//! | `font-src`    | `'self'`                             |
//! | `object-src`  | `'none'`                             |
//! | `media-src`   | `'self'`                             |
//! | `frame-src`   | `'none'`                             |
//!
//! Headers a handler sets explicitly are left untouched.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{HeaderMap, Request, Response};
use tower::{Layer, Service};

use crate::error::{AppError, AppResult};

/// The fixed CSP directive table. Only the `connect-src` origin varies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSecurityPolicy {
    directives: Vec<(&'static str, Vec<String>)>,
}

impl ContentSecurityPolicy {
    /// Build the policy allowing `connect_origin` in `connect-src`.
    pub fn new(connect_origin: &str) -> Self {
        let own = |sources: &[&str]| sources.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        Self {
            directives: vec![
                ("default-src", own(&["'self'"])),
                ("style-src", own(&["'self'", "'unsafe-inline'"])),
                ("script-src", own(&["'self'"])),
                ("img-src", own(&["'self'", "data:", "https:"])),
                ("connect-src", own(&["'self'", connect_origin])),
                ("font-src", own(&["'self'"])),
                ("object-src", own(&["'none'"])),
                ("media-src", own(&["'self'"])),
                ("frame-src", own(&["'none'"])),
            ],
        }
    }

    /// Sources allowed for `directive`, if it is part of the policy.
    pub fn sources(&self, directive: &str) -> Option<&[String]> {
        self.directives
            .iter()
            .find(|(name, _)| *name == directive)
            .map(|(_, sources)| sources.as_slice())
    }

    /// Serialize in header form: `default-src 'self'; style-src ...`.
    pub fn to_header_string(&self) -> String {
        self.directives
            .iter()
            .map(|(name, sources)| format!("{name} {}", sources.join(" ")))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Build the complete header set attached to every response.
///
/// # Errors
///
/// Returns `AppError::ConfigError` if the connect origin cannot be encoded as
/// a header value.
pub fn security_headers(connect_origin: &str) -> AppResult<HeaderMap> {
    let csp = ContentSecurityPolicy::new(connect_origin).to_header_string();
    let csp = HeaderValue::from_str(&csp)
        .map_err(|e| AppError::ConfigError(format!("invalid Content-Security-Policy: {e}")))?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_SECURITY_POLICY, csp);
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN"));
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    headers.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=15552000; includeSubDomains"),
    );
    headers.insert(header::X_DNS_PREFETCH_CONTROL, HeaderValue::from_static("off"));
    headers.insert(
        HeaderName::from_static("cross-origin-opener-policy"),
        HeaderValue::from_static("same-origin"),
    );
    headers.insert(
        HeaderName::from_static("cross-origin-resource-policy"),
        HeaderValue::from_static("same-origin"),
    );
    headers.insert(
        HeaderName::from_static("x-permitted-cross-domain-policies"),
        HeaderValue::from_static("none"),
    );
    Ok(headers)
}

/// Layer attaching a fixed header set to every response.
#[derive(Clone)]
pub struct SecurityHeadersLayer {
    headers: Arc<HeaderMap>,
}

impl SecurityHeadersLayer {
    /// # Errors
    ///
    /// See [`security_headers`].
    pub fn new(connect_origin: &str) -> AppResult<Self> {
        Ok(Self {
            headers: Arc::new(security_headers(connect_origin)?),
        })
    }
}

impl<S> Layer<S> for SecurityHeadersLayer {
    type Service = SecurityHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SecurityHeadersService {
            inner,
            headers: self.headers.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SecurityHeadersService<S> {
    inner: S,
    headers: Arc<HeaderMap>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for SecurityHeadersService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let headers = self.headers.clone();
        let future = self.inner.call(req);

        Box::pin(async move {
            let mut response = future.await?;
            let target = response.headers_mut();
            for (name, value) in headers.iter() {
                if !target.contains_key(name) {
                    target.insert(name.clone(), value.clone());
                }
            }
            Ok(response)
        })
    }
}
