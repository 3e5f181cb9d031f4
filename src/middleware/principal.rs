//! Caller identity forwarded by the authentication gateway.
//!
//! Token verification happens in front of this service. The gateway forwards
//! the verified identity as `X-User-Id` (and optionally `X-User-Role`); this
//! middleware lifts those headers into a typed [`Principal`] request extension
//! so downstream layers never parse headers themselves.
//!
//! The headers are only believed when the TCP peer is a configured trusted
//! proxy (`TRUSTED_PROXIES`), the same rule client IP resolution applies to
//! `X-Forwarded-For`. From anyone else they are ignored and the request is
//! anonymous, so a client cannot pick another user's identity.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use super::ip::{TrustedProxyConfig, from_trusted_proxy};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub role: Option<String>,
}

impl Principal {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

fn header_str<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Middleware inserting a [`Principal`] when the gateway identified the caller.
///
/// Mount with `axum::middleware::from_fn_with_state(trusted_proxies, resolve_principal)`.
/// An extension already present (e.g. set by an in-process auth layer) wins.
pub async fn resolve_principal(
    State(trusted_proxies): State<Arc<TrustedProxyConfig>>,
    mut request: Request,
    next: Next,
) -> Response {
    if request.extensions().get::<Principal>().is_none()
        && let Some(user_id) = header_str(&request, USER_ID_HEADER)
    {
        if !from_trusted_proxy(&request, &trusted_proxies) {
            debug!("Ignoring identity headers from untrusted peer");
            return next.run(request).await;
        }

        let principal = Principal {
            user_id: user_id.to_string(),
            role: header_str(&request, USER_ROLE_HEADER).map(str::to_string),
        };
        request.extensions_mut().insert(principal);
    }

    next.run(request).await
}

/// Extension trait for reading the principal from a request.
pub trait PrincipalExt {
    fn principal(&self) -> Option<&Principal>;
}

impl<B> PrincipalExt for axum::http::Request<B> {
    fn principal(&self) -> Option<&Principal> {
        self.extensions().get::<Principal>()
    }
}
