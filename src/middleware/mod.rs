//! The request pipeline.
//!
//! - **Performance logger**: request latency, slow-request warnings
//! - **Request ID**: `X-Request-Id` generation and propagation
//! - **Security headers**: fixed Content-Security-Policy and hardening headers
//! - **Compression**: negotiated response compression above a size threshold
//! - **Rate limiting**: fixed-window per-IP limits (general, API, auth)
//! - **Principal**: caller identity forwarded by the auth gateway
//! - **De-duplication**: coalescing of identical concurrent GETs
//!
//! # Architecture
//!
//! ```text
//! Request → Perf → Request ID → Security → Compression → Rate Limit → Principal → Dedup → Handler
//!             ↓                     ↓            ↓             ↓                     ↓
//!         latency log          CSP headers   gzip/br/zstd  429 retryAfter     replayed response
//! ```
//!
//! Rate limits apply in order general → api (`/api/*`) → auth (`/api/auth/*`);
//! `/health` and `/ready` sit outside them.

pub mod compression;
pub mod dedup;
pub mod ip;
pub mod perf;
pub mod principal;
pub mod rate_limit;
pub mod request_id;
pub mod security_headers;

pub use compression::{NO_COMPRESSION_HEADER, compression_layer, honor_no_compression};
pub use dedup::{DEDUPLICATED_HEADER, DedupLayer, RequestCoalescer};
pub use ip::{TrustedProxyConfig, UNKNOWN_IP, client_ip, from_trusted_proxy, peer_ip};
pub use perf::PerfLoggerLayer;
pub use principal::{Principal, PrincipalExt, resolve_principal};
pub use rate_limit::{Decision, FixedWindowLimiter, RateLimitLayer, RateLimitPolicy};
pub use request_id::{REQUEST_ID_HEADER, RequestIdExt, RequestIdLayer};
pub use security_headers::{ContentSecurityPolicy, SecurityHeadersLayer};
