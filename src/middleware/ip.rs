//! Client IP resolution for rate limiting.
//!
//! Rate-limit buckets are keyed by client IP, so the key must not be something
//! a client can choose freely. The resolver therefore starts from the TCP peer
//! address (`ConnectInfo<SocketAddr>`) and only looks at `X-Forwarded-For` /
//! `X-Real-IP` when that peer is a configured trusted proxy.
//!
//! ```text
//! peer in TRUSTED_PROXIES? ──yes──▶ X-Forwarded-For (first hop) ─▶ X-Real-IP ─▶ peer
//!          │
//!          no ──────────────────────────────────────────────────────────────▶ peer
//! ```
//!
//! When the server is started without connect info (e.g. in-process tests
//! driving the router directly), every request resolves to [`UNKNOWN_IP`] and
//! shares one bucket.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Fallback key when no client address is available.
pub const UNKNOWN_IP: &str = "unknown";

/// A parsed CIDR block such as `10.0.0.0/8` or `::1/128`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse CIDR notation. A bare address is treated as a single-host block.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = if network.is_ipv4() { 32 } else { 128 };
        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().ok().filter(|p| *p <= max_prefix)?,
            None => max_prefix,
        };

        Some(Self {
            network,
            prefix_len,
        })
    }

    /// Whether `ip` falls inside this block. Address families never mix.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                masked_eq(u128::from(u32::from(net)), u128::from(u32::from(*addr)), self.prefix_len, 32)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                masked_eq(u128::from(net), u128::from(*addr), self.prefix_len, 128)
            }
            _ => false,
        }
    }
}

fn masked_eq(a: u128, b: u128, prefix_len: u8, width: u32) -> bool {
    let host_bits = width - u32::from(prefix_len);
    if host_bits >= width {
        return true;
    }
    (a >> host_bits) == (b >> host_bits)
}

/// The set of reverse proxies allowed to report a client address.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Build from CIDR strings; invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        Self { ranges }
    }

    /// Whether any proxy is trusted at all.
    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether `ip` belongs to a trusted proxy.
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(ip))
    }
}

/// First hop of `X-Forwarded-For`, falling back to `X-Real-IP`.
fn forwarded_ip<B>(req: &Request<B>) -> Option<&str> {
    let xff = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    xff.or_else(|| {
        req.headers()
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    })
}

/// TCP peer address, when the server was started with connect info.
pub fn peer_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Whether the request arrived directly from a trusted proxy.
pub fn from_trusted_proxy<B>(req: &Request<B>, trusted_proxies: &TrustedProxyConfig) -> bool {
    peer_ip(req).is_some_and(|peer| trusted_proxies.is_trusted(&peer))
}

/// Resolve the rate-limit key for a request.
///
/// Returns `Cow::Borrowed(UNKNOWN_IP)` without allocating when no address is
/// known.
pub fn client_ip<B>(req: &Request<B>, trusted_proxies: &TrustedProxyConfig) -> Cow<'static, str> {
    match peer_ip(req) {
        Some(peer) if trusted_proxies.is_trusted(&peer) => match forwarded_ip(req) {
            Some(ip) => Cow::Owned(ip.to_string()),
            None => {
                debug!(peer = %peer, "Trusted proxy sent no forwarding headers");
                Cow::Owned(peer.to_string())
            }
        },
        Some(peer) => {
            if trusted_proxies.is_enabled() && forwarded_ip(req).is_some() {
                debug!(peer = %peer, "Ignoring forwarding headers from untrusted peer");
            }
            Cow::Owned(peer.to_string())
        }
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_from(peer: &str) -> axum::http::request::Builder {
        let addr: SocketAddr = format!("{peer}:40000").parse().unwrap();
        let mut builder = Request::builder();
        if let Some(ext) = builder.extensions_mut() {
            ext.insert(ConnectInfo(addr));
        }
        builder
    }

    #[test]
    fn test_cidr_parse_variants() {
        assert_eq!(CidrRange::parse("10.0.0.0/8").unwrap().prefix_len, 8);
        assert_eq!(CidrRange::parse("192.168.1.1").unwrap().prefix_len, 32);
        assert_eq!(CidrRange::parse("::1").unwrap().prefix_len, 128);
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
        assert!(CidrRange::parse("nope").is_none());
    }

    #[test]
    fn test_cidr_contains() {
        let block = CidrRange::parse("172.16.0.0/12").unwrap();
        assert!(block.contains(&"172.31.255.255".parse().unwrap()));
        assert!(!block.contains(&"172.32.0.1".parse().unwrap()));
        assert!(!block.contains(&"::1".parse().unwrap()));

        let everything = CidrRange::parse("0.0.0.0/0").unwrap();
        assert!(everything.contains(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_peer_address_without_trusted_proxies() {
        let req = request_from("203.0.113.9")
            .header("x-forwarded-for", "1.2.3.4")
            .body(Body::empty())
            .unwrap();

        assert_eq!(client_ip(&req, &TrustedProxyConfig::default()), "203.0.113.9");
    }

    #[test]
    fn test_forwarded_header_from_trusted_proxy() {
        let proxies = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
        let req = request_from("10.1.2.3")
            .header("x-forwarded-for", " 198.51.100.7 , 10.1.2.3")
            .body(Body::empty())
            .unwrap();

        assert_eq!(client_ip(&req, &proxies), "198.51.100.7");
    }

    #[test]
    fn test_real_ip_from_trusted_proxy() {
        let proxies = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
        let req = request_from("10.1.2.3")
            .header("x-real-ip", "198.51.100.8")
            .body(Body::empty())
            .unwrap();

        assert_eq!(client_ip(&req, &proxies), "198.51.100.8");
    }

    #[test]
    fn test_spoofed_header_from_untrusted_peer() {
        let proxies = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
        let req = request_from("203.0.113.50")
            .header("x-forwarded-for", "1.1.1.1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(client_ip(&req, &proxies), "203.0.113.50");
    }

    #[test]
    fn test_unknown_without_connect_info() {
        let req = Request::builder().body(Body::empty()).unwrap();
        let ip = client_ip(&req, &TrustedProxyConfig::default());

        assert_eq!(ip, UNKNOWN_IP);
        assert!(matches!(ip, Cow::Borrowed(_)));
    }

    #[test]
    fn test_from_trusted_proxy() {
        let proxies = TrustedProxyConfig::new(&["10.0.0.0/8".to_string()]);
        let proxied = request_from("10.0.0.2").body(Body::empty()).unwrap();
        let direct = request_from("203.0.113.50").body(Body::empty()).unwrap();
        let in_process = Request::builder().body(Body::empty()).unwrap();

        assert!(from_trusted_proxy(&proxied, &proxies));
        assert!(!from_trusted_proxy(&direct, &proxies));
        assert!(!from_trusted_proxy(&in_process, &proxies));
    }

    #[test]
    fn test_invalid_cidr_skipped() {
        let proxies = TrustedProxyConfig::new(&["bogus".to_string()]);
        assert!(!proxies.is_enabled());
    }
}
