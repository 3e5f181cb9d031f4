//! Fuzz client IP resolution.
//!
//! Rate-limit keys come from attacker-controlled forwarding headers and
//! operator-supplied CIDR lists. Neither may panic the resolver, and an
//! untrusted peer must always be keyed on its own address.
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_client_ip -- -max_total_time=60
//! ```

#![no_main]

use std::net::{IpAddr, SocketAddr};

use arbitrary::Arbitrary;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;
use exampro_api::middleware::ip::{CidrRange, TrustedProxyConfig, client_ip};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    cidrs: Vec<String>,
    peer: [u8; 4],
    forwarded_for: Option<Vec<u8>>,
    real_ip: Option<Vec<u8>>,
}

fuzz_target!(|input: Input| {
    for cidr in &input.cidrs {
        let _ = CidrRange::parse(cidr);
    }
    let proxies = TrustedProxyConfig::new(&input.cidrs);

    let peer = IpAddr::from(input.peer);
    let mut builder = Request::builder();
    if let Some(ext) = builder.extensions_mut() {
        ext.insert(ConnectInfo(SocketAddr::new(peer, 40000)));
    }
    if let Some(xff) = &input.forwarded_for {
        builder = builder.header("x-forwarded-for", xff.as_slice());
    }
    if let Some(real) = &input.real_ip {
        builder = builder.header("x-real-ip", real.as_slice());
    }

    // Invalid header bytes make the builder fail; nothing to resolve then.
    let Ok(request) = builder.body(Body::empty()) else {
        return;
    };

    let key = client_ip(&request, &proxies);
    if !proxies.is_trusted(&peer) {
        assert_eq!(key, peer.to_string());
    }
});
