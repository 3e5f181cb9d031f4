//! Fuzz Content-Security-Policy construction from the configured origin.
//!
//! Whatever `CSP_CONNECT_ORIGIN` holds, building the header set must either
//! fail cleanly or yield a policy that still ends with `frame-src 'none'`.
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_security_headers
//! ```

#![no_main]

use axum::http::header;
use exampro_api::middleware::security_headers::security_headers;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|origin: &str| {
    if let Ok(headers) = security_headers(origin) {
        let csp = headers
            .get(header::CONTENT_SECURITY_POLICY)
            .and_then(|v| v.to_str().ok());
        if let Some(csp) = csp {
            assert!(csp.ends_with("frame-src 'none'"));
        }
    }
});
