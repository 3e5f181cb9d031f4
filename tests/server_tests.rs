//! Tests against a real listening server.
//!
//! Unlike `pipeline_tests.rs`, requests here arrive over TCP, so the rate
//! limiter keys on the actual peer address taken from `ConnectInfo`.
//!
//! Run with: `cargo test --test server_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use exampro_api::{AppState, Config, build_router};
use reqwest::Client;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Test fixture running the app server on an ephemeral port.
struct TestFixture {
    base_url: String,
    client: Client,
    state: AppState,
    server: JoinHandle<()>,
}

impl TestFixture {
    async fn new(config: Config) -> Self {
        let state = AppState::new(config);
        let api = Router::new()
            .route(
                "/api/exams/{id}",
                get(|axum::extract::Path(id): axum::extract::Path<u32>| async move {
                    axum::Json(serde_json::json!({ "id": id, "questions": 40 }))
                }),
            )
            .route(
                "/api/question-bank",
                get(|| async { "What is a borrow checker? ".repeat(200) }),
            );
        let app = build_router(state.clone(), api).expect("Failed to build router");

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to ephemeral port");
        let addr = listener.local_addr().expect("Failed to get local address");

        let server = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("Server failed");
        });

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: format!("http://{addr}"),
            client,
            state,
            server,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn stop(self) {
        self.server.abort();
        self.state.shutdown().await;
    }
}

fn config_with_general_limit(max: u32) -> Config {
    let defaults = Config::default();
    Config {
        general_rate_limit: defaults.general_rate_limit.clone().with_max_requests(max),
        metrics_port: 0,
        ..defaults
    }
}

#[tokio::test]
async fn test_limit_enforced_per_peer_address() {
    let fixture = TestFixture::new(config_with_general_limit(3)).await;

    for i in 0..3 {
        let response = fixture
            .client
            .get(fixture.url(&format!("/api/exams/{i}")))
            .send()
            .await
            .expect("Request failed");
        assert!(response.status().is_success());
        assert_eq!(
            response.headers()["ratelimit-remaining"]
                .to_str()
                .unwrap()
                .parse::<u32>()
                .unwrap(),
            // /api/* is also under the api limiter, whose headers win.
            300 - (i + 1)
        );
    }

    let response = fixture
        .client
        .get(fixture.url("/api/exams/99"))
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("x-request-id"));

    let body: serde_json::Value = response.json().await.expect("Failed to parse response");
    assert_eq!(
        body["error"],
        "Too many requests from this IP, please try again later."
    );
    let retry_after = body["retryAfter"].as_u64().expect("retryAfter missing");
    assert!((890..=900).contains(&retry_after), "retryAfter = {retry_after}");

    let health: serde_json::Value = fixture
        .client
        .get(fixture.url("/health"))
        .send()
        .await
        .expect("Health request failed")
        .json()
        .await
        .expect("Failed to parse response");
    assert_eq!(health["status"], "healthy");

    // The bucket is keyed on the loopback peer address.
    let general = &fixture.state.rate_limiters.general;
    assert_eq!(general.len(), 1);
    assert!(!general.check("127.0.0.1").is_allowed());

    fixture.stop().await;
}

#[tokio::test]
async fn test_forwarded_header_ignored_from_untrusted_peer() {
    let fixture = TestFixture::new(config_with_general_limit(1)).await;

    let first = fixture
        .client
        .get(fixture.url("/api/exams/1"))
        .header("x-forwarded-for", "198.51.100.1")
        .send()
        .await
        .expect("Request failed");
    assert!(first.status().is_success());

    // A different spoofed address must not buy a fresh bucket.
    let second = fixture
        .client
        .get(fixture.url("/api/exams/2"))
        .header("x-forwarded-for", "198.51.100.2")
        .send()
        .await
        .expect("Request failed");
    assert_eq!(second.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);

    fixture.stop().await;
}

#[tokio::test]
async fn test_forwarded_header_honoured_from_trusted_proxy() {
    let mut config = config_with_general_limit(1);
    config.trusted_proxies = vec!["127.0.0.0/8".to_string()];
    let fixture = TestFixture::new(config).await;

    for client_ip in ["198.51.100.1", "198.51.100.2"] {
        let response = fixture
            .client
            .get(fixture.url("/api/exams/1"))
            .header("x-forwarded-for", client_ip)
            .send()
            .await
            .expect("Request failed");
        assert!(response.status().is_success(), "{client_ip} was throttled");
    }

    assert_eq!(fixture.state.rate_limiters.general.len(), 2);

    fixture.stop().await;
}

#[tokio::test]
async fn test_compression_over_the_wire() {
    let fixture = TestFixture::new(config_with_general_limit(100)).await;

    // reqwest is built without decompression, so the encoding stays visible.
    let large = fixture
        .client
        .get(fixture.url("/api/question-bank"))
        .header("accept-encoding", "gzip")
        .send()
        .await
        .expect("Request failed");
    assert!(large.status().is_success());
    assert_eq!(large.headers()["content-encoding"], "gzip");
    assert!(large.headers().contains_key("content-security-policy"));

    let opted_out = fixture
        .client
        .get(fixture.url("/api/question-bank?raw"))
        .header("accept-encoding", "gzip")
        .header("x-no-compression", "1")
        .send()
        .await
        .expect("Request failed");
    assert!(!opted_out.headers().contains_key("content-encoding"));
    assert_eq!(opted_out.bytes().await.expect("Failed to read body").len(), 26 * 200);

    fixture.stop().await;
}
