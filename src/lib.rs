//! # ExamPro API
//!
//! The HTTP service layer of the ExamPro exam platform, built on Axum. It
//! wraps the platform's routes in a request pipeline providing:
//!
//! - **Traffic control**: fixed-window per-IP rate limits (general, API, auth)
//! - **Request coalescing**: identical concurrent GETs share one handler run
//! - **Response shaping**: compression and a fixed Content-Security-Policy
//! - **Observability**: per-request latency logs, memory sampling, Prometheus
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Perf → Request ID → Security → Compression                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Rate Limit (general → api → auth) → Principal → Dedup      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, stats, application /api routes)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  AppState (limiters, coalescer, memory monitor, janitors)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use axum::Router;
//! use axum::routing::get;
//! use exampro_api::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config);
//!
//!     let api = Router::new().route("/api/mentor/dashboard", get(|| async { "{}" }));
//!     let app = build_router(state.clone(), api)?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:5000").await?;
//!     axum::serve(
//!         listener,
//!         app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
//!     )
//!     .await?;
//!
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Tuning
//!
//! ```bash
//! GENERAL_RATE_LIMIT_MAX=500 DEDUP_TTL_MS=2000 LOG_FORMAT=json cargo run
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod monitor;
pub mod routes;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use routes::{api_routes, build_router};
pub use state::AppState;
