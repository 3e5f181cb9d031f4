//! Health, readiness, and pipeline statistics endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness; 200 whenever the process can answer
//! - `GET /ready` - Readiness; 503 once shutdown has begun
//! - `GET /api/stats` - Rate-limit, dedup and memory statistics
//!
//! `/health` and `/ready` are mounted outside the rate limiters so probes are
//! never throttled.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::instrument;

use crate::models::{DedupStats, HealthResponse, RateLimitStats, ReadinessResponse, StatsResponse};
use crate::state::AppState;

/// Liveness probe.
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "uptime_seconds": 3600,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        timestamp: Utc::now(),
    })
}

/// Readiness probe for load balancers and orchestrators.
///
/// Turns 503 as soon as a shutdown signal is received so new traffic drains
/// away while in-flight requests finish.
#[instrument(skip(state))]
pub async fn readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready".to_string(),
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                status: "shutting_down".to_string(),
            }),
        )
    }
}

/// Pipeline statistics.
///
/// ```json
/// {
///   "uptime_seconds": 3600,
///   "rate_limits": [
///     { "policy": "general", "window_secs": 900, "max_requests": 100, "tracked_clients": 42 }
///   ],
///   "dedup": { "entries": 3, "ttl_ms": 5000 },
///   "memory": { "process_resident_bytes": 73400320, "...": "..." }
/// }
/// ```
#[instrument(skip(state))]
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let limiters = &state.rate_limiters;
    let ttl_ms = u64::try_from(state.coalescer.ttl().as_millis()).unwrap_or(u64::MAX);

    Json(StatsResponse {
        uptime_seconds: state.uptime_seconds(),
        rate_limits: vec![
            RateLimitStats::from(&limiters.general),
            RateLimitStats::from(&limiters.api),
            RateLimitStats::from(&limiters.auth),
        ],
        dedup: DedupStats {
            entries: state.coalescer.len(),
            ttl_ms,
        },
        memory: state.latest_memory().await,
    })
}
