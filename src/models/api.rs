use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::middleware::FixedWindowLimiter;
use crate::monitor::MemorySample;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"healthy"` while the process can answer
    pub status: String,
    /// Service version
    pub version: String,
    pub uptime_seconds: u64,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// Readiness probe response.
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    /// `"ready"` or `"shutting_down"`
    pub status: String,
}

/// Snapshot of one rate-limit policy.
#[derive(Debug, Serialize)]
pub struct RateLimitStats {
    pub policy: String,
    pub window_secs: u64,
    pub max_requests: u32,
    /// Clients with a bucket in memory, including not-yet-swept expired ones
    pub tracked_clients: usize,
}

impl From<&FixedWindowLimiter> for RateLimitStats {
    fn from(limiter: &FixedWindowLimiter) -> Self {
        let policy = limiter.policy();
        Self {
            policy: policy.name.to_string(),
            window_secs: policy.window.as_secs(),
            max_requests: policy.max_requests,
            tracked_clients: limiter.len(),
        }
    }
}

/// Snapshot of the GET coalescer.
#[derive(Debug, Serialize)]
pub struct DedupStats {
    /// Pending or recently completed entries
    pub entries: usize,
    pub ttl_ms: u64,
}

/// Pipeline statistics served at `/api/stats`.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub uptime_seconds: u64,
    pub rate_limits: Vec<RateLimitStats>,
    pub dedup: DedupStats,
    /// Latest memory monitor reading; absent until the first sample
    pub memory: Option<MemorySample>,
}
