mod api;

pub use api::{DedupStats, HealthResponse, RateLimitStats, ReadinessResponse, StatsResponse};
