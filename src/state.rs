//! Shared application state for Axum handlers and middleware.
//!
//! Everything the pipeline mutates (rate-limit buckets, in-flight GETs, the
//! latest memory sample) lives here and is injected into the layers when the
//! router is built. Nothing is a process-wide singleton, so every test can
//! build an isolated instance.
//!
//! # Structured Concurrency
//!
//! Background tasks (memory monitor, rate-limit janitor, dedup janitor) run
//! under a `TaskTracker` and stop on a `CancellationToken`. Call
//! [`AppState::shutdown`] once the HTTP server has drained.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::config::Config;
use crate::middleware::{FixedWindowLimiter, RequestCoalescer, TrustedProxyConfig};
use crate::monitor::{MemoryMonitor, MemorySample};

/// The three independent limiters.
#[derive(Clone)]
pub struct RateLimiters {
    pub general: FixedWindowLimiter,
    pub auth: FixedWindowLimiter,
    pub api: FixedWindowLimiter,
}

impl RateLimiters {
    fn from_config(config: &Config) -> Self {
        Self {
            general: FixedWindowLimiter::new(config.general_rate_limit.clone()),
            auth: FixedWindowLimiter::new(config.auth_rate_limit.clone()),
            api: FixedWindowLimiter::new(config.api_rate_limit.clone()),
        }
    }

    fn all(&self) -> [&FixedWindowLimiter; 3] {
        [&self.general, &self.auth, &self.api]
    }
}

/// Shared application state. Cheap to clone.
///
/// ```rust,ignore
/// let state = AppState::new(config);
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub started_at: Instant,
    pub rate_limiters: RateLimiters,
    pub coalescer: RequestCoalescer,
    pub trusted_proxies: Arc<TrustedProxyConfig>,
    latest_memory: Arc<RwLock<Option<MemorySample>>>,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build the state and start its background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: Config) -> Self {
        let trusted_proxies = Arc::new(TrustedProxyConfig::new(&config.trusted_proxies));
        let rate_limiters = RateLimiters::from_config(&config);
        let coalescer = RequestCoalescer::new(config.dedup_ttl)
            .with_max_body_bytes(config.dedup_max_body_bytes);

        let state = Self {
            config: Arc::new(config),
            started_at: Instant::now(),
            rate_limiters,
            coalescer,
            trusted_proxies,
            latest_memory: Arc::new(RwLock::new(None)),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_memory_monitor();
        state.spawn_rate_limit_janitor();
        state.spawn_dedup_janitor();

        state
    }

    /// The most recent memory reading, if the monitor has run yet.
    pub async fn latest_memory(&self) -> Option<MemorySample> {
        self.latest_memory.read().await.clone()
    }

    /// Whether the service should still receive traffic.
    pub fn is_ready(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    /// Flip readiness and stop background work without waiting.
    ///
    /// Called as soon as a shutdown signal arrives, while in-flight requests
    /// are still draining.
    pub fn begin_shutdown(&self) {
        if !self.cancellation_token.is_cancelled() {
            info!("Shutdown requested, marking service as not ready");
            self.cancellation_token.cancel();
        }
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.begin_shutdown();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn spawn_memory_monitor(&self) {
        let latest = self.latest_memory.clone();
        let period = self.config.memory_monitor_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut monitor = MemoryMonitor::new();
            // First tick fires immediately, giving a startup reading.
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Memory monitor received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let sample = monitor.record();
                        *latest.write().await = Some(sample);
                    }
                }
            }

            debug!("Memory monitor shutting down");
        });
    }

    fn spawn_rate_limit_janitor(&self) {
        let limiters = self.rate_limiters.clone();
        let period = self.config.rate_limit_sweep_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Rate-limit janitor received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        for limiter in limiters.all() {
                            let removed = limiter.purge_expired();
                            if removed > 0 {
                                trace!(
                                    policy = limiter.policy().name,
                                    removed,
                                    remaining = limiter.len(),
                                    "Swept expired rate-limit buckets"
                                );
                            }
                        }
                    }
                }
            }

            debug!("Rate-limit janitor shutting down");
        });
    }

    fn spawn_dedup_janitor(&self) {
        let coalescer = self.coalescer.clone();
        let period = self.config.dedup_ttl.max(Duration::from_millis(100));
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Dedup janitor received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = coalescer.purge_expired();
                        if removed > 0 {
                            trace!(removed, "Evicted expired dedup entries");
                        }
                    }
                }
            }

            debug!("Dedup janitor shutting down");
        });
    }
}
