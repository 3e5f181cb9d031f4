//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with defaults that
//! reproduce the platform's historical constants. In production, configure via
//! environment variables or a `.env` file.
//!
//! # Traffic Control
//!
//! - `GENERAL_RATE_LIMIT_WINDOW_SECS` / `GENERAL_RATE_LIMIT_MAX`: 900 s / 100 requests
//! - `AUTH_RATE_LIMIT_WINDOW_SECS` / `AUTH_RATE_LIMIT_MAX`: 60 s / 300 requests
//! - `API_RATE_LIMIT_WINDOW_SECS` / `API_RATE_LIMIT_MAX`: 60 s / 300 requests
//! - `DEDUP_TTL_MS`: lifetime of a coalesced GET entry (default: 5000)
//!
//! # Response Shaping
//!
//! - `COMPRESSION_THRESHOLD_BYTES`: minimum body size to compress (default: 1024)
//! - `CSP_CONNECT_ORIGIN`: extra origin allowed in `connect-src` (default: the
//!   code-execution service at `http://localhost:2358`)
//!
//! # Observability
//!
//! - `SLOW_REQUEST_THRESHOLD_MS`: warn above this latency (default: 1000)
//! - `MEMORY_MONITOR_INTERVAL_SECS`: memory sampling period (default: 300)
//! - `LOG_FORMAT`: `text` or `json` (default: `text`)
//! - `METRICS_PORT`: Prometheus listener port, 0 disables (default: 9090)

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::middleware::rate_limit::RateLimitPolicy;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, one line per event.
    #[default]
    Text,
    /// One JSON object per event, for log shippers.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" | "plain" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (expected 'text' or 'json')")),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => f.write_str("text"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 5000)
    pub port: u16,

    /// Maximum request body size in bytes (default: 10MB)
    pub max_request_body_size: usize,

    /// Allowed CORS origins, `*` for any.
    pub cors_allowed_origins: Vec<String>,

    /// CIDR ranges of reverse proxies whose `X-Forwarded-For` / `X-Real-IP`
    /// headers are believed. Empty means forwarded headers are ignored and
    /// the peer address is used.
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Policy applied to every request.
    pub general_rate_limit: RateLimitPolicy,

    /// Policy applied to `/api/auth/*`.
    pub auth_rate_limit: RateLimitPolicy,

    /// Policy applied to `/api/*`.
    pub api_rate_limit: RateLimitPolicy,

    /// How often expired rate-limit buckets are swept.
    pub rate_limit_sweep_interval: Duration,

    // =========================================================================
    // Request Deduplication
    // =========================================================================
    /// How long a GET entry may be joined by identical requests.
    pub dedup_ttl: Duration,

    /// Largest response body a coalesced GET may buffer. Bigger or unsized
    /// (streaming) responses pass through to each caller individually.
    pub dedup_max_body_bytes: usize,

    // =========================================================================
    // Response Shaping
    // =========================================================================
    /// Bodies smaller than this are sent uncompressed.
    pub compression_threshold: u16,

    /// Additional origin allowed by the `connect-src` CSP directive.
    pub csp_connect_origin: String,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Requests slower than this are logged at warn level.
    pub slow_request_threshold: Duration,

    /// Memory monitor sampling period.
    pub memory_monitor_interval: Duration,

    /// Log filter directive (e.g., "info", "exampro_api=debug")
    pub log_level: String,

    /// Log line format.
    pub log_format: LogFormat,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any value fails to parse or validate.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();

        let config = Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: Self::parse_env("PORT", defaults.port)?,
            max_request_body_size: Self::parse_env(
                "MAX_REQUEST_BODY_SIZE",
                defaults.max_request_body_size,
            )?,
            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS")
                .unwrap_or(defaults.cors_allowed_origins),
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES").unwrap_or_default(),

            general_rate_limit: Self::parse_policy("GENERAL", defaults.general_rate_limit)?,
            auth_rate_limit: Self::parse_policy("AUTH", defaults.auth_rate_limit)?,
            api_rate_limit: Self::parse_policy("API", defaults.api_rate_limit)?,
            rate_limit_sweep_interval: Duration::from_secs(Self::parse_env(
                "RATE_LIMIT_SWEEP_INTERVAL_SECS",
                defaults.rate_limit_sweep_interval.as_secs(),
            )?),

            dedup_ttl: Duration::from_millis(Self::parse_env(
                "DEDUP_TTL_MS",
                millis(defaults.dedup_ttl),
            )?),
            dedup_max_body_bytes: Self::parse_env(
                "DEDUP_MAX_BODY_BYTES",
                defaults.dedup_max_body_bytes,
            )?,

            compression_threshold: Self::parse_env(
                "COMPRESSION_THRESHOLD_BYTES",
                defaults.compression_threshold,
            )?,
            csp_connect_origin: env::var("CSP_CONNECT_ORIGIN")
                .map(|s| s.trim().to_string())
                .unwrap_or(defaults.csp_connect_origin),

            slow_request_threshold: Duration::from_millis(Self::parse_env(
                "SLOW_REQUEST_THRESHOLD_MS",
                millis(defaults.slow_request_threshold),
            )?),
            memory_monitor_interval: Duration::from_secs(Self::parse_env(
                "MEMORY_MONITOR_INTERVAL_SECS",
                defaults.memory_monitor_interval.as_secs(),
            )?),
            log_level: env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: Self::parse_env("LOG_FORMAT", defaults.log_format)?,
            metrics_port: Self::parse_env("METRICS_PORT", defaults.metrics_port)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        for (prefix, policy) in [
            ("GENERAL", &self.general_rate_limit),
            ("AUTH", &self.auth_rate_limit),
            ("API", &self.api_rate_limit),
        ] {
            if policy.max_requests == 0 {
                return Err(AppError::ConfigError(format!(
                    "{prefix}_RATE_LIMIT_MAX must be greater than 0"
                )));
            }
            if policy.window.is_zero() {
                return Err(AppError::ConfigError(format!(
                    "{prefix}_RATE_LIMIT_WINDOW_SECS must be greater than 0"
                )));
            }
        }

        if self.rate_limit_sweep_interval.is_zero() {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_SWEEP_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        if self.dedup_ttl.is_zero() {
            return Err(AppError::ConfigError(
                "DEDUP_TTL_MS must be greater than 0".to_string(),
            ));
        }

        if self.memory_monitor_interval.is_zero() {
            return Err(AppError::ConfigError(
                "MEMORY_MONITOR_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        // The origin is spliced into a header value; reject anything that
        // could terminate the directive or inject another one.
        if self.csp_connect_origin.is_empty()
            || self
                .csp_connect_origin
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || matches!(c, ';' | ',' | '\''))
        {
            return Err(AppError::ConfigError(format!(
                "CSP_CONNECT_ORIGIN is not a valid origin: {:?}",
                self.csp_connect_origin
            )));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Read `{PREFIX}_RATE_LIMIT_WINDOW_SECS` and `{PREFIX}_RATE_LIMIT_MAX`
    /// on top of a default policy.
    fn parse_policy(prefix: &str, default: RateLimitPolicy) -> AppResult<RateLimitPolicy> {
        let window_secs = Self::parse_env(
            &format!("{prefix}_RATE_LIMIT_WINDOW_SECS"),
            default.window.as_secs(),
        )?;
        let max_requests =
            Self::parse_env(&format!("{prefix}_RATE_LIMIT_MAX"), default.max_requests)?;

        Ok(default
            .with_window(Duration::from_secs(window_secs))
            .with_max_requests(max_requests))
    }

    /// Parse a comma-separated list. Returns `None` when the variable is unset
    /// or blank.
    fn parse_list(name: &str) -> Option<Vec<String>> {
        env::var(name)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Defaults reproduce the constants the platform has always run with.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            max_request_body_size: 10 * 1024 * 1024, // 10MB
            cors_allowed_origins: vec!["*".to_string()],
            trusted_proxies: vec![],
            general_rate_limit: RateLimitPolicy::general(),
            auth_rate_limit: RateLimitPolicy::auth(),
            api_rate_limit: RateLimitPolicy::api(),
            rate_limit_sweep_interval: Duration::from_secs(60),
            dedup_ttl: Duration::from_secs(5),
            dedup_max_body_bytes: 1024 * 1024, // 1MB
            compression_threshold: 1024,
            csp_connect_origin: "http://localhost:2358".to_string(),
            slow_request_threshold: Duration::from_millis(1000),
            memory_monitor_interval: Duration::from_secs(5 * 60),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_port: 9090,
        }
    }
}
