//! Per-request latency logging.
//!
//! Wraps the whole pipeline, so the measured time covers every inner layer
//! including rejections from the rate limiter. Duration is taken when the
//! response head is produced; streaming body time is not included.

use std::task::{Context, Poll};
use std::time::Duration;

use axum::http::{Request, Response};
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{info, warn};

use super::request_id::REQUEST_ID_HEADER;
use crate::metrics;

#[derive(Clone)]
pub struct PerfLoggerLayer {
    slow_threshold: Duration,
}

impl PerfLoggerLayer {
    /// Requests taking longer than `slow_threshold` get an extra warning.
    pub fn new(slow_threshold: Duration) -> Self {
        Self { slow_threshold }
    }
}

impl<S> Layer<S> for PerfLoggerLayer {
    type Service = PerfLoggerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PerfLoggerService {
            inner,
            slow_threshold: self.slow_threshold,
        }
    }
}

#[derive(Clone)]
pub struct PerfLoggerService<S> {
    inner: S,
    slow_threshold: Duration,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for PerfLoggerService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let slow_threshold = self.slow_threshold;
        let future = self.inner.call(req);

        Box::pin(async move {
            let response = future.await?;
            let elapsed = start.elapsed();
            let status = response.status().as_u16();
            let request_id = response
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-");
            let duration_ms = millis(elapsed);

            info!(
                method = %method,
                path = %path,
                status,
                duration_ms,
                request_id,
                "Request completed"
            );
            metrics::record_request_duration(method.as_str(), status, elapsed.as_secs_f64());

            if elapsed > slow_threshold {
                warn!(
                    method = %method,
                    path = %path,
                    duration_ms,
                    threshold_ms = millis(slow_threshold),
                    request_id,
                    "Slow request"
                );
                metrics::record_slow_request();
            }

            Ok(response)
        })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
