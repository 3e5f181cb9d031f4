//! Coalescing of concurrent identical GET requests.
//!
//! Dashboards fire the same read several times in quick succession (tab
//! restores, double clicks, components mounting in parallel). Instead of
//! running the handler for each copy, the first request for a key becomes the
//! *leader* and executes normally; identical requests arriving while the entry
//! is fresh become *followers* and receive the leader's response.
//!
//! # Key
//!
//! `{method}:{path?query}:{user}`, where `user` is the [`Principal`] id or
//! [`ANONYMOUS`]. Two users never share a response, and neither do two query
//! strings.
//!
//! # Entry lifecycle
//!
//! ```text
//!  acquire ──▶ Pending ──leader finishes──▶ Ready ──TTL after completion──▶ removed
//!                 │
//!                 └──leader dropped (client gone / body error / streamed)──▶ Abandoned ──▶ removed
//! ```
//!
//! - An entry is joinable only while younger than the TTL (5 s by default),
//!   measured from creation. Older entries are replaced, never reused.
//! - Entries older than the TTL are also swept by a background janitor, so an
//!   original request that hangs forever cannot pin its entry in memory.
//! - Followers of an abandoned leader run the handler themselves.
//!
//! Only GET is coalesced. Shared responses are buffered in full, so this layer
//! must sit inside compression: every caller gets its own encoding.
//!
//! A response is only shared when its body has a known size no larger than
//! the coalescer's cap and it is not an event stream. Anything else (SSE,
//! long-polls, chunked downloads, large files) is streamed to the leader
//! untouched, and the leader releases its followers so each of them runs the
//! handler itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, Bytes, HttpBody};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use axum::response::IntoResponse;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio::sync::watch;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{debug, trace, warn};

use super::principal::Principal;
use crate::error::AppError;
use crate::metrics;

/// User marker for requests without a principal.
pub const ANONYMOUS: &str = "anonymous";

/// Set on responses served from another request's execution.
pub const DEDUPLICATED_HEADER: HeaderName = HeaderName::from_static("x-deduplicated");

/// Default cap on a shared response body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

const EVENT_STREAM: &str = "text/event-stream";

/// Build the coalescing key for a request.
pub fn dedup_key(method: &Method, uri: &Uri, principal: Option<&Principal>) -> String {
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let user = principal.map_or(ANONYMOUS, |p| p.user_id.as_str());
    format!("{method}:{target}:{user}")
}

/// Size of `response`'s body if it can be buffered and shared.
///
/// The size comes from the body's exact size hint, falling back to
/// `Content-Length`. Event streams and bodies of unknown or excessive size
/// return `None`.
pub fn shareable_len(response: &Response<Body>, max_body_bytes: usize) -> Option<usize> {
    let headers = response.headers();
    let is_event_stream = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().starts_with(EVENT_STREAM));
    if is_event_stream {
        return None;
    }

    let len = response.body().size_hint().exact().or_else(|| {
        headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
    })?;

    usize::try_from(len).ok().filter(|len| *len <= max_body_bytes)
}

/// A fully buffered response that can be replayed any number of times.
#[derive(Debug)]
pub struct BufferedResponse {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl BufferedResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Rebuild a response for a follower.
    fn replay(&self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = self.status;
        *response.version_mut() = self.version;
        *response.headers_mut() = self.headers.clone();
        response
            .headers_mut()
            .insert(DEDUPLICATED_HEADER, HeaderValue::from_static("true"));
        response
    }
}

#[derive(Debug)]
enum Outcome {
    Pending,
    Ready(Arc<BufferedResponse>),
    Abandoned,
}

struct Entry {
    id: u64,
    created_at: Instant,
    outcome: Arc<watch::Sender<Outcome>>,
}

/// Result of [`RequestCoalescer::acquire`].
pub enum Slot {
    /// Execute the request and publish the response through the guard.
    Leader(LeaderGuard),
    /// Wait for the leader with [`Follower::wait`].
    Follower(Follower),
}

/// Handle to a leader's pending response.
pub struct Follower {
    rx: watch::Receiver<Outcome>,
}

impl Follower {
    /// Wait for the leader. `None` means the leader gave up and the caller
    /// should execute the request itself.
    pub async fn wait(mut self) -> Option<Arc<BufferedResponse>> {
        let outcome = self
            .rx
            .wait_for(|o| !matches!(o, Outcome::Pending))
            .await;
        match outcome {
            Ok(outcome) => match &*outcome {
                Outcome::Ready(response) => Some(response.clone()),
                _ => None,
            },
            Err(_) => None,
        }
    }
}

/// Publishes the leader's outcome.
///
/// Dropping the guard without calling [`LeaderGuard::complete`] marks the
/// entry abandoned and removes it so the next identical request leads anew.
pub struct LeaderGuard {
    coalescer: RequestCoalescer,
    key: String,
    id: u64,
    outcome: Arc<watch::Sender<Outcome>>,
    completed: bool,
}

impl LeaderGuard {
    /// Share the response with current and future followers, then schedule
    /// the entry for removal one TTL from now.
    pub fn complete(mut self, response: Arc<BufferedResponse>) {
        self.completed = true;
        self.outcome.send_replace(Outcome::Ready(response));

        let entries = self.coalescer.entries.clone();
        let key = std::mem::take(&mut self.key);
        let id = self.id;
        let ttl = self.coalescer.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if entries.remove_if(&key, |_, entry| entry.id == id).is_some() {
                trace!(key = %key, "Deduplication entry expired after completion");
            }
        });
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        self.outcome.send_replace(Outcome::Abandoned);
        let id = self.id;
        self.coalescer
            .entries
            .remove_if(&self.key, |_, entry| entry.id == id);
        debug!(key = %self.key, "Leader abandoned, releasing followers");
    }
}

/// Shared table of in-flight and recently completed GET requests.
///
/// Cloning is cheap and clones share the same table.
#[derive(Clone)]
pub struct RequestCoalescer {
    entries: Arc<DashMap<String, Entry>>,
    ttl: Duration,
    max_body_bytes: usize,
    next_id: Arc<AtomicU64>,
}

impl RequestCoalescer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Largest body that will be buffered and shared with followers.
    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Join a fresh entry for `key`, or register a new one and lead it.
    ///
    /// The first caller wins; the map shard lock makes check-and-insert atomic.
    pub fn acquire(&self, key: String) -> Slot {
        let now = Instant::now();

        match self.entries.entry(key) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get();
                let fresh = now.duration_since(entry.created_at) < self.ttl;
                let abandoned = matches!(*entry.outcome.borrow(), Outcome::Abandoned);
                if fresh && !abandoned {
                    return Slot::Follower(Follower {
                        rx: entry.outcome.subscribe(),
                    });
                }

                trace!(key = %occupied.key(), "Replacing stale deduplication entry");
                let (guard, entry) = self.lead(occupied.key().clone(), now);
                occupied.insert(entry);
                Slot::Leader(guard)
            }
            MapEntry::Vacant(vacant) => {
                let (guard, entry) = self.lead(vacant.key().clone(), now);
                vacant.insert(entry);
                Slot::Leader(guard)
            }
        }
    }

    fn lead(&self, key: String, now: Instant) -> (LeaderGuard, Entry) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, _) = watch::channel(Outcome::Pending);
        let outcome = Arc::new(tx);

        let guard = LeaderGuard {
            coalescer: self.clone(),
            key,
            id,
            outcome: outcome.clone(),
            completed: false,
        };
        let entry = Entry {
            id,
            created_at: now,
            outcome,
        };
        (guard, entry)
    }

    /// Remove every entry older than the TTL, finished or not.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.created_at) < ttl);
        before.saturating_sub(self.entries.len())
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Layer applying [`RequestCoalescer`] to GET requests.
#[derive(Clone)]
pub struct DedupLayer {
    coalescer: RequestCoalescer,
}

impl DedupLayer {
    pub fn new(coalescer: RequestCoalescer) -> Self {
        Self { coalescer }
    }
}

impl<S> Layer<S> for DedupLayer {
    type Service = DedupService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DedupService {
            inner,
            coalescer: self.coalescer.clone(),
        }
    }
}

/// Service that coalesces identical GET requests.
#[derive(Clone)]
pub struct DedupService<S> {
    inner: S,
    coalescer: RequestCoalescer,
}

impl<S> Service<Request<Body>> for DedupService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if req.method() != Method::GET {
            return Box::pin(inner.call(req));
        }

        let key = dedup_key(
            req.method(),
            req.uri(),
            req.extensions().get::<Principal>(),
        );
        let slot = self.coalescer.acquire(key.clone());
        let max_body_bytes = self.coalescer.max_body_bytes;

        Box::pin(async move {
            match slot {
                Slot::Leader(guard) => {
                    let response = inner.call(req).await?;
                    let Some(len) = shareable_len(&response, max_body_bytes) else {
                        debug!(key = %key, "Response is streamed or too large to share");
                        drop(guard);
                        return Ok(response);
                    };
                    let (parts, body) = response.into_parts();

                    let body = match axum::body::to_bytes(body, len).await {
                        Ok(body) => body,
                        Err(e) => {
                            // guard drops here and releases followers
                            warn!(key = %key, error = %e, "Failed to buffer response body");
                            return Ok(AppError::Internal(format!(
                                "response body could not be read: {e}"
                            ))
                            .into_response());
                        }
                    };

                    guard.complete(Arc::new(BufferedResponse {
                        status: parts.status,
                        version: parts.version,
                        headers: parts.headers.clone(),
                        body: body.clone(),
                    }));

                    Ok(Response::from_parts(parts, Body::from(body)))
                }
                Slot::Follower(follower) => match follower.wait().await {
                    Some(buffered) => {
                        debug!(key = %key, "Served coalesced GET response");
                        metrics::record_dedup_hit();
                        Ok(buffered.replay())
                    }
                    None => {
                        debug!(key = %key, "Leader abandoned, executing request");
                        inner.call(req).await
                    }
                },
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn ready(body: &'static str) -> Arc<BufferedResponse> {
        Arc::new(BufferedResponse {
            status: StatusCode::OK,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
        })
    }

    #[test]
    fn test_dedup_key_includes_query_and_user() {
        let uri: Uri = "/api/mentor/dashboard?page=2".parse().unwrap();
        let mentor = Principal::new("m-1");

        assert_eq!(
            dedup_key(&Method::GET, &uri, Some(&mentor)),
            "GET:/api/mentor/dashboard?page=2:m-1"
        );
        assert_eq!(
            dedup_key(&Method::GET, &uri, None),
            "GET:/api/mentor/dashboard?page=2:anonymous"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_leads_second_follows() {
        let coalescer = RequestCoalescer::new(Duration::from_secs(5));

        let Slot::Leader(guard) = coalescer.acquire("k".to_string()) else {
            panic!("first acquire must lead");
        };
        let Slot::Follower(follower) = coalescer.acquire("k".to_string()) else {
            panic!("second acquire must follow");
        };

        guard.complete(ready("payload"));
        let response = follower.wait().await.unwrap();
        assert_eq!(response.body().as_ref(), b"payload");
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_entry_served_within_ttl() {
        let coalescer = RequestCoalescer::new(Duration::from_secs(5));
        let Slot::Leader(guard) = coalescer.acquire("k".to_string()) else {
            panic!("must lead");
        };
        guard.complete(ready("cached"));

        tokio::time::advance(Duration::from_secs(2)).await;

        let Slot::Follower(follower) = coalescer.acquire("k".to_string()) else {
            panic!("fresh entry must be joined");
        };
        assert_eq!(follower.wait().await.unwrap().body().as_ref(), b"cached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_is_replaced() {
        let coalescer = RequestCoalescer::new(Duration::from_secs(5));
        let Slot::Leader(_hung) = coalescer.acquire("k".to_string()) else {
            panic!("must lead");
        };

        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(matches!(
            coalescer.acquire("k".to_string()),
            Slot::Leader(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_leader_releases_followers() {
        let coalescer = RequestCoalescer::new(Duration::from_secs(5));
        let Slot::Leader(guard) = coalescer.acquire("k".to_string()) else {
            panic!("must lead");
        };
        let Slot::Follower(follower) = coalescer.acquire("k".to_string()) else {
            panic!("must follow");
        };

        drop(guard);

        assert!(follower.wait().await.is_none());
        assert!(coalescer.is_empty());
        assert!(matches!(
            coalescer.acquire("k".to_string()),
            Slot::Leader(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_removed_one_ttl_after_completion() {
        let coalescer = RequestCoalescer::new(Duration::from_secs(5));
        let Slot::Leader(guard) = coalescer.acquire("k".to_string()) else {
            panic!("must lead");
        };
        guard.complete(ready("x"));
        assert_eq!(coalescer.len(), 1);

        tokio::time::sleep(Duration::from_secs(5) + Duration::from_millis(1)).await;

        assert!(coalescer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_evicts_hung_entries() {
        let coalescer = RequestCoalescer::new(Duration::from_secs(5));
        let Slot::Leader(_hung) = coalescer.acquire("hung".to_string()) else {
            panic!("must lead");
        };

        assert_eq!(coalescer.purge_expired(), 0);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(coalescer.purge_expired(), 1);
        assert!(coalescer.is_empty());
    }

    fn unsized_body() -> Body {
        Body::from_stream(tokio_util::io::ReaderStream::new(&b"chunk"[..]))
    }

    #[test]
    fn test_shareable_len() {
        let sized = Response::new(Body::from("{\"run\":1}"));
        assert_eq!(shareable_len(&sized, 1024), Some(9));
        assert_eq!(shareable_len(&sized, 8), None);

        let events = Response::builder()
            .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
            .body(Body::from("data: 1\n\n"))
            .unwrap();
        assert_eq!(shareable_len(&events, 1024), None);

        assert_eq!(shareable_len(&Response::new(unsized_body()), 1024), None);

        let declared = Response::builder()
            .header(header::CONTENT_LENGTH, "5")
            .body(unsized_body())
            .unwrap();
        assert_eq!(shareable_len(&declared, 1024), Some(5));
    }

    #[tokio::test]
    async fn test_unshareable_response_releases_followers() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();
        let app = axum::Router::new()
            .route(
                "/download",
                axum::routing::get(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        unsized_body()
                    }
                }),
            )
            .layer(DedupLayer::new(RequestCoalescer::new(Duration::from_secs(5))));

        let request = || Request::get("/download").body(Body::empty()).unwrap();
        let (first, second) = tokio::join!(
            tower::ServiceExt::oneshot(app.clone(), request()),
            tower::ServiceExt::oneshot(app.clone(), request()),
        );

        for response in [first.unwrap(), second.unwrap()] {
            assert!(!response.headers().contains_key(DEDUPLICATED_HEADER));
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            assert_eq!(body.as_ref(), b"chunk");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_replay_marks_response() {
        let response = ready("{}").replay();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(DEDUPLICATED_HEADER).unwrap(), "true");
    }
}
