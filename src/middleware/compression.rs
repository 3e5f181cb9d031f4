//! Response compression.
//!
//! Bodies above the configured threshold are compressed with whatever the
//! client negotiated through `Accept-Encoding` (gzip, deflate, br or zstd).
//! Images, gRPC and server-sent events are never compressed.
//!
//! A client can opt out per request by sending `X-No-Compression`; the
//! header's value is ignored.

use axum::extract::Request;
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use tower_http::compression::CompressionLayer;
use tower_http::compression::predicate::{And, NotForContentType, Predicate, SizeAbove};
use tracing::trace;

/// Request header that disables compression for one request.
pub const NO_COMPRESSION_HEADER: &str = "x-no-compression";

/// The predicate deciding which responses get compressed.
pub type CompressionPredicate =
    And<And<And<SizeAbove, NotForContentType>, NotForContentType>, NotForContentType>;

/// Compression layer that leaves bodies smaller than `threshold` bytes alone.
pub fn compression_layer(threshold: u16) -> CompressionLayer<CompressionPredicate> {
    let predicate = SizeAbove::new(threshold)
        .and(NotForContentType::GRPC)
        .and(NotForContentType::IMAGES)
        .and(NotForContentType::SSE);

    CompressionLayer::new().compress_when(predicate)
}

/// Strip `Accept-Encoding` from requests carrying [`NO_COMPRESSION_HEADER`].
///
/// Must run before the compression layer sees the request.
pub async fn honor_no_compression(mut request: Request, next: Next) -> Response {
    if request.headers().contains_key(NO_COMPRESSION_HEADER) {
        trace!("Client opted out of compression");
        request.headers_mut().remove(header::ACCEPT_ENCODING);
    }
    next.run(request).await
}
