//! Request correlation ids.
//!
//! One id follows a request through the whole proxy: the tracing span, the
//! traffic-ring entry, and the `X-Request-ID` response header all carry the
//! same value, so a client-reported failure can be matched against logs and
//! the ring without guesswork.
//!
//! Caller-supplied ids are adopted only when they are sane; anything
//! over-long or containing non-visible bytes is replaced with a minted UUID
//! rather than smuggled into log lines and response headers.

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument as _;
use uuid::Uuid;

const HEADER: &str = "x-request-id";

/// Longest caller id we will adopt. A UUID is 36 chars; this leaves room
/// for common `trace-id.span-id` composites without admitting abuse.
const MAX_CALLER_ID_LEN: usize = 64;

/// Correlation id for one request, available to handlers as an axum
/// extension and recorded on the request's [`TrafficEntry`].
///
/// [`TrafficEntry`]: crate::traffic::TrafficEntry
#[derive(Clone, Debug)]
pub struct RequestId(String);

impl RequestId {
    /// Mint a fresh id.
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Adopt the caller's `X-Request-ID` when it is short visible ASCII,
    /// otherwise mint.
    fn adopt_or_mint(headers: &HeaderMap) -> Self {
        headers
            .get(HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|id| Self::acceptable(id))
            .map(|id| Self(id.to_string()))
            .unwrap_or_else(Self::mint)
    }

    fn acceptable(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= MAX_CALLER_ID_LEN
            && id.bytes().all(|b| (0x21..=0x7e).contains(&b))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Middleware: attach a [`RequestId`] and echo it back to the client.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = RequestId::adopt_or_mint(req.headers());
    let span = tracing::info_span!(
        "request",
        id = %id.as_str(),
        method = %req.method(),
        path = %req.uri().path(),
    );
    req.extensions_mut().insert(id.clone());

    let mut response = next.run(req).instrument(span).await;

    // Adopted ids passed `acceptable` and minted ids are UUIDs, so this
    // cannot contain invalid header bytes.
    let echo = HeaderValue::from_str(id.as_str()).expect("request ids are visible ASCII");
    response.headers_mut().insert(HEADER, echo);
    response
}
