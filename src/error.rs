//! Typed error taxonomy and the uniform client-facing error envelope.
//!
//! Every failure a client can observe is a [`ProxyError`] variant, and every
//! variant maps to exactly one HTTP status. Handlers return
//! `Result<T, ProxyError>` and propagate with `?` — the [`IntoResponse`]
//! impl renders the `{"error": {...}}` envelope so no handler builds error
//! JSON by hand. Stack traces and internal messages never cross the boundary:
//! `Internal` errors are logged in full and surfaced as a generic message.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// All client-visible failure modes.
///
/// The variants mirror the propagation policy: `UpstreamTransient` is only
/// ever seen inside the forwarder (it drives the fallback chain) and is
/// converted to `UpstreamFatal` once every fallback is exhausted.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Bad client input. Never retried.
    #[error("{0}")]
    Validation(String),

    /// Oversize request body.
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Unknown path.
    #[error("not found")]
    NotFound,

    /// Known path, wrong HTTP method.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// No model satisfies the request constraints.
    #[error("routing failed: {0}")]
    Routing(String),

    /// The upstream rejected our signed payment (second 402).
    /// Carries the upstream 402 body so the client sees the real challenge.
    #[error("payment rejected by upstream")]
    PaymentRejected { upstream_body: String },

    /// Network error or upstream 5xx — retried on the next fallback model.
    #[error("upstream transient failure: {0}")]
    UpstreamTransient(String),

    /// Every fallback exhausted.
    #[error("all upstream attempts failed: {0}")]
    UpstreamFatal(String),

    /// A non-402 4xx from upstream, surfaced as-is.
    #[error("upstream returned {status}")]
    UpstreamClient { status: u16, body: String },

    /// A deadline elapsed before the upstream responded.
    #[error("upstream deadline exceeded")]
    Timeout,

    /// Invariant violated. Logged; the proxy stays up.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ProxyError {
    /// Stable machine-readable type tag used in the envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_request_error",
            Self::PayloadTooLarge { .. } => "invalid_request_error",
            Self::NotFound => "not_found_error",
            Self::MethodNotAllowed => "invalid_request_error",
            Self::Routing(_) => "routing_error",
            Self::PaymentRejected { .. } => "payment_error",
            Self::UpstreamTransient(_) | Self::UpstreamFatal(_) => "upstream_error",
            Self::UpstreamClient { .. } => "upstream_error",
            Self::Timeout => "timeout_error",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Routing(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::PaymentRejected { .. } => StatusCode::PAYMENT_REQUIRED,
            // Transient errors should have been recovered inside the
            // forwarder; if one escapes, treat it like exhaustion.
            Self::UpstreamTransient(_) | Self::UpstreamFatal(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamClient { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render the uniform `{"error": {...}}` envelope body.
    pub fn envelope(&self) -> serde_json::Value {
        let message = match self {
            // Internal details stay in the logs.
            Self::Internal(_) => "internal proxy error".to_string(),
            other => other.to_string(),
        };
        json!({
            "error": {
                "message": message,
                "type": self.kind(),
                "code": self.status().as_u16(),
            }
        })
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match &self {
            ProxyError::Internal(e) => {
                tracing::error!(error = ?e, "internal handler error");
            }
            ProxyError::PaymentRejected { upstream_body } => {
                tracing::warn!(body = %upstream_body, "payment rejected by upstream");
                // Surface the upstream 402 body unchanged when it is valid JSON.
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(upstream_body) {
                    return (StatusCode::PAYMENT_REQUIRED, Json(value)).into_response();
                }
            }
            ProxyError::UpstreamClient { status, body } => {
                tracing::warn!(status, "surfacing upstream client error");
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
                    return (self.status(), Json(value)).into_response();
                }
            }
            other => {
                tracing::warn!(error = %other, "request failed");
            }
        }
        (self.status(), Json(self.envelope())).into_response()
    }
}
