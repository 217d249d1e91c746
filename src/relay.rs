//! Response relay: the upstream pump and the client-facing body builders.
//!
//! Exactly one pump task runs per dedup entry. It owns the upstream response,
//! applies the thinking-token post-processor, and appends client-visible
//! bytes to the entry; every client — origin and subscribers alike — reads
//! the entry through an [`EntryReader`], so all of them observe the same
//! byte sequence.
//!
//! SSE discipline:
//! - response headers are committed before the first upstream byte
//! - `: heartbeat` comments flow every 10 s until the first data event
//! - the post-processor runs per event, with carry-over across chunk splits
//! - streams always terminate with `data: [DONE]`; upstream errors and
//!   deadline hits become synthetic `data: {"error":…}` events first

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt as _;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::{
    dedup::{DedupEntry, EntryReader},
    strip::ThinkingStripper,
};

/// Deadlines the pump enforces, absolute from request start.
#[derive(Debug, Clone, Copy)]
pub struct PumpDeadlines {
    pub first_byte: Instant,
    pub total: Instant,
}

impl PumpDeadlines {
    pub fn from_config(start: Instant, config: &crate::config::ProxyConfig) -> Self {
        Self {
            first_byte: start + Duration::from_millis(config.first_byte_timeout_ms),
            total: start + Duration::from_millis(config.request_timeout_ms),
        }
    }
}

/// Spawn the pump for one upstream response. `stream` is the mode the
/// upstream request was made in (the origin client's choice).
pub fn spawn_pump(
    entry: Arc<DedupEntry>,
    response: reqwest::Response,
    stream: bool,
    deadlines: PumpDeadlines,
) {
    tokio::spawn(async move {
        if stream {
            pump_sse(entry, response, deadlines).await;
        } else {
            pump_buffered(entry, response, deadlines).await;
        }
    });
}

/// Relay an SSE upstream: headers first, then per-event processing.
async fn pump_sse(entry: Arc<DedupEntry>, response: reqwest::Response, deadlines: PumpDeadlines) {
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("text/event-stream")
        .to_string();
    // Commit before the first body byte so subscribers stop waiting.
    entry.set_headers(status, &content_type);

    let cancel = entry.cancelled();
    let mut body = response.bytes_stream();
    let mut pending = BytesMut::new();
    let mut stripper = ThinkingStripper::default();
    let mut saw_done = false;
    let mut deadline = deadlines.first_byte.min(deadlines.total);

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                // Last reader went away: drop the upstream socket now.
                tracing::debug!("relay cancelled — no readers remain");
                entry.finish(false);
                return;
            }
            next = tokio::time::timeout_at(deadline, body.next()) => match next {
                Err(_) => {
                    entry.push_chunk(error_event("upstream deadline exceeded", "timeout_error"));
                    entry.finish(false);
                    return;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::warn!(error = %e, "upstream stream failed mid-relay");
                    entry.push_chunk(error_event(&format!("upstream error: {e}"), "upstream_error"));
                    entry.finish(false);
                    return;
                }
                Ok(Some(Ok(bytes))) => bytes,
            },
        };
        deadline = deadlines.total;

        pending.extend_from_slice(&chunk);
        while let Some(end) = find_event_boundary(&pending) {
            let frame = pending.split_to(end);
            let processed = process_event(&frame, &mut stripper, &mut saw_done);
            if !processed.is_empty() {
                entry.push_chunk(processed);
            }
        }
    }

    // Upstream closed cleanly. Forward any unterminated partial frame as-is.
    if !pending.is_empty() {
        entry.push_chunk(pending.freeze());
    }
    let tail = stripper.finish();
    if !tail.is_empty() {
        entry.push_chunk(delta_event(&tail));
    }
    if !saw_done {
        entry.push_chunk(Bytes::from_static(b"data: [DONE]\n\n"));
    }
    entry.finish(true);
}

/// Read a buffered upstream fully, strip, publish in one piece.
///
/// Headers are withheld until the body is in hand: a deadline hit must
/// surface as 504, not as a truncated 200.
async fn pump_buffered(entry: Arc<DedupEntry>, response: reqwest::Response, deadlines: PumpDeadlines) {
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    let cancel = entry.cancelled();
    let body = tokio::select! {
        _ = cancel.cancelled() => {
            entry.finish(false);
            return;
        }
        read = tokio::time::timeout_at(deadlines.total, response.bytes()) => read,
    };

    match body {
        Ok(Ok(bytes)) => {
            let ok = (200..300).contains(&status);
            entry.set_headers(status, &content_type);
            entry.push_chunk(strip_buffered(&bytes));
            entry.finish(ok);
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "reading upstream body failed");
            let envelope = crate::error::ProxyError::UpstreamFatal(e.to_string()).envelope();
            entry.set_headers(502, "application/json");
            entry.push_chunk(Bytes::from(envelope.to_string()));
            entry.finish(false);
        }
        Err(_) => {
            let envelope = crate::error::ProxyError::Timeout.envelope();
            entry.set_headers(504, "application/json");
            entry.push_chunk(Bytes::from(envelope.to_string()));
            entry.finish(false);
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Client-facing bodies
// ──────────────────────────────────────────────────────────────────────────────

/// SSE response over an entry reader, with heartbeats until the first event.
pub fn sse_response(mut reader: EntryReader, heartbeat: Duration) -> Response {
    let stream = async_stream::stream! {
        let first = loop {
            tokio::select! {
                chunk = reader.next_chunk() => break chunk,
                _ = tokio::time::sleep(heartbeat) => {
                    yield Ok::<Bytes, Infallible>(Bytes::from_static(b": heartbeat\n\n"));
                }
            }
        };
        if let Some(chunk) = first {
            yield Ok(chunk);
            while let Some(chunk) = reader.next_chunk().await {
                yield Ok(chunk);
            }
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .expect("static SSE response headers are valid")
}

/// Buffered response: wait for the entry to complete, return it whole.
pub async fn buffered_response(reader: EntryReader) -> Response {
    let (status, content_type, body) = reader.collect().await;
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .expect("response from recorded entry is valid")
}

// ──────────────────────────────────────────────────────────────────────────────
// SSE event processing
// ──────────────────────────────────────────────────────────────────────────────

/// Byte offset just past the first complete SSE event (`\n\n` terminated).
fn find_event_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n").map(|pos| pos + 2)
}

/// Rewrite one complete event frame through the stripper.
///
/// Comment lines and unparsable payloads pass through verbatim; `[DONE]` is
/// flagged so the pump does not append a duplicate terminator.
fn process_event(frame: &[u8], stripper: &mut ThinkingStripper, saw_done: &mut bool) -> Bytes {
    let Ok(text) = std::str::from_utf8(frame) else {
        return Bytes::copy_from_slice(frame);
    };

    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let Some(payload) = line.strip_prefix("data:") else {
            // Comments, `event:` lines, blank separators.
            out.push_str(line);
            out.push('\n');
            continue;
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            *saw_done = true;
            out.push_str(line);
            out.push('\n');
            continue;
        }
        match serde_json::from_str::<Value>(payload) {
            Ok(mut event) => {
                if let Some(choices) = event["choices"].as_array_mut() {
                    for choice in choices {
                        if let Some(content) =
                            choice.pointer("/delta/content").and_then(Value::as_str)
                        {
                            let stripped = stripper.strip_chunk(content);
                            choice["delta"]["content"] = Value::String(stripped);
                        }
                    }
                }
                out.push_str("data: ");
                out.push_str(&event.to_string());
                out.push('\n');
            }
            Err(_) => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    Bytes::from(out)
}

/// Synthetic delta carrying text the stripper withheld until stream end.
fn delta_event(content: &str) -> Bytes {
    let event = json!({ "choices": [{ "index": 0, "delta": { "content": content } }] });
    Bytes::from(format!("data: {event}\n\n"))
}

/// Synthetic terminal error event.
fn error_event(message: &str, kind: &str) -> Bytes {
    let event = json!({ "error": { "message": message, "type": kind } });
    Bytes::from(format!("data: {event}\n\n"))
}

/// Strip thinking tokens from a complete buffered completion body.
fn strip_buffered(body: &[u8]) -> Bytes {
    let Ok(mut value) = serde_json::from_slice::<Value>(body) else {
        return Bytes::copy_from_slice(body);
    };
    let Some(choices) = value["choices"].as_array_mut() else {
        return Bytes::copy_from_slice(body);
    };
    for choice in choices {
        if let Some(content) = choice.pointer("/message/content").and_then(Value::as_str) {
            let stripped = ThinkingStripper::strip_complete(content);
            choice["message"]["content"] = Value::String(stripped);
        }
    }
    Bytes::from(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DedupConfig;
    use crate::dedup::{fingerprint, DedupCache, Lookup};
    use futures_util::StreamExt as _;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn origin_entry() -> (DedupCache, crate::dedup::OriginHandle) {
        let cache = DedupCache::new(DedupConfig::default());
        let fp = fingerprint("m", &serde_json::json!({ "messages": [] }));
        match cache.lookup(fp) {
            Lookup::Miss(origin) => (cache, origin),
            Lookup::Join { .. } => unreachable!("fresh cache cannot join"),
        }
    }

    fn far_deadlines() -> PumpDeadlines {
        let now = Instant::now();
        PumpDeadlines { first_byte: now + Duration::from_secs(10), total: now + Duration::from_secs(60) }
    }

    // -----------------------------------------------------------------------
    // Event processing
    // -----------------------------------------------------------------------

    #[test]
    fn event_boundary_finds_complete_frames() {
        assert_eq!(find_event_boundary(b"data: x\n\nrest"), Some(9));
        assert_eq!(find_event_boundary(b"data: x\n"), None);
    }

    #[test]
    fn process_event_strips_delta_content() {
        let mut stripper = ThinkingStripper::default();
        let mut saw_done = false;
        let frame = b"data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"<think>x</think>hi\"}}]}\n\n";
        let out = process_event(frame, &mut stripper, &mut saw_done);
        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.contains("\"hi\""));
        assert!(!text.contains("think"));
        assert!(!saw_done);
    }

    #[test]
    fn process_event_passes_comments_and_done_through() {
        let mut stripper = ThinkingStripper::default();
        let mut saw_done = false;
        let out = process_event(b": keepalive\n\n", &mut stripper, &mut saw_done);
        assert_eq!(&out[..], b": keepalive\n\n");

        let out = process_event(b"data: [DONE]\n\n", &mut stripper, &mut saw_done);
        assert_eq!(&out[..], b"data: [DONE]\n\n");
        assert!(saw_done);
    }

    #[test]
    fn process_event_passes_unparsable_payloads_verbatim() {
        let mut stripper = ThinkingStripper::default();
        let mut saw_done = false;
        let out = process_event(b"data: not-json{{\n\n", &mut stripper, &mut saw_done);
        assert_eq!(&out[..], b"data: not-json{{\n\n");
    }

    #[test]
    fn strip_buffered_rewrites_message_content() {
        let body = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "<think>x</think>Paris" } }]
        });
        let out = strip_buffered(body.to_string().as_bytes());
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["choices"][0]["message"]["content"], "Paris");
    }

    #[test]
    fn strip_buffered_leaves_non_json_untouched() {
        let out = strip_buffered(b"plain text");
        assert_eq!(&out[..], b"plain text");
    }

    // -----------------------------------------------------------------------
    // Pump end-to-end against a mock upstream
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn buffered_pump_publishes_stripped_body() {
        let server = MockServer::start().await;
        let upstream = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "<think>w</think>Paris" } }]
        });
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(upstream))
            .mount(&server)
            .await;

        let (_cache, mut origin) = origin_entry();
        let reader = origin.reader();
        let response = reqwest::Client::new()
            .post(format!("{}/v1/chat/completions", server.uri()))
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap();

        spawn_pump(origin.entry(), response, false, far_deadlines());

        let (status, _ct, body) = reader.collect().await;
        assert_eq!(status, 200);
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["choices"][0]["message"]["content"], "Paris");
    }

    #[tokio::test]
    async fn sse_pump_strips_deltas_and_terminates_with_done() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"<think>plan\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"</think>Par\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"is\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(sse_body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let (_cache, mut origin) = origin_entry();
        let mut reader = origin.reader();
        let response = reqwest::Client::new()
            .post(format!("{}/v1/chat/completions", server.uri()))
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap();

        spawn_pump(origin.entry(), response, true, far_deadlines());

        let (status, content_type) = reader.headers().await;
        assert_eq!(status, 200);
        assert!(content_type.contains("text/event-stream"));

        let mut all = String::new();
        while let Some(chunk) = reader.next_chunk().await {
            all.push_str(std::str::from_utf8(&chunk).unwrap());
        }
        assert!(!all.contains("think"), "thinking tokens leaked: {all}");
        assert!(all.contains("Par"));
        assert!(all.contains("is"));
        assert!(all.ends_with("data: [DONE]\n\n"));
        // Exactly one terminator.
        assert_eq!(all.matches("[DONE]").count(), 1);
    }

    #[tokio::test]
    async fn sse_pump_appends_done_when_upstream_omits_it() {
        let server = MockServer::start().await;
        let sse_body = "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n\n";
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(sse_body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let (_cache, mut origin) = origin_entry();
        let reader = origin.reader();
        let response = reqwest::Client::new()
            .post(format!("{}/v1/chat/completions", server.uri()))
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap();

        spawn_pump(origin.entry(), response, true, far_deadlines());
        let (_, _, body) = reader.collect().await;
        let text = String::from_utf8(body).unwrap();
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    /// Upstream that commits headers and then stalls forever — wiremock can
    /// only delay whole responses, and the deadline under test fires between
    /// headers and body.
    async fn stalling_upstream() -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else { return };
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 64\r\n\r\n",
                )
                .await;
            // Hold the socket open without ever sending the body.
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        addr
    }

    #[tokio::test]
    async fn buffered_pump_reports_504_on_total_deadline() {
        let addr = stalling_upstream().await;

        let (_cache, mut origin) = origin_entry();
        let reader = origin.reader();
        let response = reqwest::Client::new()
            .post(format!("http://{addr}/v1/chat/completions"))
            .json(&serde_json::json!({}))
            .send()
            .await
            .expect("headers arrive before the stall");

        let now = Instant::now();
        let deadlines = PumpDeadlines {
            first_byte: now + Duration::from_millis(100),
            total: now + Duration::from_millis(200),
        };
        spawn_pump(origin.entry(), response, false, deadlines);

        let (status, _, body) = reader.collect().await;
        assert_eq!(status, 504);
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "timeout_error");
    }

    #[tokio::test]
    async fn sse_pump_emits_synthetic_error_on_first_byte_deadline() {
        let addr = stalling_upstream().await;

        let (_cache, mut origin) = origin_entry();
        let reader = origin.reader();
        let response = reqwest::Client::new()
            .post(format!("http://{addr}/v1/chat/completions"))
            .json(&serde_json::json!({}))
            .send()
            .await
            .expect("headers arrive before the stall");

        let now = Instant::now();
        let deadlines = PumpDeadlines {
            first_byte: now + Duration::from_millis(100),
            total: now + Duration::from_secs(60),
        };
        spawn_pump(origin.entry(), response, true, deadlines);

        let (_, _, body) = reader.collect().await;
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("\"error\""), "expected synthetic error event: {text}");
        assert!(text.contains("timeout_error"));
    }

    // -----------------------------------------------------------------------
    // Client body builders
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn sse_response_emits_heartbeats_until_first_event() {
        let (_cache, mut origin) = origin_entry();
        let entry = origin.entry();
        let reader = origin.reader();

        let response = sse_response(reader, Duration::from_millis(20));
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-cache");

        let mut body = response.into_body().into_data_stream();

        // Nothing pushed yet: the first thing out must be a heartbeat.
        let first = body.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b": heartbeat\n\n");

        entry.push_chunk(Bytes::from_static(b"data: {\"x\":1}\n\n"));
        entry.finish(true);

        let mut rest = Vec::new();
        while let Some(Ok(chunk)) = body.next().await {
            rest.extend_from_slice(&chunk);
        }
        let text = String::from_utf8(rest).unwrap();
        assert!(text.contains("data: {\"x\":1}"));
        // Heartbeats cease after the first data event.
        assert!(!text.contains("heartbeat"));
    }

    #[tokio::test]
    async fn buffered_response_carries_recorded_status_and_body() {
        let (_cache, mut origin) = origin_entry();
        let entry = origin.entry();
        let reader = origin.reader();

        entry.set_headers(200, "application/json");
        entry.push_chunk(Bytes::from_static(b"{\"ok\":true}"));
        entry.finish(true);

        let response = buffered_response(reader).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"{\"ok\":true}");
    }
}
