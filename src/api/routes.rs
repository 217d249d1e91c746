//! Client-facing HTTP surface — the endpoint OpenAI-style clients talk to.
//!
//! Handlers are a thin layer: they translate HTTP concerns into calls
//! against the routing, dedup, and forwarding machinery on [`AppState`] and
//! render results. The whole request pipeline for one chat completion lives
//! in [`handle_chat`]:
//!
//! validate → route → dedup lookup → (forward + pump | attach) → relay.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::json;

use crate::{
    api::request_id::RequestId,
    api::validate::{validate, ValidatedRequest},
    dedup::{fingerprint, Lookup},
    error::ProxyError,
    proxy::AppState,
    relay::{self, PumpDeadlines},
    router::{RouteRequest, RoutingDecision},
    traffic::TrafficEntry,
};

/// Build the client-facing axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .fallback(not_found)
        // A known path with the wrong method still gets the error envelope.
        .method_not_allowed_fallback(method_not_allowed)
        .layer(axum::middleware::from_fn(crate::api::request_id::request_id_middleware))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::DEBUG)),
        )
        .with_state(state)
}

/// `GET /health` — liveness plus the wallet this proxy pays from.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.traffic.stats().await;
    Json(json!({
        "status": "ok",
        "wallet": state.wallet_address,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "requests": stats,
    }))
}

/// `GET /v1/models` — the static catalog in OpenAI list form.
async fn list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let data: Vec<_> = state
        .catalog
        .models()
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "object": "model",
                "owned_by": m.id.split('/').next().unwrap_or("unknown"),
                "display_name": m.display_name,
                "context_window": m.context_window,
                "max_output_tokens": m.max_output_tokens,
                "pricing": {
                    "input_per_m": m.input_cost_per_m,
                    "output_per_m": m.output_cost_per_m,
                },
                "reasoning": m.reasoning,
                "supports_tools": m.supports_tools,
                "supports_streaming": m.supports_streaming,
                "tier": m.tier.to_string(),
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

async fn not_found() -> Response {
    ProxyError::NotFound.into_response()
}

async fn method_not_allowed() -> Response {
    ProxyError::MethodNotAllowed.into_response()
}

/// `POST /v1/chat/completions`.
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    request_id: Option<Extension<RequestId>>,
    body: Bytes,
) -> Response {
    let request_id = request_id.map(|Extension(id)| id).unwrap_or_else(RequestId::mint);
    match handle_chat(&state, &request_id, &body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle_chat(
    state: &Arc<AppState>,
    request_id: &RequestId,
    bytes: &[u8],
) -> Result<Response, ProxyError> {
    let started = std::time::Instant::now();
    let task_start = tokio::time::Instant::now();

    let request = validate(bytes, &state.config.proxy, &state.catalog)?;
    let decision = route(state, &request);
    state
        .router
        .check_window(&request.prompt, request.max_tokens)
        .map_err(ProxyError::Routing)?;
    let heartbeat = Duration::from_millis(state.config.proxy.heartbeat_interval_ms);

    let fp = fingerprint(&decision.model, &request.body);
    match state.dedup.lookup(fp) {
        Lookup::Join { reader, replay } => {
            let label = if replay { "replay" } else { "subscriber" };
            tracing::debug!(dedup = label, model = %decision.model, "coalesced with existing request");
            state.traffic.push(
                TrafficEntry::new(request_id.as_str(), &request.requested_model, &decision)
                    .with_dedup(label)
                    .finished(started.elapsed().as_millis() as u64, true),
            );
            if request.stream {
                Ok(relay::sse_response(reader, heartbeat))
            } else {
                Ok(relay::buffered_response(reader).await)
            }
        }
        Lookup::Miss(mut origin) => {
            let models = model_chain(state, &decision);
            let mut upstream_body = request.body.clone();
            let digest = *origin.fingerprint().as_bytes();

            match state
                .forwarder
                .send(&mut upstream_body, &models, request.stream, &digest)
                .await
            {
                Ok(outcome) => {
                    let deadlines = PumpDeadlines::from_config(task_start, &state.config.proxy);
                    relay::spawn_pump(origin.entry(), outcome.response, request.stream, deadlines);
                    let reader = origin.reader();

                    state.traffic.push(
                        TrafficEntry::new(request_id.as_str(), &request.requested_model, &decision)
                            .with_payment(outcome.payment.as_str())
                            .finished(started.elapsed().as_millis() as u64, true),
                    );

                    if request.stream {
                        Ok(relay::sse_response(reader, heartbeat))
                    } else {
                        Ok(relay::buffered_response(reader).await)
                    }
                }
                Err(e) => {
                    // Subscribers attached to this fingerprint must observe
                    // the same failure bytes the origin client will.
                    let body = match &e {
                        ProxyError::PaymentRejected { upstream_body } if !upstream_body.is_empty() => {
                            upstream_body.clone()
                        }
                        ProxyError::UpstreamClient { body, .. } if !body.is_empty() => body.clone(),
                        other => other.envelope().to_string(),
                    };
                    origin.publish_error(e.status().as_u16(), "application/json", body.as_bytes());

                    state.traffic.push(
                        TrafficEntry::new(request_id.as_str(), &request.requested_model, &decision)
                            .finished(started.elapsed().as_millis() as u64, false),
                    );
                    Err(e)
                }
            }
        }
    }
}

fn route(state: &AppState, request: &ValidatedRequest) -> RoutingDecision {
    let decision = state.router.route(&RouteRequest {
        requested_model: &request.requested_model,
        prompt: &request.prompt,
        tools_present: request.tools_present,
        structured_output: request.structured_output,
        non_text_content: request.non_text_content,
        max_tokens: request.max_tokens,
        message_count: request.message_count,
        wallet_empty: state.wallet_empty.is_empty(),
    });
    tracing::debug!(
        model = %decision.model,
        method = ?decision.method,
        confidence = decision.confidence,
        reasoning = %decision.reasoning,
        "routed"
    );
    decision
}

/// Attempt order for the forwarder: the decided model first, then the rest
/// of its tier's ladder.
fn model_chain(state: &AppState, decision: &RoutingDecision) -> Vec<String> {
    let mut chain = vec![decision.model.clone()];
    if let Some(tier) = decision.tier {
        for id in state.config.tiers.for_tier(tier).chain() {
            if !chain.iter().any(|m| m == id) {
                chain.push(id.to_string());
            }
        }
    }
    chain
}
