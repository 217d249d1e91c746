//! Upstream forwarder: payment-aware sends with a model fallback chain.
//!
//! One [`Forwarder`] is built per proxy and shared by all requests. It keeps
//! two reqwest clients: buffered requests carry the full request timeout,
//! streaming requests only the connect timeout (the body arrives
//! incrementally; the relay enforces the first-byte and total deadlines).
//!
//! The per-request payment state machine lives in [`Forwarder::attempt`]:
//!
//! ```text
//!   ATTEMPT -- 2xx --> DONE
//!      |
//!      +-- 402 --> parse challenge -- sign --> RETRY -- 2xx --> DONE
//!      |                                         |
//!      |                                         +-- 402 --> PaymentRejected
//!      +-- other 4xx --> surfaced unchanged
//!      +-- 5xx / network --> next fallback model
//! ```

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::{
    config::ProxyConfig,
    error::ProxyError,
    payment::{PaymentChallenge, PaymentEngine, PaymentUse, PAYMENT_HEADER},
};

/// Outcome of a successful send, before the body is consumed.
#[derive(Debug)]
pub struct SendOutcome {
    pub response: reqwest::Response,
    /// Model that actually served the request (after fallbacks).
    pub model: String,
    pub payment: PaymentUse,
}

pub struct Forwarder {
    /// Buffered requests — carries the configured total request timeout.
    client: Client,
    /// Streaming requests — connect timeout only; body deadlines are the
    /// relay pump's job.
    stream_client: Client,
    base_url: String,
    host: String,
    payments: std::sync::Arc<PaymentEngine>,
}

impl Forwarder {
    pub fn new(config: &ProxyConfig, payments: std::sync::Arc<PaymentEngine>) -> anyhow::Result<Self> {
        let base_url = config.upstream_url.trim_end_matches('/').to_string();
        let host = host_of(&base_url);

        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| anyhow::anyhow!("building upstream client: {e}"))?;

        let stream_client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| anyhow::anyhow!("building streaming upstream client: {e}"))?;

        Ok(Self { client, stream_client, base_url, host, payments })
    }

    /// Forward `body` to the first model in `models` that answers. Network
    /// errors and 5xx advance the chain; everything else is terminal.
    ///
    /// `body` is mutated in place to rewrite `model` and `stream` per
    /// attempt — no copy of the full body is made.
    #[tracing::instrument(skip_all, fields(attempts = models.len(), stream = stream))]
    pub async fn send(
        &self,
        body: &mut Value,
        models: &[String],
        stream: bool,
        request_digest: &[u8; 32],
    ) -> Result<SendOutcome, ProxyError> {
        let mut last_transient = String::from("no models to attempt");

        for (idx, model) in models.iter().enumerate() {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("model".into(), Value::String(model.clone()));
                obj.insert("stream".into(), Value::Bool(stream));
            }

            match self.attempt(model, body, stream, request_digest).await {
                Ok(outcome) => {
                    if idx > 0 {
                        tracing::info!(model, attempt = idx + 1, "fallback model answered");
                    }
                    return Ok(outcome);
                }
                Err(ProxyError::UpstreamTransient(msg)) => {
                    tracing::warn!(model, error = %msg, "transient upstream failure — trying next model");
                    last_transient = msg;
                }
                Err(terminal) => return Err(terminal),
            }
        }

        Err(ProxyError::UpstreamFatal(last_transient))
    }

    /// One model attempt, including the 402 challenge dance.
    async fn attempt(
        &self,
        model: &str,
        body: &Value,
        stream: bool,
        request_digest: &[u8; 32],
    ) -> Result<SendOutcome, ProxyError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let client = if stream { &self.stream_client } else { &self.client };

        // First shot, with the cached pre-authorization when we have one.
        let preauth = self.payments.prepare(&self.host, model);
        let payment = if preauth.is_some() { PaymentUse::PreAuth } else { PaymentUse::None };

        let mut request = client.post(&url).json(body);
        if let Some(header) = &preauth {
            request = request.header(PAYMENT_HEADER, header.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| transient(&url, e))?;

        let status = response.status();
        if status.is_success() {
            self.payments.observe_success(&self.host, model);
            return Ok(SendOutcome { response, model: model.to_string(), payment });
        }
        if status.as_u16() != 402 {
            return Err(classify(status, response).await);
        }

        // 402: whatever we held is no longer honored. Parse the challenge,
        // sign, retry exactly once.
        self.payments.invalidate(&self.host, model);
        let challenge_body = response
            .text()
            .await
            .map_err(|e| ProxyError::UpstreamTransient(format!("reading 402 body: {e}")))?;
        let challenge = PaymentChallenge::parse(&challenge_body)
            .map_err(ProxyError::Internal)?;

        tracing::debug!(
            model,
            amount = %challenge.amount,
            asset = %challenge.asset,
            "payment challenge received"
        );

        let header = self
            .payments
            .satisfy(&self.host, model, &challenge, request_digest)
            .await
            .map_err(ProxyError::Internal)?;

        let retry = client
            .post(&url)
            .json(body)
            .header(PAYMENT_HEADER, header)
            .send()
            .await
            .map_err(|e| transient(&url, e))?;

        let retry_status = retry.status();
        if retry_status.is_success() {
            self.payments.observe_success(&self.host, model);
            return Ok(SendOutcome {
                response: retry,
                model: model.to_string(),
                payment: PaymentUse::Signed,
            });
        }
        if retry_status.as_u16() == 402 {
            // Second 402 is fatal for this request; funds were not consumed
            // and the record stays invalidated.
            self.payments.invalidate(&self.host, model);
            let upstream_body = retry.text().await.unwrap_or_default();
            return Err(ProxyError::PaymentRejected { upstream_body });
        }
        Err(classify(retry_status, retry).await)
    }
}

fn transient(url: &str, e: reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::Timeout
    } else {
        ProxyError::UpstreamTransient(format!("POST {url}: {e}"))
    }
}

/// Map a non-402 error status: 5xx advances the fallback chain, 4xx is
/// surfaced to the client unchanged.
async fn classify(status: reqwest::StatusCode, response: reqwest::Response) -> ProxyError {
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        ProxyError::UpstreamTransient(format!("upstream HTTP {status}: {body}"))
    } else {
        ProxyError::UpstreamClient { status: status.as_u16(), body }
    }
}

/// Host portion of a base URL, for pre-auth cache keying.
fn host_of(base_url: &str) -> String {
    base_url
        .split("//")
        .nth(1)
        .unwrap_or(base_url)
        .split(['/', ':'])
        .next()
        .unwrap_or(base_url)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::PaymentConfig, signer::KeySigner};
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn forwarder_for(server: &MockServer) -> Forwarder {
        let mut config = ProxyConfig::default();
        config.upstream_url = server.uri();
        config.request_timeout_ms = 5_000;
        let signer = Arc::new(KeySigner::from_hex_key("0xdeadbeef").unwrap());
        let payments = Arc::new(PaymentEngine::new(
            signer,
            PaymentConfig::default(),
            Duration::from_secs(5),
        ));
        Forwarder::new(&config, payments).unwrap()
    }

    fn challenge_json() -> serde_json::Value {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        json!({
            "amount": "0.004",
            "asset": "USDC",
            "chain": "base",
            "recipient": "0xgateway",
            "nonce": "n-1",
            "validUntil": now + 3600,
        })
    }

    fn completion() -> serde_json::Value {
        json!({ "choices": [{ "message": { "role": "assistant", "content": "Paris" } }] })
    }

    // -----------------------------------------------------------------------
    // host_of
    // -----------------------------------------------------------------------

    #[test]
    fn host_of_extracts_the_authority() {
        assert_eq!(host_of("https://gateway.example/v2"), "gateway.example");
        assert_eq!(host_of("http://127.0.0.1:8080"), "127.0.0.1");
        assert_eq!(host_of("gateway.example"), "gateway.example");
    }

    // -----------------------------------------------------------------------
    // Plain success & fallback chain
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn success_without_challenge_uses_no_payment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion()))
            .mount(&server)
            .await;

        let fwd = forwarder_for(&server);
        let mut body = json!({ "messages": [{"role": "user", "content": "hi"}] });
        let outcome = fwd
            .send(&mut body, &["model-a".into()], false, &[0; 32])
            .await
            .unwrap();
        assert_eq!(outcome.payment, PaymentUse::None);
        assert_eq!(outcome.model, "model-a");
        // Body was rewritten in place for the attempt.
        assert_eq!(body["model"], "model-a");
        assert_eq!(body["stream"], false);
    }

    #[tokio::test]
    async fn five_hundred_advances_to_fallback_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion()))
            .mount(&server)
            .await;

        let fwd = forwarder_for(&server);
        let mut body = json!({ "messages": [] });
        let outcome = fwd
            .send(&mut body, &["primary".into(), "fallback".into()], false, &[0; 32])
            .await
            .unwrap();
        assert_eq!(outcome.model, "fallback");
    }

    #[tokio::test]
    async fn exhausted_chain_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fwd = forwarder_for(&server);
        let mut body = json!({ "messages": [] });
        let err = fwd
            .send(&mut body, &["a".into(), "b".into()], false, &[0; 32])
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamFatal(_)));
    }

    #[tokio::test]
    async fn four_hundred_is_surfaced_without_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad tool schema"))
            .mount(&server)
            .await;

        let fwd = forwarder_for(&server);
        let mut body = json!({ "messages": [] });
        let err = fwd
            .send(&mut body, &["a".into(), "b".into()], false, &[0; 32])
            .await
            .unwrap_err();
        match err {
            ProxyError::UpstreamClient { status, body } => {
                assert_eq!(status, 422);
                assert_eq!(body, "bad tool schema");
            }
            other => panic!("expected UpstreamClient, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // 402 challenge dance
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn four_oh_two_then_success_signs_once() {
        let server = MockServer::start().await;
        // Unpaid requests get the challenge…
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header_exists(PAYMENT_HEADER))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(402).set_body_json(challenge_json()))
            .mount(&server)
            .await;

        let fwd = forwarder_for(&server);
        let mut body = json!({ "messages": [] });
        let outcome = fwd
            .send(&mut body, &["model-a".into()], false, &[1; 32])
            .await
            .unwrap();
        assert_eq!(outcome.payment, PaymentUse::Signed);

        // The pre-auth record now exists — a second request attaches it
        // up-front and never sees a 402.
        let mut body2 = json!({ "messages": [] });
        let outcome2 = fwd
            .send(&mut body2, &["model-a".into()], false, &[1; 32])
            .await
            .unwrap();
        assert_eq!(outcome2.payment, PaymentUse::PreAuth);

        // Exactly: 1 unpaid (402) + 2 paid (200).
        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 3);
    }

    #[tokio::test]
    async fn second_four_oh_two_is_payment_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(402).set_body_json(challenge_json()),
            )
            .mount(&server)
            .await;

        let fwd = forwarder_for(&server);
        let mut body = json!({ "messages": [] });
        let err = fwd
            .send(&mut body, &["model-a".into()], false, &[1; 32])
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::PaymentRejected { .. }));
        // Attempt + one retry, never a third call.
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn malformed_challenge_is_internal_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(402).set_body_string("not a challenge"))
            .mount(&server)
            .await;

        let fwd = forwarder_for(&server);
        let mut body = json!({ "messages": [] });
        let err = fwd
            .send(&mut body, &["model-a".into()], false, &[1; 32])
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Internal(_)));
    }
}
