//! The 402 payment engine: challenge parsing, pre-authorization caching, and
//! singleflight signing.
//!
//! The per-request state machine itself is driven by the forwarder
//! (attempt → 402 → sign → retry, exactly once); this module owns everything
//! the machine consults: the parsed challenge, the injected signer, and the
//! pre-auth cache that lets most requests skip the challenge round-trip
//! entirely.
//!
//! Cache discipline:
//! - keyed by `(endpoint host, canonical model id)`
//! - a record is consulted only while `now + safety_skew < expires_at`
//! - a 402 received while holding a record is a miss-signal: invalidate and
//!   run the full challenge flow
//! - stale same-key requests coalesce on signing — one signature per
//!   expiration window

use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::{config::PaymentConfig, signer::PaymentSigner};

/// Header carrying the signed authorization on the retry.
pub const PAYMENT_HEADER: &str = "x-payment";

/// A parsed 402 challenge body.
///
/// `amount` is kept as the upstream's decimal string (money never goes
/// through a float on the wire); [`PaymentChallenge::amount_value`] exposes
/// the parsed form for cache comparisons only.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentChallenge {
    #[serde(deserialize_with = "de_amount")]
    pub amount: String,
    pub asset: String,
    pub chain: String,
    pub recipient: String,
    pub nonce: String,
    #[serde(alias = "valid_until")]
    #[serde(rename = "validUntil")]
    pub valid_until: u64,
    /// Fields the upstream added beyond the core protocol.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PaymentChallenge {
    pub fn parse(body: &str) -> anyhow::Result<Self> {
        serde_json::from_str(body)
            .map_err(|e| anyhow::anyhow!("malformed 402 challenge body: {e}"))
    }

    /// Challenge amount as a float, for price-coverage comparison.
    pub fn amount_value(&self) -> f64 {
        self.amount.parse().unwrap_or(f64::INFINITY)
    }

    /// Seconds until `validUntil`, zero if already past.
    pub fn remaining(&self) -> Duration {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Duration::from_secs(self.valid_until.saturating_sub(now))
    }
}

/// Accept both `"0.01"` and `0.01` for the challenge amount.
fn de_amount<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let value = serde_json::Value::deserialize(d)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "amount must be a string or number, got {other}"
        ))),
    }
}

/// How a request was authenticated, for the traffic log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentUse {
    /// No payment header attached (endpoint did not challenge).
    None,
    /// Cached pre-authorization attached up-front.
    PreAuth,
    /// Fresh signature produced for this request's challenge.
    Signed,
}

impl PaymentUse {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::PreAuth => "preauth",
            Self::Signed => "signed",
        }
    }
}

type PreAuthKey = (String, String);

#[derive(Debug, Clone)]
struct PreAuthRecord {
    header: String,
    last_known_price: f64,
    valid_until: u64,
    expires_at: Instant,
}

/// Challenge/sign engine shared by all requests.
pub struct PaymentEngine {
    signer: Arc<dyn PaymentSigner>,
    cache: DashMap<PreAuthKey, PreAuthRecord>,
    /// Per-key signing locks — coalesces concurrent signs for the same
    /// (endpoint, model) so one signature serves the whole window.
    signing: DashMap<PreAuthKey, Arc<Mutex<()>>>,
    config: PaymentConfig,
    signer_timeout: Duration,
}

impl PaymentEngine {
    pub fn new(signer: Arc<dyn PaymentSigner>, config: PaymentConfig, signer_timeout: Duration) -> Self {
        Self {
            signer,
            cache: DashMap::new(),
            signing: DashMap::new(),
            config,
            signer_timeout,
        }
    }

    pub fn wallet_address(&self) -> &str {
        self.signer.address()
    }

    /// Pre-auth header for the attempt, if a fresh record exists.
    pub fn prepare(&self, host: &str, model: &str) -> Option<String> {
        let key = (host.to_string(), model.to_string());
        let record = self.cache.get(&key)?;
        let skew = Duration::from_millis(self.config.safety_skew_ms);
        if Instant::now() + skew < record.expires_at {
            Some(record.header.clone())
        } else {
            None
        }
    }

    /// Sign an authorization for `challenge`, coalescing with concurrent
    /// callers on the same key. Returns the header value to retry with.
    #[tracing::instrument(skip(self, challenge, request_digest))]
    pub async fn satisfy(
        &self,
        host: &str,
        model: &str,
        challenge: &PaymentChallenge,
        request_digest: &[u8; 32],
    ) -> anyhow::Result<String> {
        let key = (host.to_string(), model.to_string());
        let lock = self
            .signing
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // A coalesced caller may find the record already refreshed — reuse it
        // when it is fresh and priced to cover this challenge.
        if let Some(record) = self.cache.get(&key) {
            let skew = Duration::from_millis(self.config.safety_skew_ms);
            if Instant::now() + skew < record.expires_at
                && record.last_known_price >= challenge.amount_value()
            {
                return Ok(record.header.clone());
            }
        }

        let signer = Arc::clone(&self.signer);
        let challenge_owned = challenge.clone();
        let digest = *request_digest;
        let sign_task =
            tokio::task::spawn_blocking(move || signer.sign(&challenge_owned, &digest));
        let header = tokio::time::timeout(self.signer_timeout, sign_task)
            .await
            .map_err(|_| anyhow::anyhow!("signer exceeded {:?} deadline", self.signer_timeout))?
            .map_err(|e| anyhow::anyhow!("signer task failed: {e}"))??;

        self.cache.insert(
            key,
            PreAuthRecord {
                header: header.clone(),
                last_known_price: challenge.amount_value(),
                valid_until: challenge.valid_until,
                expires_at: Instant::now() + self.record_ttl(challenge),
            },
        );
        tracing::debug!(amount = %challenge.amount, asset = %challenge.asset, "payment authorization signed");
        Ok(header)
    }

    /// Called on every upstream 2xx: extend the record's life within its
    /// `validUntil` bound so subsequent requests keep skipping the challenge.
    pub fn observe_success(&self, host: &str, model: &str) {
        let key = (host.to_string(), model.to_string());
        if let Some(mut record) = self.cache.get_mut(&key) {
            let now_unix = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let until_invalid = Duration::from_secs(record.valid_until.saturating_sub(now_unix))
                .saturating_sub(Duration::from_millis(self.config.safety_skew_ms));
            let cap = Duration::from_millis(self.config.preauth_ttl_ms);
            record.expires_at = Instant::now() + until_invalid.min(cap);
        }
    }

    /// Called on every upstream 402: the endpoint's price or recipient
    /// changed, so whatever we had cached is no longer honored.
    pub fn invalidate(&self, host: &str, model: &str) {
        let key = (host.to_string(), model.to_string());
        if self.cache.remove(&key).is_some() {
            tracing::debug!(host, model, "pre-auth record invalidated by 402");
        }
    }

    /// Drop expired records and their signing locks. Run by the reaper.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.cache.retain(|_, record| record.expires_at > now);
        self.signing.retain(|key, _| self.cache.contains_key(key));
    }

    fn record_ttl(&self, challenge: &PaymentChallenge) -> Duration {
        let skew = Duration::from_millis(self.config.safety_skew_ms);
        let cap = Duration::from_millis(self.config.preauth_ttl_ms);
        challenge.remaining().saturating_sub(skew).min(cap)
    }
}
