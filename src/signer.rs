//! Payment authorization signing.
//!
//! The payment engine never touches key material: it holds a
//! [`PaymentSigner`] trait object supplied at startup. The default
//! [`KeySigner`] is deterministic — the same key, challenge nonce, and
//! request digest always produce the same header — which keeps the
//! singleflight guarantee meaningful (coalesced requests would have produced
//! identical signatures anyway).
//!
//! Real EIP-712 wallet signing lives behind this trait in the host; the
//! in-process signer HMAC-authenticates the canonical challenge fields and
//! encodes an authorization payload the way x402-style gateways expect:
//! base64(JSON) in a single header value.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::payment::PaymentChallenge;

type HmacSha256 = Hmac<Sha256>;

/// Signs payment authorizations for 402 challenges.
///
/// Implementations must be deterministic given their key and the challenge
/// nonce, and fast — the engine budgets 20 ms for a typical call.
pub trait PaymentSigner: Send + Sync {
    /// Produce the value of the payment header for one challenge.
    fn sign(&self, challenge: &PaymentChallenge, request_digest: &[u8; 32]) -> anyhow::Result<String>;

    /// The wallet address this signer pays from (`0x…`).
    fn address(&self) -> &str;
}

/// Deterministic signer over a locally-held private key.
pub struct KeySigner {
    key: Vec<u8>,
    address: String,
}

impl KeySigner {
    /// Build from a `0x`-prefixed hex private key.
    pub fn from_hex_key(key: &str) -> anyhow::Result<Self> {
        let stripped = key
            .trim()
            .strip_prefix("0x")
            .ok_or_else(|| anyhow::anyhow!("wallet key must be 0x-prefixed hex"))?;
        anyhow::ensure!(!stripped.is_empty(), "wallet key is empty");
        let bytes = hex::decode(stripped)
            .map_err(|e| anyhow::anyhow!("wallet key is not valid hex: {e}"))?;

        // Address derivation is delegated to the host for real wallets; the
        // in-process form only needs to be stable and collision-resistant.
        let digest = Sha256::digest(&bytes);
        let address = format!("0x{}", hex::encode(&digest[..20]));

        Ok(Self { key: bytes, address })
    }
}

impl PaymentSigner for KeySigner {
    fn sign(&self, challenge: &PaymentChallenge, request_digest: &[u8; 32]) -> anyhow::Result<String> {
        // Canonical field order fixes the signed bytes independent of the
        // challenge JSON's key order.
        let canonical = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            challenge.recipient,
            challenge.amount,
            challenge.asset,
            challenge.chain,
            challenge.nonce,
            challenge.valid_until,
            hex::encode(request_digest),
        );

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| anyhow::anyhow!("building HMAC: {e}"))?;
        mac.update(canonical.as_bytes());
        let signature = mac.finalize().into_bytes();

        let payload = serde_json::json!({
            "version": 1,
            "scheme": "exact",
            "from": self.address,
            "to": challenge.recipient,
            "value": challenge.amount,
            "asset": challenge.asset,
            "chain": challenge.chain,
            "nonce": challenge.nonce,
            "validUntil": challenge.valid_until,
            "signature": format!("0x{}", hex::encode(signature)),
        });

        let json = serde_json::to_vec(&payload)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    fn address(&self) -> &str {
        &self.address
    }
}
