//! Configuration for the clawrouter proxy.
//!
//! Config is loaded once at startup from an optional TOML file and validated
//! before the listener opens its port. Invalid configs are rejected with a
//! clear error rather than silently falling back to defaults — the only
//! deliberate fallback is `PROXY_PORT`, which the host contract requires to
//! degrade to 8402 on any invalid value.
//!
//! # Example
//! ```toml
//! [proxy]
//! port = 8402
//! upstream_url = "https://gateway.clawrouter.ai"
//!
//! [scoring]
//! tier_boundaries = [0.25, 0.45, 0.70]
//! confidence_threshold = 0.70
//!
//! [tiers.simple]
//! primary  = "google/gemini-2.5-flash-lite"
//! fallback = ["meta-llama/llama-3.3-70b-instruct"]
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::catalog::Tier;

/// Default client port when `PROXY_PORT` is unset or invalid.
pub const DEFAULT_PORT: u16 = 8402;

/// Top-level proxy configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Prompt-scoring knobs for the router.
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Per-tier model lists. Missing tiers use the catalog defaults.
    #[serde(default)]
    pub tiers: TierTable,

    /// Hard override rules applied before dimensional scoring.
    #[serde(default)]
    pub overrides: OverrideConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub payment: PaymentConfig,

    #[serde(default)]
    pub balance: BalanceConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.scoring;

        anyhow::ensure!(
            s.dimension_weights.len() == 14,
            "scoring.dimension_weights must have exactly 14 entries, got {}",
            s.dimension_weights.len()
        );
        let sum: f64 = s.dimension_weights.iter().sum();
        anyhow::ensure!(
            (sum - 1.0).abs() < 1e-9,
            "scoring.dimension_weights must sum to 1.0, got {sum}"
        );

        anyhow::ensure!(
            s.tier_boundaries.len() == 3,
            "scoring.tier_boundaries must have exactly 3 entries"
        );
        anyhow::ensure!(
            s.tier_boundaries.windows(2).all(|w| w[0] < w[1]),
            "scoring.tier_boundaries must be strictly ascending"
        );
        anyhow::ensure!(
            s.tier_boundaries.iter().all(|b| (0.0..1.0).contains(b)),
            "scoring.tier_boundaries must lie in [0, 1)"
        );

        anyhow::ensure!(
            s.confidence_steepness > 0.0,
            "scoring.confidence_steepness must be positive"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&s.confidence_threshold),
            "scoring.confidence_threshold must lie in [0, 1]"
        );
        anyhow::ensure!(
            s.token_count_thresholds.windows(2).all(|w| w[0] < w[1]),
            "scoring.token_count_thresholds must be strictly ascending"
        );

        anyhow::ensure!(
            self.dedup.capacity > 0,
            "dedup.capacity must be at least 1"
        );

        Ok(())
    }
}

/// Listener, upstream, and lifecycle settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Client port (loopback only). Overridden by `PROXY_PORT`.
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Base URL of the upstream aggregator endpoint.
    #[serde(default = "defaults::upstream_url")]
    pub upstream_url: String,

    /// TCP connect deadline.
    #[serde(default = "defaults::connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Deadline for the first upstream body byte.
    #[serde(default = "defaults::first_byte_timeout_ms")]
    pub first_byte_timeout_ms: u64,

    /// Total upstream deadline per request.
    #[serde(default = "defaults::request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Deadline for one signer invocation.
    #[serde(default = "defaults::signer_timeout_ms")]
    pub signer_timeout_ms: u64,

    /// SSE heartbeat cadence while waiting for the first upstream byte.
    #[serde(default = "defaults::heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How long `close()` waits for in-flight requests before force-closing.
    #[serde(default = "defaults::shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Maximum accepted request body size.
    #[serde(default = "defaults::max_body_bytes")]
    pub max_body_bytes: usize,

    /// Maximum number of entries in the `messages` array.
    #[serde(default = "defaults::max_messages")]
    pub max_messages: usize,

    /// Number of recent requests kept in the in-memory traffic ring.
    #[serde(default = "defaults::traffic_log_capacity")]
    pub traffic_log_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty ProxyConfig must deserialize from defaults")
    }
}

/// Knobs for the router's dimensional scorer. Every keyword list is matched
/// case-insensitively as a substring of the sampled prompt.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScoringConfig {
    /// Prompt sample length used for scoring. Longer prompts are truncated;
    /// truncation affects only scoring cost, never correctness.
    #[serde(default = "defaults::prompt_sample_chars")]
    pub prompt_sample_chars: usize,

    /// Breakpoints (in estimated tokens) for normalizing the token-count
    /// dimension: below the first ⇒ 0.0, above the last ⇒ 1.0.
    #[serde(default = "defaults::token_count_thresholds")]
    pub token_count_thresholds: Vec<usize>,

    #[serde(default = "defaults::code_keywords")]
    pub code_keywords: Vec<String>,
    #[serde(default = "defaults::reasoning_keywords")]
    pub reasoning_keywords: Vec<String>,
    #[serde(default = "defaults::technical_keywords")]
    pub technical_keywords: Vec<String>,
    #[serde(default = "defaults::creative_keywords")]
    pub creative_keywords: Vec<String>,
    #[serde(default = "defaults::simple_keywords")]
    pub simple_keywords: Vec<String>,
    #[serde(default = "defaults::multi_step_keywords")]
    pub multi_step_keywords: Vec<String>,
    #[serde(default = "defaults::imperative_keywords")]
    pub imperative_keywords: Vec<String>,
    #[serde(default = "defaults::constraint_keywords")]
    pub constraint_keywords: Vec<String>,
    #[serde(default = "defaults::format_keywords")]
    pub format_keywords: Vec<String>,
    #[serde(default = "defaults::domain_keywords")]
    pub domain_keywords: Vec<String>,

    /// 14-entry weight vector, one per scoring dimension, summing to 1.0.
    #[serde(default = "defaults::dimension_weights")]
    pub dimension_weights: Vec<f64>,

    /// Composite-score thresholds separating SIMPLE/MEDIUM/COMPLEX/REASONING.
    #[serde(default = "defaults::tier_boundaries")]
    pub tier_boundaries: Vec<f64>,

    /// Slope of the logistic used to calibrate confidence from the distance
    /// to the nearest tier boundary.
    #[serde(default = "defaults::confidence_steepness")]
    pub confidence_steepness: f64,

    /// Below this confidence the decision method becomes `default` and the
    /// ambiguous default tier is used.
    #[serde(default = "defaults::confidence_threshold")]
    pub confidence_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty ScoringConfig must deserialize from defaults")
    }
}

/// Ordered model list for one tier.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierModels {
    pub primary: String,
    #[serde(default)]
    pub fallback: Vec<String>,
}

impl TierModels {
    /// Primary followed by fallbacks, in attempt order.
    pub fn chain(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallback.iter().map(String::as_str))
    }
}

/// Per-tier model tables. Each defaults to the catalog's built-in ladder.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierTable {
    #[serde(default = "defaults::tier_simple")]
    pub simple: TierModels,
    #[serde(default = "defaults::tier_medium")]
    pub medium: TierModels,
    #[serde(default = "defaults::tier_complex")]
    pub complex: TierModels,
    #[serde(default = "defaults::tier_reasoning")]
    pub reasoning: TierModels,
}

impl TierTable {
    pub fn for_tier(&self, tier: Tier) -> &TierModels {
        match tier {
            Tier::Simple => &self.simple,
            Tier::Medium => &self.medium,
            Tier::Complex => &self.complex,
            Tier::Reasoning => &self.reasoning,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        toml::from_str("").expect("empty TierTable must deserialize from defaults")
    }
}

/// Hard override rules — checked in order before dimensional scoring.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OverrideConfig {
    /// Requests with `max_tokens` at or above this are forced to COMPLEX.
    #[serde(default = "defaults::max_tokens_force_complex")]
    pub max_tokens_force_complex: u64,

    /// Minimum tier when tools or structured output are requested.
    #[serde(default = "defaults::structured_output_min_tier")]
    pub structured_output_min_tier: Tier,

    /// Tier used when confidence falls below the threshold.
    #[serde(default = "defaults::ambiguous_default_tier")]
    pub ambiguous_default_tier: Tier,
}

impl Default for OverrideConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty OverrideConfig must deserialize from defaults")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DedupConfig {
    /// Maximum number of cache entries (in-flight entries never evict).
    #[serde(default = "defaults::dedup_capacity")]
    pub capacity: usize,

    /// How long a completed entry remains replayable.
    #[serde(default = "defaults::replay_ttl_ms")]
    pub replay_ttl_ms: u64,

    /// Entries buffering more than this many bytes are not retained for
    /// replay after completion (attached subscribers still receive the
    /// full stream).
    #[serde(default = "defaults::max_entry_bytes")]
    pub max_entry_bytes: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty DedupConfig must deserialize from defaults")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaymentConfig {
    /// Hard ceiling on pre-auth record lifetime; the effective TTL is
    /// `min(validUntil − now − safety_skew, preauth_ttl_ms)`.
    #[serde(default = "defaults::preauth_ttl_ms")]
    pub preauth_ttl_ms: u64,

    /// Margin subtracted from `validUntil` before trusting a cached record.
    #[serde(default = "defaults::safety_skew_ms")]
    pub safety_skew_ms: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty PaymentConfig must deserialize from defaults")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BalanceConfig {
    /// Cadence of the wallet-empty poll.
    #[serde(default = "defaults::balance_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty BalanceConfig must deserialize from defaults")
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Environment overrides
// ──────────────────────────────────────────────────────────────────────────────

/// Resolve the listener port from `PROXY_PORT`.
///
/// The host contract is lenient by design: any unset, unparsable,
/// out-of-range, or zero value falls back to [`DEFAULT_PORT`].
pub fn port_from_env() -> u16 {
    port_from_value(std::env::var("PROXY_PORT").ok().as_deref())
}

pub(crate) fn port_from_value(raw: Option<&str>) -> u16 {
    raw.and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|&p| (1..=65_535).contains(&p))
        .map(|p| p as u16)
        .unwrap_or(DEFAULT_PORT)
}

/// Read the wallet private key from `WALLET_KEY` (hex, `0x` prefix).
///
/// The key overrides whatever the host plugin config supplied. Returns `None`
/// when unset or malformed so the caller can fall back to the injected key.
pub fn wallet_key_from_env() -> Option<String> {
    let raw = std::env::var("WALLET_KEY").ok()?;
    let trimmed = raw.trim();
    let hex_part = trimmed.strip_prefix("0x")?;
    if hex_part.is_empty() || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        tracing::warn!("WALLET_KEY is not 0x-prefixed hex — ignoring");
        return None;
    }
    Some(trimmed.to_string())
}

/// `CLAWROUTER_DISABLED` — when truthy the proxy registers but does not
/// intercept (start returns an inert handle).
pub fn disabled_from_env() -> bool {
    match std::env::var("CLAWROUTER_DISABLED") {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => false,
    }
}

mod defaults {
    use super::{Tier, TierModels};
    use crate::catalog;

    pub fn port() -> u16 { super::DEFAULT_PORT }
    pub fn upstream_url() -> String { "https://gateway.clawrouter.ai".into() }
    pub fn connect_timeout_ms() -> u64 { 5_000 }
    pub fn first_byte_timeout_ms() -> u64 { 10_000 }
    pub fn request_timeout_ms() -> u64 { 60_000 }
    pub fn signer_timeout_ms() -> u64 { 5_000 }
    pub fn heartbeat_interval_ms() -> u64 { 10_000 }
    pub fn shutdown_grace_ms() -> u64 { 4_000 }
    pub fn max_body_bytes() -> usize { 150 * 1024 }
    pub fn max_messages() -> usize { 200 }
    pub fn traffic_log_capacity() -> usize { 512 }

    pub fn prompt_sample_chars() -> usize { 500 }
    pub fn token_count_thresholds() -> Vec<usize> { vec![20, 60, 150, 400] }

    pub fn code_keywords() -> Vec<String> {
        to_vec(&[
            "function", "class ", "compile", "refactor", "implement", "debug",
            "regex", "sql", "algorithm", "stack trace", "unit test", "api endpoint",
            "typescript", "python", "rust", "struct", "async",
        ])
    }
    pub fn reasoning_keywords() -> Vec<String> {
        to_vec(&[
            "prove", "step by step", "derive", "theorem", "formally", "rigorous",
            "deduce", "induction", "contradiction", "chain of thought",
            "reason through", "first principles", "show your work", "logically",
        ])
    }
    pub fn technical_keywords() -> Vec<String> {
        to_vec(&[
            "kubernetes", "database", "encryption", "protocol", "latency",
            "throughput", "concurrency", "distributed", "architecture",
            "gradient", "transformer", "compiler", "scheduler",
        ])
    }
    pub fn creative_keywords() -> Vec<String> {
        to_vec(&[
            "story", "poem", "haiku", "brainstorm", "imagine", "fiction",
            "lyrics", "slogan", "screenplay", "metaphor",
        ])
    }
    pub fn simple_keywords() -> Vec<String> {
        to_vec(&[
            "what is", "who is", "when is", "when was", "where is", "define",
            "capital of", "meaning of", "how many", "translate", "convert",
            "what's the",
        ])
    }
    pub fn multi_step_keywords() -> Vec<String> {
        to_vec(&[
            "first", "then", "finally", "after that", "step 1", "step one",
            "followed by", "subsequently", "and then",
        ])
    }
    pub fn imperative_keywords() -> Vec<String> {
        to_vec(&[
            "write", "create", "build", "generate", "make", "design",
            "produce", "draft", "compose",
        ])
    }
    pub fn constraint_keywords() -> Vec<String> {
        to_vec(&[
            "must", "should not", "at most", "at least", "no more than",
            "exactly", "within", "constraint", "requirement", "limit to",
        ])
    }
    pub fn format_keywords() -> Vec<String> {
        to_vec(&[
            "json", "table", "markdown", "bullet", "csv", "yaml", "xml",
            "numbered list", "schema", "output format",
        ])
    }
    pub fn domain_keywords() -> Vec<String> {
        to_vec(&[
            "legal", "medical", "clinical", "regulatory", "actuarial",
            "pharmacology", "litigation", "derivatives", "genomics",
            "jurisprudence", "oncology",
        ])
    }

    fn to_vec(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    /// Weights for the 14 scoring dimensions, in [`crate::router::Dimension`]
    /// order. Must sum to 1.0.
    pub fn dimension_weights() -> Vec<f64> {
        vec![
            0.14, // token count
            0.11, // code keywords
            0.13, // reasoning markers
            0.08, // technical terms
            0.05, // creative markers
            0.08, // simple indicators (inverted)
            0.09, // multi-step patterns
            0.06, // question complexity
            0.04, // imperative verbs
            0.06, // constraint indicators
            0.04, // output format request
            0.03, // back-references
            0.03, // negation complexity
            0.06, // domain specificity
        ]
    }

    pub fn tier_boundaries() -> Vec<f64> { vec![0.25, 0.45, 0.70] }
    pub fn confidence_steepness() -> f64 { 12.0 }
    pub fn confidence_threshold() -> f64 { 0.70 }

    pub fn tier_simple() -> TierModels { catalog::default_tier_models(Tier::Simple) }
    pub fn tier_medium() -> TierModels { catalog::default_tier_models(Tier::Medium) }
    pub fn tier_complex() -> TierModels { catalog::default_tier_models(Tier::Complex) }
    pub fn tier_reasoning() -> TierModels { catalog::default_tier_models(Tier::Reasoning) }

    pub fn max_tokens_force_complex() -> u64 { 100_000 }
    pub fn structured_output_min_tier() -> Tier { Tier::Medium }
    pub fn ambiguous_default_tier() -> Tier { Tier::Medium }

    pub fn dedup_capacity() -> usize { 256 }
    pub fn replay_ttl_ms() -> u64 { 30_000 }
    pub fn max_entry_bytes() -> usize { 512 * 1024 }

    pub fn preauth_ttl_ms() -> u64 { 300_000 }
    pub fn safety_skew_ms() -> u64 { 10_000 }

    pub fn balance_poll_interval_ms() -> u64 { 30_000 }
}
