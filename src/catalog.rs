//! Static model catalog and alias resolution.
//!
//! The catalog is immutable for the life of the process: a fixed table of
//! model descriptors plus an alias map for the versioned shorthands clients
//! actually type (`sonnet-4.6`, `opus-4.6`, …). All lookup goes through
//! [`ModelCatalog::resolve`], which also strips the `clawrouter/` host prefix
//! some clients prepend.

use serde::{Deserialize, Serialize};

use crate::config::TierModels;

/// Pseudo-model meaning "let the router decide".
pub const AUTO_MODEL: &str = "auto";

/// Zero-cost fallback model used when the wallet is empty.
pub const FREE_MODEL: &str = "meta-llama/llama-3.3-70b-instruct:free";

/// Host prefix stripped before any lookup (`clawrouter/auto` → `auto`).
const HOST_PREFIX: &str = "clawrouter/";

/// A complexity bucket mapping to an ordered model list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Simple,
    Medium,
    Complex,
    Reasoning,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Simple, Tier::Medium, Tier::Complex, Tier::Reasoning];

    /// Parse a tier keyword as clients send it in the `model` field.
    pub fn from_keyword(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "simple" => Some(Tier::Simple),
            "medium" => Some(Tier::Medium),
            "complex" => Some(Tier::Complex),
            "reasoning" => Some(Tier::Reasoning),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Tier::Simple => "SIMPLE",
            Tier::Medium => "MEDIUM",
            Tier::Complex => "COMPLEX",
            Tier::Reasoning => "REASONING",
        })
    }
}

/// Immutable descriptor for one upstream model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    /// Canonical id, `provider/name` form.
    pub id: &'static str,
    pub display_name: &'static str,
    /// Context window in tokens.
    pub context_window: u64,
    pub max_output_tokens: u64,
    /// USD per million input tokens.
    pub input_cost_per_m: f64,
    /// USD per million output tokens.
    pub output_cost_per_m: f64,
    pub reasoning: bool,
    pub supports_tools: bool,
    pub supports_streaming: bool,
    pub tier: Tier,
}

/// What a `model` field resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// The router sentinel (`auto`).
    Auto,
    /// A tier keyword (`"complex"`) — route within that tier.
    TierKeyword(Tier),
    /// A concrete catalog model, canonical id.
    Model(&'static str),
    /// Nothing known by that name.
    Unknown,
}

static MODELS: &[ModelInfo] = &[
    ModelInfo {
        id: "google/gemini-2.5-flash-lite",
        display_name: "Gemini 2.5 Flash Lite",
        context_window: 1_048_576,
        max_output_tokens: 8_192,
        input_cost_per_m: 0.10,
        output_cost_per_m: 0.40,
        reasoning: false,
        supports_tools: true,
        supports_streaming: true,
        tier: Tier::Simple,
    },
    ModelInfo {
        id: "meta-llama/llama-3.3-70b-instruct",
        display_name: "Llama 3.3 70B Instruct",
        context_window: 131_072,
        max_output_tokens: 8_192,
        input_cost_per_m: 0.12,
        output_cost_per_m: 0.30,
        reasoning: false,
        supports_tools: true,
        supports_streaming: true,
        tier: Tier::Simple,
    },
    ModelInfo {
        id: "meta-llama/llama-3.3-70b-instruct:free",
        display_name: "Llama 3.3 70B Instruct (free)",
        context_window: 65_536,
        max_output_tokens: 4_096,
        input_cost_per_m: 0.0,
        output_cost_per_m: 0.0,
        reasoning: false,
        supports_tools: false,
        supports_streaming: true,
        tier: Tier::Simple,
    },
    ModelInfo {
        id: "anthropic/claude-haiku-4.5",
        display_name: "Claude Haiku 4.5",
        context_window: 200_000,
        max_output_tokens: 32_768,
        input_cost_per_m: 1.0,
        output_cost_per_m: 5.0,
        reasoning: false,
        supports_tools: true,
        supports_streaming: true,
        tier: Tier::Medium,
    },
    ModelInfo {
        id: "google/gemini-2.5-flash",
        display_name: "Gemini 2.5 Flash",
        context_window: 1_048_576,
        max_output_tokens: 16_384,
        input_cost_per_m: 0.30,
        output_cost_per_m: 2.50,
        reasoning: false,
        supports_tools: true,
        supports_streaming: true,
        tier: Tier::Medium,
    },
    ModelInfo {
        id: "anthropic/claude-sonnet-4.6",
        display_name: "Claude Sonnet 4.6",
        context_window: 200_000,
        max_output_tokens: 65_536,
        input_cost_per_m: 3.0,
        output_cost_per_m: 15.0,
        reasoning: true,
        supports_tools: true,
        supports_streaming: true,
        tier: Tier::Complex,
    },
    ModelInfo {
        id: "openai/gpt-5.1",
        display_name: "GPT-5.1",
        context_window: 400_000,
        max_output_tokens: 65_536,
        input_cost_per_m: 1.25,
        output_cost_per_m: 10.0,
        reasoning: true,
        supports_tools: true,
        supports_streaming: true,
        tier: Tier::Complex,
    },
    ModelInfo {
        id: "anthropic/claude-opus-4.6",
        display_name: "Claude Opus 4.6",
        context_window: 200_000,
        max_output_tokens: 65_536,
        input_cost_per_m: 5.0,
        output_cost_per_m: 25.0,
        reasoning: true,
        supports_tools: true,
        supports_streaming: true,
        tier: Tier::Reasoning,
    },
    ModelInfo {
        id: "deepseek/deepseek-r2",
        display_name: "DeepSeek R2",
        context_window: 163_840,
        max_output_tokens: 32_768,
        input_cost_per_m: 0.80,
        output_cost_per_m: 2.40,
        reasoning: true,
        supports_tools: false,
        supports_streaming: true,
        tier: Tier::Reasoning,
    },
];

/// Versioned shorthand → canonical id. Checked after prefix stripping.
static ALIASES: &[(&str, &str)] = &[
    ("sonnet-4.6", "anthropic/claude-sonnet-4.6"),
    ("sonnet", "anthropic/claude-sonnet-4.6"),
    ("haiku-4.5", "anthropic/claude-haiku-4.5"),
    ("haiku", "anthropic/claude-haiku-4.5"),
    ("opus-4.6", "anthropic/claude-opus-4.6"),
    ("opus", "anthropic/claude-opus-4.6"),
    ("gemini-flash", "google/gemini-2.5-flash"),
    ("gemini-flash-lite", "google/gemini-2.5-flash-lite"),
    ("gpt-5.1", "openai/gpt-5.1"),
    ("llama-70b", "meta-llama/llama-3.3-70b-instruct"),
    ("r2", "deepseek/deepseek-r2"),
    ("free", FREE_MODEL),
];

/// Process-wide model catalog. Cheap to construct; all data is `'static`.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog;

impl ModelCatalog {
    pub fn new() -> Self {
        Self
    }

    pub fn models(&self) -> &'static [ModelInfo] {
        MODELS
    }

    /// Look up a canonical id.
    pub fn get(&self, id: &str) -> Option<&'static ModelInfo> {
        MODELS.iter().find(|m| m.id == id)
    }

    /// Resolve a raw `model` field: strip the host prefix, try the sentinel,
    /// tier keywords, aliases, then canonical ids.
    pub fn resolve(&self, raw: &str) -> Resolved {
        let name = raw.trim();
        let name = name.strip_prefix(HOST_PREFIX).unwrap_or(name);

        if name.eq_ignore_ascii_case(AUTO_MODEL) || name.is_empty() {
            return Resolved::Auto;
        }
        if let Some(tier) = Tier::from_keyword(name) {
            return Resolved::TierKeyword(tier);
        }

        let canonical = ALIASES
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(name))
            .map(|(_, id)| *id)
            .unwrap_or(name);

        match self.get(canonical) {
            Some(info) => Resolved::Model(info.id),
            None => Resolved::Unknown,
        }
    }

    /// The priciest reasoning-capable model — the router's cost baseline.
    pub fn baseline_model(&self) -> &'static ModelInfo {
        MODELS
            .iter()
            .filter(|m| m.reasoning)
            .max_by(|a, b| {
                (a.input_cost_per_m + a.output_cost_per_m)
                    .total_cmp(&(b.input_cost_per_m + b.output_cost_per_m))
            })
            .expect("catalog contains at least one reasoning model")
    }

    /// Cheapest model within `tier` whose context window fits `needed_tokens`.
    pub fn cheapest_fitting(&self, tier: Tier, needed_tokens: u64) -> Option<&'static ModelInfo> {
        MODELS
            .iter()
            .filter(|m| m.tier == tier && m.context_window >= needed_tokens)
            .min_by(|a, b| {
                (a.input_cost_per_m + a.output_cost_per_m)
                    .total_cmp(&(b.input_cost_per_m + b.output_cost_per_m))
            })
    }

    /// Validate a configured tier table against the catalog.
    pub fn validate_tiers(&self, tiers: &crate::config::TierTable) -> anyhow::Result<()> {
        for tier in Tier::ALL {
            for id in tiers.for_tier(tier).chain() {
                anyhow::ensure!(
                    self.get(id).is_some(),
                    "tiers.{}: unknown model `{id}`",
                    tier.to_string().to_lowercase()
                );
            }
        }
        Ok(())
    }
}

/// Built-in per-tier ladders, used when the config file does not override them.
pub fn default_tier_models(tier: Tier) -> TierModels {
    match tier {
        Tier::Simple => TierModels {
            primary: "google/gemini-2.5-flash-lite".into(),
            fallback: vec!["meta-llama/llama-3.3-70b-instruct".into()],
        },
        Tier::Medium => TierModels {
            primary: "anthropic/claude-haiku-4.5".into(),
            fallback: vec!["google/gemini-2.5-flash".into()],
        },
        Tier::Complex => TierModels {
            primary: "anthropic/claude-sonnet-4.6".into(),
            fallback: vec!["openai/gpt-5.1".into()],
        },
        Tier::Reasoning => TierModels {
            primary: "anthropic/claude-opus-4.6".into(),
            fallback: vec!["deepseek/deepseek-r2".into()],
        },
    }
}
