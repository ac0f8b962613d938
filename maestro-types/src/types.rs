//! Core value types: tiers, models, requests, responses, call outcomes.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::money::{ceil_div, decimal_to_micros};

/// Cost/capability band for model selection and escalation.
///
/// The ordering is load-bearing: escalation moves strictly upward and
/// never back down within an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    /// Fast, low-cost models for simple sub-tasks.
    Cheap,
    /// Mid-range models for most engineering work.
    Capable,
    /// Frontier models for architecture, security, and escalations.
    Premium,
}

impl Tier {
    /// The next tier up, or `None` at the top.
    #[must_use]
    pub fn next(self) -> Option<Tier> {
        match self {
            Tier::Cheap => Some(Tier::Capable),
            Tier::Capable => Some(Tier::Premium),
            Tier::Premium => None,
        }
    }

    /// All tiers in ascending order.
    #[must_use]
    pub fn all() -> [Tier; 3] {
        [Tier::Cheap, Tier::Capable, Tier::Premium]
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Tier::Cheap => "CHEAP",
            Tier::Capable => "CAPABLE",
            Tier::Premium => "PREMIUM",
        };
        f.write_str(name)
    }
}

impl FromStr for Tier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CHEAP" => Ok(Tier::Cheap),
            "CAPABLE" => Ok(Tier::Capable),
            "PREMIUM" => Ok(Tier::Premium),
            other => Err(ConfigError::Invalid(format!("unknown tier: {other}"))),
        }
    }
}

/// Token counts for a single completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input (prompt) tokens consumed.
    #[serde(rename = "input")]
    pub input_tokens: u64,
    /// Output (completion) tokens generated.
    #[serde(rename = "output")]
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Create a usage record from input/output counts.
    #[must_use]
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

/// Immutable description of a registered model.
///
/// Registered once at startup into the [`ModelRegistry`]; never mutated
/// afterwards. Prices are per million tokens in the canonical currency
/// unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Stable model identifier (e.g. `claude-sonnet-4-20250514`).
    pub id: String,
    /// Provider that serves this model.
    pub provider: String,
    /// Cost/capability tier.
    pub tier: Tier,
    /// Price per million input tokens.
    pub input_cost_per_million: Decimal,
    /// Price per million output tokens.
    pub output_cost_per_million: Decimal,
    /// Maximum context window in tokens.
    pub context_window: u32,
    /// Whether the provider supports prompt cache-control markers for
    /// this model.
    #[serde(default)]
    pub supports_cache_control: bool,
    /// Ordered alternates to try when this model's provider is down or
    /// retries are exhausted. Same or lower tier.
    #[serde(default)]
    pub fallback_chain: Vec<String>,
}

impl ModelDescriptor {
    /// Cost of the given token usage, in integer micro-units.
    ///
    /// Ceiling-rounded per direction so costs are never under-counted.
    #[must_use]
    pub fn cost_micros(&self, usage: &TokenUsage) -> u64 {
        let input_rate = decimal_to_micros(self.input_cost_per_million).unwrap_or(0);
        let output_rate = decimal_to_micros(self.output_cost_per_million).unwrap_or(0);
        let input = ceil_div(
            u128::from(usage.input_tokens) * u128::from(input_rate),
            1_000_000,
        );
        let output = ceil_div(
            u128::from(usage.output_tokens) * u128::from(output_rate),
            1_000_000,
        );
        input.saturating_add(output)
    }

    /// Rough cost estimate for a prompt of `prompt_bytes` bytes producing
    /// up to `max_tokens` output tokens. Uses the 4-bytes-per-token
    /// heuristic for the input side.
    #[must_use]
    pub fn estimate_micros(&self, prompt_bytes: usize, max_tokens: u32) -> u64 {
        let usage = TokenUsage::new((prompt_bytes / 4) as u64, u64::from(max_tokens));
        self.cost_micros(&usage)
    }
}

/// Read-only table of registered models, keyed by id.
///
/// Built once at startup from configuration; shared by reference
/// afterwards. There is no mutation API.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelDescriptor>,
}

impl ModelRegistry {
    /// Build a registry from descriptors, validating each entry.
    ///
    /// # Errors
    ///
    /// `ConfigError` on duplicate model ids, unconvertible prices, or a
    /// fallback chain referencing the model itself.
    pub fn new(descriptors: Vec<ModelDescriptor>) -> Result<Self, ConfigError> {
        let mut models = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if decimal_to_micros(descriptor.input_cost_per_million).is_none()
                || decimal_to_micros(descriptor.output_cost_per_million).is_none()
            {
                return Err(ConfigError::Invalid(format!(
                    "model {}: price not representable in micro-units",
                    descriptor.id
                )));
            }
            if descriptor.fallback_chain.contains(&descriptor.id) {
                return Err(ConfigError::Invalid(format!(
                    "model {}: fallback chain references itself",
                    descriptor.id
                )));
            }
            if models
                .insert(descriptor.id.clone(), descriptor)
                .is_some()
            {
                return Err(ConfigError::Invalid("duplicate model id".into()));
            }
        }
        Ok(Self { models })
    }

    /// Look up a model by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.models.get(id)
    }

    /// All registered model ids, unordered.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Number of registered models.
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Models at the given tier, unordered.
    pub fn at_tier(&self, tier: Tier) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.values().filter(move |m| m.tier == tier)
    }

    /// The reference model for the savings baseline: the highest-priced
    /// PREMIUM model, falling back to the highest-priced model overall
    /// when no PREMIUM model is registered.
    #[must_use]
    pub fn premium_reference(&self) -> Option<&ModelDescriptor> {
        let price = |m: &ModelDescriptor| m.input_cost_per_million + m.output_cost_per_million;
        self.at_tier(Tier::Premium)
            .max_by_key(|m| price(m))
            .or_else(|| self.models.values().max_by_key(|m| price(m)))
    }
}

/// A single prompt dispatch to a provider.
///
/// One stage execution produces exactly one of these (plus one per
/// escalation). Chat history is the workflow engine's concern; providers
/// see a flat prompt + system pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model identifier. Providers may substitute a default when empty.
    pub model: String,
    /// The user-facing prompt.
    pub prompt: String,
    /// Optional system prompt.
    pub system: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Nucleus sampling parameter.
    pub top_p: Option<f32>,
    /// Maximum output tokens.
    pub max_tokens: u32,
    /// Provider-specific passthrough fields (cache-control markers,
    /// thinking budgets, and similar).
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CompletionRequest {
    /// Create a request with required fields and defaults elsewhere.
    #[must_use]
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            temperature: None,
            top_p: None,
            max_tokens: 1024,
            extra: HashMap::new(),
        }
    }
}

/// A provider's answer to a [`CompletionRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// The completion text.
    pub text: String,
    /// The model that actually served the request.
    pub model: String,
    /// Token counts for this completion.
    pub usage: TokenUsage,
}

/// Request for one or more embedding vectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Embedding model identifier. Providers may substitute a default
    /// when empty.
    pub model: String,
    /// Input texts, one vector produced per entry.
    pub input: Vec<String>,
}

/// One embedding vector per requested input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// Vectors in input order.
    pub embeddings: Vec<Vec<f32>>,
    /// The model that produced the vectors.
    pub model: String,
}

/// How the cache disposed of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    /// Whether the response came from the cache.
    pub hit: bool,
    /// Hit flavor; absent on misses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<CacheHitKind>,
}

impl CacheInfo {
    /// A cache miss.
    #[must_use]
    pub fn miss() -> Self {
        Self {
            hit: false,
            kind: None,
        }
    }

    /// An exact-fingerprint hit.
    #[must_use]
    pub fn exact_hit() -> Self {
        Self {
            hit: true,
            kind: Some(CacheHitKind::Exact),
        }
    }

    /// A semantic (near-identical prompt) hit.
    #[must_use]
    pub fn semantic_hit() -> Self {
        Self {
            hit: true,
            kind: Some(CacheHitKind::Semantic),
        }
    }
}

/// Flavor of a cache hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheHitKind {
    /// Exact fingerprint match.
    Exact,
    /// Embedding similarity match.
    Semantic,
}

/// The terminal result of one provider-bound call, after resilience and
/// caching have done their work.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// The completion.
    pub response: CompletionResponse,
    /// Provider that served (or would have served) the call.
    pub provider: String,
    /// Model that served (or would have served) the call.
    pub model_id: String,
    /// Cost in micro-units. Zero on cache hits.
    pub cost_micros: u64,
    /// Wall-clock duration: provider round-trip on misses, lookup time
    /// on hits.
    pub duration: Duration,
    /// Every model attempted, in order, ending with the one that served.
    pub fallback_chain: Vec<String>,
    /// Cache disposition.
    pub cache: CacheInfo,
}

/// What the engine reports to a [`crate::PatternSink`] after each
/// completed stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternObservation {
    /// Workflow name.
    pub workflow: String,
    /// Stage name.
    pub stage: String,
    /// Tier the stage finally ran at.
    pub tier_used: Tier,
    /// Tier the stage started at, when escalation happened.
    pub escalated_from: Option<Tier>,
    /// Cache disposition of the final attempt.
    pub cache: CacheInfo,
    /// Stage cost in micro-units (all attempts).
    pub cost_micros: u64,
    /// Stage duration in milliseconds (all attempts).
    pub duration_ms: u64,
    /// Parsed confidence from the stage output, when present.
    pub confidence: Option<f32>,
}
