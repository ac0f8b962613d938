//! The configuration file schema and loaders.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;

use maestro_engine::{EscalationPolicy, EscalationTrigger, StageSpec, WorkflowDefinition};
use maestro_types::{decimal_to_micros, ConfigError, ModelDescriptor, Tier};

/// Top-level configuration. Every section is optional; an empty file is
/// a valid (if useless) configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaestroConfig {
    /// Provider connection settings, keyed by provider id.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    /// Model descriptors, keyed by model id.
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    /// Workflow definitions, keyed by workflow name.
    #[serde(default)]
    pub workflows: HashMap<String, WorkflowConfig>,
    /// Response cache settings.
    #[serde(default)]
    pub cache: CacheSection,
    /// Telemetry ledger settings.
    #[serde(default)]
    pub telemetry: TelemetrySection,
    /// Router thresholds.
    #[serde(default)]
    pub routing: RoutingSection,
    /// Retry and circuit breaker settings.
    #[serde(default)]
    pub resilience: ResilienceSection,
    /// Raw user identifier; stored only as a truncated hash.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// One provider's connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Endpoint base URL override.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// In-flight call bound; default 8.
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Model ids to fall back to when this provider's models exhaust
    /// their retries.
    #[serde(default)]
    pub fallback_chain: Vec<String>,
}

/// One model's descriptor as configured.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Provider id serving this model.
    pub provider: String,
    /// Tier name, case-insensitive.
    pub tier: String,
    /// Price per million input tokens, canonical currency units.
    pub input_cost_per_million: Decimal,
    /// Price per million output tokens.
    pub output_cost_per_million: Decimal,
    /// Context window in tokens.
    pub context_window: u32,
    /// Provider supports prompt cache-control markers.
    #[serde(default)]
    pub supports_cache_control: bool,
}

/// One workflow as configured.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    /// One-line description.
    #[serde(default)]
    pub description: String,
    /// Stage list, in order.
    pub stages: Vec<StageConfig>,
    /// Budget cap in canonical currency units.
    #[serde(default)]
    pub budget_cap: Option<Decimal>,
    /// Default tier for stages that set none.
    #[serde(default)]
    pub default_tier: Option<String>,
}

/// One stage as configured.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Stage name.
    pub name: String,
    /// System-prompt persona.
    #[serde(default)]
    pub role: Option<String>,
    /// Tier name; falls back to the workflow default, then CAPABLE.
    #[serde(default)]
    pub tier: Option<String>,
    /// Pinned model id.
    #[serde(default)]
    pub model: Option<String>,
    /// Prompt template.
    pub prompt: String,
    /// Whether failure aborts the workflow. Default true.
    #[serde(default)]
    pub required: Option<bool>,
    /// Declared input keys.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Output key; defaults to the stage name.
    #[serde(default)]
    pub produces: Option<String>,
    /// Parallel group id.
    #[serde(default)]
    pub parallel_group: Option<String>,
    /// Escalation policy.
    #[serde(default)]
    pub escalation: Option<EscalationConfig>,
    /// Output token cap; default 1024.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Escalation policy as configured.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EscalationConfig {
    /// `low_confidence`, `parse_failure`, or `explicit_signal`.
    pub trigger: String,
    /// Confidence floor for `low_confidence`.
    #[serde(default)]
    pub below: Option<f32>,
    /// Explicit target tier; default one up.
    #[serde(default)]
    pub next_tier: Option<String>,
    /// Escalation cap; default 1.
    #[serde(default)]
    pub max_escalations: Option<u32>,
}

/// Cache section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    /// Master switch.
    pub enabled: bool,
    /// `hash` or `hybrid`.
    pub mode: String,
    /// Byte budget for stored responses.
    pub max_bytes: usize,
    /// Cosine floor for semantic hits.
    pub semantic_threshold: f32,
    /// Freshness window for semantic hits, in days.
    pub semantic_age_limit_days: u32,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: "hash".into(),
            max_bytes: 256 * 1024 * 1024,
            semantic_threshold: 0.92,
            semantic_age_limit_days: 7,
        }
    }
}

/// Telemetry section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    /// Master switch.
    pub enabled: bool,
    /// Ledger directory; default `<data_dir>/telemetry`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Rotated-file retention in days.
    pub retention_days: u32,
    /// Rotation threshold in bytes.
    pub max_file_bytes: u64,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            retention_days: 90,
            max_file_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Routing thresholds section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingSection {
    /// Decisive-match threshold.
    pub hard_threshold: f32,
    /// Ambiguity band width.
    pub ambiguity_band: f32,
    /// Failure floor.
    pub min_threshold: f32,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            hard_threshold: 0.65,
            ambiguity_band: 0.1,
            min_threshold: 0.2,
        }
    }
}

/// Resilience section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResilienceSection {
    /// First retry delay in milliseconds.
    pub retry_initial_ms: u64,
    /// Retry delay ceiling in milliseconds.
    pub retry_max_ms: u64,
    /// Attempts per model including the first.
    pub retry_max_attempts: u32,
    /// Consecutive failures that open a circuit.
    pub circuit_failures_open: u32,
    /// Open-circuit cooldown in milliseconds.
    pub circuit_cooldown_ms: u64,
    /// Probes admitted while half-open.
    pub half_open_probes: u32,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            retry_initial_ms: 200,
            retry_max_ms: 8_000,
            retry_max_attempts: 4,
            circuit_failures_open: 5,
            circuit_cooldown_ms: 30_000,
            half_open_probes: 2,
        }
    }
}

impl MaestroConfig {
    /// Load a config file; YAML or JSON, chosen by extension (anything
    /// that is not `.json` parses as YAML, which is a superset for our
    /// purposes).
    ///
    /// # Errors
    ///
    /// `ConfigError::Io` on read failure, `ConfigError::Parse` on
    /// malformed content.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&contents)
        } else {
            Self::from_yaml(&contents)
        }
    }

    /// Parse a YAML config.
    ///
    /// # Errors
    ///
    /// `ConfigError::Parse` on malformed content.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse a JSON config.
    ///
    /// # Errors
    ///
    /// `ConfigError::Parse` on malformed content.
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Build the model registry from the `models` section, attaching
    /// each provider's fallback chain.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` on unknown tiers, unknown provider
    /// references, or fallback chains naming unknown models.
    pub fn build_registry(&self) -> Result<Vec<ModelDescriptor>, ConfigError> {
        let mut descriptors = Vec::with_capacity(self.models.len());
        for (id, model) in &self.models {
            if !self.providers.contains_key(&model.provider) {
                return Err(ConfigError::Invalid(format!(
                    "model {id} references unknown provider {}",
                    model.provider
                )));
            }
            let provider = &self.providers[&model.provider];
            for fallback in &provider.fallback_chain {
                if !self.models.contains_key(fallback) {
                    return Err(ConfigError::Invalid(format!(
                        "provider {} fallback chain references unknown model {fallback}",
                        model.provider
                    )));
                }
            }
            let fallback_chain = provider
                .fallback_chain
                .iter()
                .filter(|m| *m != id)
                .cloned()
                .collect();
            descriptors.push(ModelDescriptor {
                id: id.clone(),
                provider: model.provider.clone(),
                tier: Tier::from_str(&model.tier)?,
                input_cost_per_million: model.input_cost_per_million,
                output_cost_per_million: model.output_cost_per_million,
                context_window: model.context_window,
                supports_cache_control: model.supports_cache_control,
                fallback_chain,
            });
        }
        // Deterministic registration order regardless of map iteration.
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(descriptors)
    }

    /// Convert the `workflows` section to engine definitions.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` on unknown tiers or triggers; structural
    /// validation happens at registration.
    pub fn build_workflows(&self) -> Result<Vec<WorkflowDefinition>, ConfigError> {
        let mut definitions = Vec::with_capacity(self.workflows.len());
        for (name, workflow) in &self.workflows {
            let workflow_tier = match &workflow.default_tier {
                Some(t) => Some(Tier::from_str(t)?),
                None => None,
            };
            let mut stages = Vec::with_capacity(workflow.stages.len());
            for stage in &workflow.stages {
                let tier = match &stage.tier {
                    Some(t) => Tier::from_str(t)?,
                    None => workflow_tier.unwrap_or(Tier::Capable),
                };
                let escalation = match &stage.escalation {
                    Some(e) => Some(build_escalation(e)?),
                    None => None,
                };
                stages.push(StageSpec {
                    name: stage.name.clone(),
                    role: stage.role.clone().unwrap_or_default(),
                    default_tier: tier,
                    model: stage.model.clone(),
                    prompt_template: stage.prompt.clone(),
                    required: stage.required.unwrap_or(true),
                    required_inputs: stage.inputs.clone(),
                    produces: stage.produces.clone().unwrap_or_else(|| stage.name.clone()),
                    parallel_group: stage.parallel_group.clone(),
                    escalation,
                    max_tokens: stage.max_tokens.unwrap_or(1024),
                    temperature: stage.temperature,
                });
            }
            let mut definition = WorkflowDefinition::new(name, &workflow.description, stages);
            if let Some(cap) = workflow.budget_cap {
                definition.budget_cap_micros = Some(decimal_to_micros(cap).ok_or_else(|| {
                    ConfigError::Invalid(format!("workflow {name}: budget_cap out of range"))
                })?);
            }
            definitions.push(definition);
        }
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(definitions)
    }
}

fn build_escalation(config: &EscalationConfig) -> Result<EscalationPolicy, ConfigError> {
    let trigger = match config.trigger.as_str() {
        "low_confidence" => EscalationTrigger::LowConfidence {
            below: config.below.unwrap_or(0.5),
        },
        "parse_failure" => EscalationTrigger::ParseFailure,
        "explicit_signal" => EscalationTrigger::ExplicitSignal,
        other => {
            return Err(ConfigError::Invalid(format!(
                "unknown escalation trigger: {other}"
            )));
        }
    };
    let next_tier = match &config.next_tier {
        Some(t) => Some(Tier::from_str(t)?),
        None => None,
    };
    Ok(EscalationPolicy {
        trigger,
        next_tier,
        max_escalations: config.max_escalations.unwrap_or(1),
    })
}
