//! The smart router: keyword pass, ambiguity handling, tier policy.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use maestro_cache::{CachedDispatcher, CallSpec};
use maestro_types::{CompletionRequest, RouteError, Tier};

use crate::tables::{RoutingConfig, RoutingTables};

/// Fixed system prompt for the disambiguation classifier. The response
/// is constrained to the candidate set by exact match; anything else is
/// discarded.
const CLASSIFIER_SYSTEM_PROMPT: &str = "You classify engineering requests into exactly one \
workflow from a given list. Reply with the workflow name only, nothing else.";

/// Caller-supplied routing context.
#[derive(Debug, Clone, Default)]
pub struct RouteHints {
    /// Extension of the file the request concerns, without the dot.
    pub file_extension: Option<String>,
    /// Coarse error class when routing from a failure.
    pub error_class: Option<String>,
}

/// Where a request should go.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    /// The chosen workflow.
    pub primary: String,
    /// Other plausible workflows, best first.
    pub secondary: Vec<String>,
    /// Tier the first stage should start at.
    pub initial_tier: Tier,
    /// Keyword score of the winner, capped at 1.
    pub confidence: f32,
    /// Human-readable account of how the decision was made.
    pub rationale: String,
}

/// Keyword router with optional LLM disambiguation.
///
/// `route` is a pure function of `(text, hints, tables)` whenever the
/// keyword pass is decisive; the classifier is consulted only inside
/// the ambiguity band.
pub struct SmartRouter {
    config: RoutingConfig,
    tables: RoutingTables,
    /// Default tier per workflow, from the registered definitions.
    workflow_tiers: HashMap<String, Tier>,
    classifier: Option<Classifier>,
}

struct Classifier {
    dispatcher: Arc<CachedDispatcher>,
    /// A CHEAP-tier model id.
    model: String,
}

impl SmartRouter {
    /// Create a router over the given tables.
    #[must_use]
    pub fn new(config: RoutingConfig, tables: RoutingTables) -> Self {
        Self {
            config,
            tables,
            workflow_tiers: HashMap::new(),
            classifier: None,
        }
    }

    /// Record a workflow's default tier (used for the initial tier
    /// unless a heuristic overrides it).
    pub fn set_workflow_tier(&mut self, workflow: impl Into<String>, tier: Tier) {
        self.workflow_tiers.insert(workflow.into(), tier);
    }

    /// Enable LLM disambiguation with a CHEAP-tier model.
    #[must_use]
    pub fn with_classifier(mut self, dispatcher: Arc<CachedDispatcher>, model: impl Into<String>) -> Self {
        self.classifier = Some(Classifier {
            dispatcher,
            model: model.into(),
        });
        self
    }

    /// Route free text to a workflow.
    ///
    /// # Errors
    ///
    /// [`RouteError::RoutingFailure`] when no workflow scores above the
    /// floor, or the request is ambiguous and the classifier cannot
    /// resolve it. The router never guesses.
    pub async fn route(
        &self,
        text: &str,
        hints: &RouteHints,
        cancel: &CancellationToken,
    ) -> Result<RoutingDecision, RouteError> {
        let normalized = normalize(text);
        let mut scores = self.score(&normalized, hints);
        scores.sort_by(|a, b| b.1.total_cmp(&a.1));

        let suggestions = |scores: &[(String, f32)]| {
            scores
                .iter()
                .filter(|(_, s)| *s > 0.0)
                .take(3)
                .map(|(w, _)| w.clone())
                .collect::<Vec<_>>()
        };

        let Some((leader, leader_score)) = scores.first().cloned() else {
            return Err(RouteError::RoutingFailure {
                suggestions: Vec::new(),
            });
        };
        if leader_score < self.config.min_threshold {
            return Err(RouteError::RoutingFailure {
                suggestions: suggestions(&scores),
            });
        }

        let secondary: Vec<String> = scores
            .iter()
            .skip(1)
            .filter(|(_, s)| *s >= self.config.min_threshold)
            .take(2)
            .map(|(w, _)| w.clone())
            .collect();

        // A decisive leader wins outright.
        if leader_score >= self.config.hard_threshold {
            return Ok(self.decision(
                leader,
                secondary,
                leader_score,
                &normalized,
                format!("keyword score {leader_score:.2} above hard threshold"),
            ));
        }

        // Inside the ambiguity band the classifier decides; without one
        // (or on failure) the request stays ambiguous and routing fails.
        let runner_up = scores.get(1).filter(|(_, s)| {
            leader_score - *s <= self.config.ambiguity_band && *s >= self.config.min_threshold
        });
        if let Some((other, _)) = runner_up {
            let candidates = vec![leader.clone(), other.clone()];
            match self.classify(text, &candidates, cancel).await {
                Some(choice) => {
                    let secondary = candidates.into_iter().filter(|c| *c != choice).collect();
                    return Ok(self.decision(
                        choice,
                        secondary,
                        leader_score,
                        &normalized,
                        "classifier resolved keyword ambiguity".to_string(),
                    ));
                }
                None => {
                    return Err(RouteError::RoutingFailure {
                        suggestions: suggestions(&scores),
                    });
                }
            }
        }

        Ok(self.decision(
            leader,
            secondary,
            leader_score,
            &normalized,
            format!("keyword score {leader_score:.2} unambiguous"),
        ))
    }

    /// Workflows worth running against a file, best first. Pure rule
    /// table, infallible.
    #[must_use]
    pub fn suggest_for_file(&self, path: &Path) -> Vec<String> {
        let key = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .or_else(|| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_ascii_lowercase)
            });
        key.and_then(|k| self.tables.file_suggestions.get(&k).cloned())
            .unwrap_or_default()
    }

    /// Workflows worth running for an error class, best first.
    #[must_use]
    pub fn suggest_for_error(&self, error_class: &str) -> Vec<String> {
        self.tables
            .error_suggestions
            .get(&error_class.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    /// Weighted keyword scores with hint multipliers applied.
    fn score(&self, normalized: &str, hints: &RouteHints) -> Vec<(String, f32)> {
        let padded = format!(" {normalized} ");
        let mut scores: Vec<(String, f32)> = self
            .tables
            .keywords
            .iter()
            .map(|(workflow, rules)| {
                let score = rules
                    .iter()
                    .filter(|rule| padded.contains(&format!(" {} ", rule.keyword)))
                    .map(|rule| rule.weight)
                    .sum::<f32>()
                    .min(1.0);
                (workflow.clone(), score)
            })
            .collect();

        if let Some(ext) = &hints.file_extension
            && let Some(boosts) = self.tables.extension_boosts.get(&ext.to_ascii_lowercase())
        {
            for (workflow, score) in &mut scores {
                if let Some((_, multiplier)) = boosts.iter().find(|(w, _)| w == workflow) {
                    *score = (*score * multiplier).min(1.0);
                }
            }
        }
        scores
    }

    fn decision(
        &self,
        primary: String,
        secondary: Vec<String>,
        score: f32,
        normalized: &str,
        rationale: String,
    ) -> RoutingDecision {
        let default_tier = self
            .workflow_tiers
            .get(&primary)
            .copied()
            .unwrap_or(Tier::Capable);
        let initial_tier = tier_policy(normalized, default_tier);
        RoutingDecision {
            primary,
            secondary,
            initial_tier,
            confidence: score.min(1.0),
            rationale,
        }
    }

    /// Ask the CHEAP classifier to pick among candidates. Returns `None`
    /// when no classifier is configured, the call fails, or the answer
    /// is outside the candidate set.
    async fn classify(
        &self,
        text: &str,
        candidates: &[String],
        cancel: &CancellationToken,
    ) -> Option<String> {
        let classifier = self.classifier.as_ref()?;
        let mut request = CompletionRequest::new(
            classifier.model.clone(),
            format!("Request: {text}\nWorkflows: {}", candidates.join(", ")),
        );
        request.system = Some(CLASSIFIER_SYSTEM_PROMPT.to_string());
        request.temperature = Some(0.0);
        request.max_tokens = 16;

        let spec = CallSpec::new(request, Tier::Cheap);
        match classifier.dispatcher.call(spec, cancel).await {
            Ok(outcome) => {
                let answer = outcome.response.text.trim().to_ascii_lowercase();
                let chosen = candidates.iter().find(|c| c.to_ascii_lowercase() == answer);
                if chosen.is_none() {
                    tracing::debug!(%answer, "classifier answered outside the candidate set");
                }
                chosen.cloned()
            }
            Err(error) => {
                tracing::warn!(%error, "classifier call failed, routing stays ambiguous");
                None
            }
        }
    }
}

/// Lowercase, trim, strip punctuation except identifier characters
/// (`_`, `-`, `.`, `/`), collapse whitespace.
#[must_use]
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut in_whitespace = true; // leading whitespace is dropped
    for ch in lowered.chars() {
        if ch.is_alphanumeric() || matches!(ch, '_' | '-' | '.' | '/') {
            out.push(ch);
            in_whitespace = false;
        } else if !in_whitespace {
            out.push(' ');
            in_whitespace = true;
        }
    }
    out.trim_end().to_string()
}

/// Tier overrides from the request text: trivial asks run CHEAP,
/// architecture and security-critical asks run PREMIUM.
fn tier_policy(normalized: &str, default_tier: Tier) -> Tier {
    const PREMIUM_MARKERS: [&str; 5] = [
        "architecture",
        "architectural",
        "design",
        "security-critical",
        "threat model",
    ];
    const CHEAP_MARKERS: [&str; 5] = ["summarize", "summary", "simple", "quick", "tldr"];

    let padded = format!(" {normalized} ");
    if PREMIUM_MARKERS.iter().any(|m| padded.contains(&format!(" {m} "))) {
        Tier::Premium
    } else if CHEAP_MARKERS.iter().any(|m| padded.contains(&format!(" {m} "))) {
        Tier::Cheap
    } else {
        default_tier
    }
}
