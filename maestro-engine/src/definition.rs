//! Workflow and stage definitions, validation, and the built-in set.

use serde::{Deserialize, Serialize};

use maestro_types::{EngineError, Tier};

/// What makes a completed stage re-run at a higher tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTrigger {
    /// The stage's parsed output carries a `confidence` below the floor.
    LowConfidence {
        /// Confidence floor in `[0, 1]`.
        below: f32,
    },
    /// The stage declared structured output and the response failed to
    /// parse as JSON.
    ParseFailure,
    /// The model itself asked for escalation (an `escalate: true` field
    /// or an `ESCALATE` marker in the text).
    ExplicitSignal,
}

/// Per-stage escalation policy. Escalation is strictly upward and
/// bounded; a stage never re-runs at or below a tier it already used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// What triggers the escalation.
    pub trigger: EscalationTrigger,
    /// Tier for the re-run; `None` means one tier up from the current.
    pub next_tier: Option<Tier>,
    /// Maximum escalations for this stage within one invocation.
    pub max_escalations: u32,
}

/// One stage: a single prompt dispatch plus possible escalations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Unique stage name within the workflow.
    pub name: String,
    /// Persona for the system prompt.
    pub role: String,
    /// Tier the stage starts at.
    pub default_tier: Tier,
    /// Pin a model for the first attempt; escalated attempts always
    /// resolve through the registry at the escalated tier.
    #[serde(default)]
    pub model: Option<String>,
    /// Prompt template; `{name}` placeholders draw from invocation
    /// inputs and earlier stages' `produces` keys.
    pub prompt_template: String,
    /// Whether a failure here aborts the rest of the workflow.
    #[serde(default)]
    pub required: bool,
    /// Input keys this stage needs; checked before rendering.
    #[serde(default)]
    pub required_inputs: Vec<String>,
    /// Key under which this stage's output is published to later
    /// stages.
    pub produces: String,
    /// Stages sharing a group id run concurrently between barriers.
    #[serde(default)]
    pub parallel_group: Option<String>,
    /// Escalation policy, if any.
    #[serde(default)]
    pub escalation: Option<EscalationPolicy>,
    /// Output token cap for the dispatch.
    pub max_tokens: u32,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl StageSpec {
    /// A minimal required sequential stage.
    #[must_use]
    pub fn new(name: &str, role: &str, tier: Tier, prompt_template: &str) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            default_tier: tier,
            model: None,
            prompt_template: prompt_template.into(),
            required: true,
            required_inputs: Vec::new(),
            produces: name.into(),
            parallel_group: None,
            escalation: None,
            max_tokens: 1024,
            temperature: None,
        }
    }

    /// Mark the stage optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Put the stage in a parallel group.
    #[must_use]
    pub fn in_group(mut self, group: &str) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    /// Attach an escalation policy.
    #[must_use]
    pub fn escalates(mut self, policy: EscalationPolicy) -> Self {
        self.escalation = Some(policy);
        self
    }

    /// Declare required input keys.
    #[must_use]
    pub fn requires(mut self, inputs: &[&str]) -> Self {
        self.required_inputs = inputs.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Cap output tokens.
    #[must_use]
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// An ordered stage list, immutable after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name; the registration key.
    pub name: String,
    /// One-line description for listings.
    pub description: String,
    /// Stages in declaration order.
    pub stages: Vec<StageSpec>,
    /// Default budget cap in micro-units; callers can override.
    #[serde(default)]
    pub budget_cap_micros: Option<u64>,
}

impl WorkflowDefinition {
    /// Create a definition; validate with [`validate`](Self::validate)
    /// before registering.
    #[must_use]
    pub fn new(name: &str, description: &str, stages: Vec<StageSpec>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            stages,
            budget_cap_micros: None,
        }
    }

    /// Structural validation, run at registration.
    ///
    /// # Errors
    ///
    /// `EngineError::InvalidDefinition` on empty stage lists, duplicate
    /// stage names or produces keys, non-contiguous parallel groups,
    /// forward input references, or non-upward escalation targets.
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: String| Err(EngineError::InvalidDefinition(msg));

        if self.name.is_empty() {
            return invalid("workflow name is empty".into());
        }
        if self.stages.is_empty() {
            return invalid(format!("workflow {} has no stages", self.name));
        }

        let mut seen_names = std::collections::HashSet::new();
        let mut seen_produces = std::collections::HashSet::new();
        for stage in &self.stages {
            if !seen_names.insert(stage.name.as_str()) {
                return invalid(format!("duplicate stage name {}", stage.name));
            }
            if !seen_produces.insert(stage.produces.as_str()) {
                return invalid(format!("duplicate produces key {}", stage.produces));
            }
            if stage.max_tokens == 0 {
                return invalid(format!("stage {} has max_tokens 0", stage.name));
            }
            if let Some(policy) = &stage.escalation {
                let target = policy.next_tier.or_else(|| stage.default_tier.next());
                match target {
                    Some(t) if t > stage.default_tier => {}
                    Some(t) => {
                        return invalid(format!(
                            "stage {}: escalation target {t} is not above {}",
                            stage.name, stage.default_tier
                        ));
                    }
                    // A PREMIUM stage with natural escalation has
                    // nowhere to go; that's a no-op, not an error.
                    None => {}
                }
            }
        }

        // Parallel groups must be contiguous runs.
        let mut finished_groups = std::collections::HashSet::new();
        let mut current: Option<&str> = None;
        for stage in &self.stages {
            match (&stage.parallel_group, current) {
                (Some(group), Some(open)) if group == open => {}
                (Some(group), _) => {
                    if !finished_groups.insert(group.as_str()) {
                        return invalid(format!("parallel group {group} is not contiguous"));
                    }
                    current = Some(group.as_str());
                }
                (None, _) => current = None,
            }
        }

        // No stage may consume a key produced later than itself, and
        // parallel peers cannot read each other.
        for (i, stage) in self.stages.iter().enumerate() {
            for input in &stage.required_inputs {
                let producer = self.stages.iter().position(|s| s.produces == *input);
                if let Some(j) = producer {
                    let same_group = self.stages[j].parallel_group.is_some()
                        && self.stages[j].parallel_group == stage.parallel_group;
                    if j >= i || same_group {
                        return invalid(format!(
                            "stage {} reads {input} before it is produced",
                            stage.name
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}

/// The built-in workflow set: the five flagship engineering tasks.
///
/// Each takes a `target` input (the code, diff, or project description
/// under consideration).
#[must_use]
pub fn builtin_workflows() -> Vec<WorkflowDefinition> {
    let low_confidence = |below: f32| EscalationPolicy {
        trigger: EscalationTrigger::LowConfidence { below },
        next_tier: None,
        max_escalations: 1,
    };

    vec![
        WorkflowDefinition::new(
            "code-review",
            "Review a diff or file for correctness, style, and risk",
            vec![
                StageSpec::new(
                    "context",
                    "You summarize code for reviewers.",
                    Tier::Cheap,
                    "Summarize what this change does:\n{target}",
                )
                .requires(&["target"])
                .max_tokens(512),
                StageSpec::new(
                    "analysis",
                    "You are a meticulous code reviewer.",
                    Tier::Capable,
                    "Context: {context}\n\nReview this change for correctness bugs. \
                     Respond as JSON with findings and a confidence field:\n{target}",
                )
                .requires(&["target", "context"])
                .escalates(low_confidence(0.6)),
                StageSpec::new(
                    "style",
                    "You review code style and readability.",
                    Tier::Cheap,
                    "List style and readability issues:\n{target}",
                )
                .requires(&["target"])
                .optional()
                .in_group("checks"),
                StageSpec::new(
                    "risk",
                    "You assess the blast radius of changes.",
                    Tier::Cheap,
                    "Given this summary, what could this change break?\n{context}",
                )
                .requires(&["context"])
                .optional()
                .in_group("checks"),
                StageSpec::new(
                    "summary",
                    "You write concise review summaries.",
                    Tier::Cheap,
                    "Combine into a review summary.\nFindings: {analysis}\nStyle: {style}\nRisk: {risk}",
                )
                .max_tokens(512),
            ],
        ),
        WorkflowDefinition::new(
            "security-audit",
            "Audit code for vulnerabilities",
            vec![
                StageSpec::new(
                    "surface",
                    "You map attack surfaces.",
                    Tier::Capable,
                    "Identify inputs, trust boundaries, and sinks:\n{target}",
                )
                .requires(&["target"]),
                StageSpec::new(
                    "audit",
                    "You are a security auditor.",
                    Tier::Premium,
                    "Attack surface: {surface}\n\nAudit for vulnerabilities. \
                     Respond as JSON with findings and a confidence field:\n{target}",
                )
                .requires(&["target", "surface"]),
                StageSpec::new(
                    "report",
                    "You write actionable security reports.",
                    Tier::Capable,
                    "Write a prioritized report from these findings:\n{audit}",
                ),
            ],
        ),
        WorkflowDefinition::new(
            "bug-predict",
            "Predict likely defects in changed code",
            vec![
                StageSpec::new(
                    "hotspots",
                    "You find defect-prone code.",
                    Tier::Cheap,
                    "Which parts of this code look defect-prone and why?\n{target}",
                )
                .requires(&["target"]),
                StageSpec::new(
                    "predict",
                    "You predict concrete failure modes.",
                    Tier::Capable,
                    "Hotspots: {hotspots}\n\nPredict concrete bugs with likelihood. \
                     Respond as JSON with a confidence field:\n{target}",
                )
                .requires(&["target", "hotspots"])
                .escalates(low_confidence(0.5)),
            ],
        ),
        WorkflowDefinition::new(
            "test-gen",
            "Generate tests for a module",
            vec![
                StageSpec::new(
                    "behaviors",
                    "You enumerate testable behaviors.",
                    Tier::Cheap,
                    "List the behaviors and edge cases worth testing:\n{target}",
                )
                .requires(&["target"]),
                StageSpec::new(
                    "tests",
                    "You write focused, deterministic tests.",
                    Tier::Capable,
                    "Behaviors: {behaviors}\n\nWrite tests for:\n{target}",
                )
                .requires(&["target", "behaviors"])
                .max_tokens(2048),
            ],
        ),
        WorkflowDefinition::new(
            "release-prep",
            "Prepare a release: changelog, risks, checklist",
            vec![
                StageSpec::new(
                    "changelog",
                    "You write changelogs from commit history.",
                    Tier::Cheap,
                    "Draft a changelog from:\n{target}",
                )
                .requires(&["target"]),
                StageSpec::new(
                    "risks",
                    "You assess release risk.",
                    Tier::Capable,
                    "Changelog: {changelog}\n\nWhat are the riskiest items and rollback plans?",
                )
                .optional()
                .in_group("assess"),
                StageSpec::new(
                    "checklist",
                    "You produce release checklists.",
                    Tier::Cheap,
                    "Changelog: {changelog}\n\nProduce a pre-release checklist.",
                )
                .optional()
                .in_group("assess"),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_workflows_validate() {
        let workflows = builtin_workflows();
        assert_eq!(workflows.len(), 5);
        for workflow in &workflows {
            workflow.validate().unwrap_or_else(|e| panic!("{}: {e}", workflow.name));
        }
    }

    #[test]
    fn empty_and_duplicate_stages_are_rejected() {
        let empty = WorkflowDefinition::new("w", "", vec![]);
        assert!(empty.validate().is_err());

        let dup = WorkflowDefinition::new(
            "w",
            "",
            vec![
                StageSpec::new("a", "r", Tier::Cheap, "p"),
                StageSpec::new("a", "r", Tier::Cheap, "p"),
            ],
        );
        assert!(dup.validate().is_err());
    }

    #[test]
    fn non_contiguous_groups_are_rejected() {
        let def = WorkflowDefinition::new(
            "w",
            "",
            vec![
                StageSpec::new("a", "r", Tier::Cheap, "p").in_group("g"),
                StageSpec::new("b", "r", Tier::Cheap, "p"),
                StageSpec::new("c", "r", Tier::Cheap, "p").in_group("g"),
            ],
        );
        assert!(def.validate().is_err());
    }

    #[test]
    fn forward_references_are_rejected() {
        let def = WorkflowDefinition::new(
            "w",
            "",
            vec![
                StageSpec::new("a", "r", Tier::Cheap, "{b}").requires(&["b"]),
                StageSpec::new("b", "r", Tier::Cheap, "p"),
            ],
        );
        assert!(def.validate().is_err());
    }

    #[test]
    fn parallel_peers_cannot_read_each_other() {
        let def = WorkflowDefinition::new(
            "w",
            "",
            vec![
                StageSpec::new("a", "r", Tier::Cheap, "p").in_group("g"),
                StageSpec::new("b", "r", Tier::Cheap, "{a}").requires(&["a"]).in_group("g"),
            ],
        );
        assert!(def.validate().is_err());
    }

    #[test]
    fn downward_escalation_is_rejected() {
        let stage = StageSpec::new("a", "r", Tier::Premium, "p").escalates(EscalationPolicy {
            trigger: EscalationTrigger::LowConfidence { below: 0.5 },
            next_tier: Some(Tier::Cheap),
            max_escalations: 1,
        });
        let def = WorkflowDefinition::new("w", "", vec![stage]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn premium_stage_with_natural_escalation_is_allowed() {
        let stage = StageSpec::new("a", "r", Tier::Premium, "p").escalates(EscalationPolicy {
            trigger: EscalationTrigger::ParseFailure,
            next_tier: None,
            max_escalations: 1,
        });
        let def = WorkflowDefinition::new("w", "", vec![stage]);
        def.validate().unwrap();
    }
}
