//! The workflow engine proper.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use maestro_cache::{CachedDispatcher, CallSpec};
use maestro_telemetry::{TelemetryEntry, UsageLedger, SCHEMA_VERSION};
use maestro_types::{
    CacheInfo, CompletionRequest, EngineError, ModelDescriptor, NoopPatternSink,
    PatternObservation, PatternSink, ProviderError, Tier, TokenUsage, micros_to_decimal,
};

use crate::context::{
    CacheUsage, ExecOptions, StageFailure, StageResult, StageStatus, WorkflowOutcome,
    WorkflowReport,
};
use crate::definition::{EscalationTrigger, StageSpec, WorkflowDefinition};
use crate::template;

static INVOCATION_SEQ: AtomicU64 = AtomicU64::new(1);

/// Executes registered workflows against the cached dispatcher.
///
/// Long-lived: construct one at startup, share behind an `Arc`. The
/// workflow table is write-locked only during registration; execution
/// takes cheap read locks.
pub struct WorkflowEngine {
    dispatcher: Arc<CachedDispatcher>,
    ledger: Option<Arc<UsageLedger>>,
    sink: Arc<dyn PatternSink>,
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    user_id_hash: Option<String>,
}

impl WorkflowEngine {
    /// Create an engine with no ledger and a no-op pattern sink.
    #[must_use]
    pub fn new(dispatcher: Arc<CachedDispatcher>) -> Self {
        Self {
            dispatcher,
            ledger: None,
            sink: Arc::new(NoopPatternSink),
            workflows: RwLock::new(HashMap::new()),
            user_id_hash: None,
        }
    }

    /// Attach the usage ledger.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<UsageLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Replace the pattern sink.
    #[must_use]
    pub fn with_pattern_sink(mut self, sink: Arc<dyn PatternSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Record a hashed user id on every ledger line.
    #[must_use]
    pub fn with_user_id(mut self, raw: &str) -> Self {
        self.user_id_hash = Some(maestro_telemetry::hash_user_id(raw));
        self
    }

    /// The cached dispatcher this engine executes against.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<CachedDispatcher> {
        &self.dispatcher
    }

    /// Register a workflow. Idempotent by name: re-registering an
    /// identical definition is a no-op.
    ///
    /// # Errors
    ///
    /// `InvalidDefinition` when validation fails, `DuplicateWorkflow`
    /// when the name is taken by a different definition.
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> Result<(), EngineError> {
        definition.validate()?;
        let mut workflows = self.workflows.write().expect("workflow table lock");
        if let Some(existing) = workflows.get(&definition.name) {
            if **existing == definition {
                return Ok(());
            }
            return Err(EngineError::DuplicateWorkflow(definition.name));
        }
        tracing::debug!(workflow = %definition.name, stages = definition.stages.len(), "registered workflow");
        workflows.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Registered workflow names, sorted.
    #[must_use]
    pub fn list_workflows(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .workflows
            .read()
            .expect("workflow table lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Look up a registered definition.
    #[must_use]
    pub fn definition(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows
            .read()
            .expect("workflow table lock")
            .get(name)
            .cloned()
    }

    /// Execute a workflow.
    ///
    /// # Errors
    ///
    /// Only caller mistakes surface here: `UnknownWorkflow`,
    /// `InvalidInput`, and `Cancelled` when the token was already
    /// cancelled before the first stage. Everything that happens during
    /// execution is encoded in the returned [`WorkflowReport`].
    pub async fn execute(
        &self,
        workflow_name: &str,
        inputs: HashMap<String, String>,
        options: ExecOptions,
    ) -> Result<WorkflowReport, EngineError> {
        let definition = self
            .definition(workflow_name)
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow_name.to_string()))?;
        if options.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let invocation_id = format!("inv-{:08}", INVOCATION_SEQ.fetch_add(1, Ordering::Relaxed));
        let started = Instant::now();
        let budget = options.budget_cap_micros.or(definition.budget_cap_micros);

        tracing::debug!(
            %invocation_id,
            workflow = workflow_name,
            budget_micros = budget,
            "starting invocation"
        );

        let mut values = inputs;
        let mut results: Vec<StageResult> = Vec::with_capacity(definition.stages.len());
        let mut cost_accum: u64 = 0;
        let mut cache_usage = CacheUsage::default();
        let mut outcome = WorkflowOutcome::Completed;
        let mut budget_terminal = false;

        let plan = group_plan(&definition.stages);
        'groups: for group in plan {
            if options.cancel.is_cancelled() {
                for &idx in &group {
                    results.push(StageResult::unstarted(
                        &definition.stages[idx].name,
                        StageStatus::Cancelled,
                        idx,
                    ));
                }
                outcome = WorkflowOutcome::Cancelled;
                continue;
            }
            if outcome != WorkflowOutcome::Completed && !budget_terminal {
                // A required stage already failed: the rest never start.
                for &idx in &group {
                    results.push(StageResult::unstarted(
                        &definition.stages[idx].name,
                        StageStatus::Pending,
                        idx,
                    ));
                }
                continue;
            }

            // Reserve budget in declaration order, render prompts from
            // the pre-group snapshot.
            let optional_keys: HashSet<String> = definition
                .stages
                .iter()
                .take(group[0])
                .map(|s| s.produces.clone())
                .collect();
            let mut reserved: u64 = 0;
            let mut launches = Vec::new();
            for &idx in &group {
                let stage = &definition.stages[idx];
                if budget_terminal {
                    results.push(StageResult::unstarted(&stage.name, StageStatus::SkippedBudget, idx));
                    continue;
                }

                if let Some(missing) = missing_inputs(stage, &values, &optional_keys) {
                    results.push(failed_stage(stage, idx, "missing_input", false, missing));
                    if stage.required {
                        outcome = WorkflowOutcome::Partial {
                            failed: vec![stage.name.clone()],
                        };
                    }
                    continue;
                }
                let prompt = match template::render(&stage.prompt_template, &values, &optional_keys)
                {
                    Ok(prompt) => prompt,
                    Err(missing) => {
                        results.push(failed_stage(
                            stage,
                            idx,
                            "missing_input",
                            false,
                            format!("unresolved placeholders: {}", missing.join(", ")),
                        ));
                        if stage.required {
                            outcome = WorkflowOutcome::Partial {
                                failed: vec![stage.name.clone()],
                            };
                        }
                        continue;
                    }
                };

                let tier = options.initial_tier_override.unwrap_or(stage.default_tier);
                let Some(descriptor) = self.resolve_model(stage, tier, tier == stage.default_tier)
                else {
                    results.push(failed_stage(
                        stage,
                        idx,
                        "no_model_at_tier",
                        false,
                        format!("no model registered at tier {tier}"),
                    ));
                    if stage.required {
                        outcome = WorkflowOutcome::Partial {
                            failed: vec![stage.name.clone()],
                        };
                    }
                    continue;
                };

                let estimate = descriptor.estimate_micros(prompt.len(), stage.max_tokens);
                if let Some(cap) = budget
                    && cost_accum + reserved + estimate > cap
                {
                    tracing::debug!(
                        stage = %stage.name,
                        estimate,
                        remaining = cap.saturating_sub(cost_accum + reserved),
                        "stage skipped: budget"
                    );
                    results.push(StageResult::unstarted(&stage.name, StageStatus::SkippedBudget, idx));
                    if stage.required {
                        outcome = WorkflowOutcome::BudgetExceeded;
                        budget_terminal = true;
                    }
                    continue;
                }
                reserved += estimate;
                launches.push((idx, prompt, tier));
            }

            if let WorkflowOutcome::Partial { .. } = outcome {
                // Drop this group's launches; later groups are Pending.
                // (A required stage in this group failed pre-dispatch.)
                for (idx, _, _) in launches {
                    results.push(StageResult::unstarted(
                        &definition.stages[idx].name,
                        StageStatus::Pending,
                        idx,
                    ));
                }
                continue 'groups;
            }

            // Fan out. Outputs merge only after the whole group settles.
            let stage_deadline = options
                .deadline
                .map(|d| d.saturating_sub(started.elapsed()));
            let options_ref = &options;
            let stage_futures = launches.into_iter().map(|(idx, prompt, tier)| {
                let stage = &definition.stages[idx];
                async move {
                    (
                        idx,
                        self.run_stage(workflow_name, stage, prompt, tier, options_ref, idx, stage_deadline)
                            .await,
                    )
                }
            });
            let mut settled = futures::future::join_all(stage_futures).await;
            settled.sort_by_key(|(idx, _)| *idx);

            let mut failed_required = Vec::new();
            for (idx, (result, usage)) in settled {
                let stage = &definition.stages[idx];
                cost_accum += result.cost_micros;
                cache_usage.hits += usage.hits;
                cache_usage.misses += usage.misses;

                match result.status {
                    StageStatus::Completed => {
                        if let Some(output) = &result.output {
                            values.insert(stage.produces.clone(), output.clone());
                        }
                        self.observe(workflow_name, &result).await;
                    }
                    StageStatus::Cancelled => outcome = WorkflowOutcome::Cancelled,
                    StageStatus::Failed if stage.required => {
                        failed_required.push(stage.name.clone());
                    }
                    _ => {}
                }
                results.push(result);
            }
            if !failed_required.is_empty() && outcome == WorkflowOutcome::Completed {
                outcome = WorkflowOutcome::Partial {
                    failed: failed_required,
                };
            }
        }

        results.sort_by_key(|r| r.group_index);
        let report = WorkflowReport {
            invocation_id,
            workflow: workflow_name.to_string(),
            outcome,
            stages: results,
            cost_micros: cost_accum,
            cache: cache_usage,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::debug!(
            invocation_id = %report.invocation_id,
            outcome = ?report.outcome,
            cost = %micros_to_decimal(report.cost_micros),
            "invocation finished"
        );
        Ok(report)
    }

    /// One stage: dispatch, evaluate escalation, repeat upward.
    #[allow(clippy::too_many_arguments)]
    async fn run_stage(
        &self,
        workflow: &str,
        stage: &StageSpec,
        prompt: String,
        initial_tier: Tier,
        options: &ExecOptions,
        group_index: usize,
        deadline: Option<Duration>,
    ) -> (StageResult, CacheUsage) {
        let started = Instant::now();
        let first_tier = initial_tier;
        let mut tier = initial_tier;
        let mut attempts: u32 = 0;
        let mut escalations: u32 = 0;
        let mut cost_micros: u64 = 0;
        let mut tokens = TokenUsage::default();
        let mut usage = CacheUsage::default();

        loop {
            if options.cancel.is_cancelled() {
                return (
                    partial_result(stage, group_index, StageStatus::Cancelled, first_tier, tier, attempts, cost_micros, tokens, started),
                    usage,
                );
            }

            let pinned_allowed = attempts == 0 && tier == stage.default_tier;
            let Some(descriptor) = self.resolve_model(stage, tier, pinned_allowed) else {
                // Tier exists but no model at it (post-escalation).
                let mut result = partial_result(stage, group_index, StageStatus::Failed, first_tier, tier, attempts, cost_micros, tokens, started);
                result.failure = Some(StageFailure {
                    kind: "no_model_at_tier".into(),
                    retriable: false,
                    detail: format!("no model registered at tier {tier}"),
                });
                return (result, usage);
            };

            let mut request = CompletionRequest::new(descriptor.id.clone(), prompt.clone());
            request.system = Some(stage.role.clone());
            request.temperature = stage.temperature;
            request.max_tokens = stage.max_tokens;
            if descriptor.supports_cache_control {
                request
                    .extra
                    .insert("cache_control".into(), serde_json::json!({"type": "ephemeral"}));
            }

            let spec = CallSpec {
                request,
                tier,
                deadline,
                use_cache: options.enable_cache,
            };
            attempts += 1;

            match self.dispatcher.call(spec, &options.cancel).await {
                Ok(outcome) => {
                    cost_micros += outcome.cost_micros;
                    tokens.input_tokens += outcome.response.usage.input_tokens;
                    tokens.output_tokens += outcome.response.usage.output_tokens;
                    if outcome.cache.hit {
                        usage.hits += 1;
                    } else {
                        usage.misses += 1;
                    }
                    if options.enable_telemetry
                        && let Some(ledger) = &self.ledger
                    {
                        let entry = TelemetryEntry::from_outcome(
                            workflow,
                            &stage.name,
                            tier,
                            &outcome,
                            self.user_id_hash.clone(),
                        );
                        ledger.record(&entry).await;
                    }

                    let parsed: Option<serde_json::Value> =
                        serde_json::from_str(&outcome.response.text).ok();
                    let confidence = parsed
                        .as_ref()
                        .and_then(|v| v.get("confidence"))
                        .and_then(serde_json::Value::as_f64)
                        .map(|c| c as f32);

                    if let Some(policy) = &stage.escalation
                        && escalations < policy.max_escalations
                        && triggered(&policy.trigger, parsed.as_ref(), confidence, &outcome.response.text)
                        && let Some(next) = policy.next_tier.or_else(|| tier.next())
                        && next > tier
                    {
                        tracing::debug!(
                            stage = %stage.name,
                            from = %tier,
                            to = %next,
                            "escalating stage"
                        );
                        escalations += 1;
                        tier = next;
                        continue;
                    }

                    let mut result = partial_result(stage, group_index, StageStatus::Completed, first_tier, tier, attempts, cost_micros, tokens, started);
                    result.output = Some(outcome.response.text);
                    result.confidence = confidence;
                    result.cache = Some(outcome.cache);
                    result.fallback_chain = outcome.fallback_chain;
                    return (result, usage);
                }
                Err(ProviderError::Cancelled) => {
                    return (
                        partial_result(stage, group_index, StageStatus::Cancelled, first_tier, tier, attempts, cost_micros, tokens, started),
                        usage,
                    );
                }
                Err(error) => {
                    if options.enable_telemetry
                        && let Some(ledger) = &self.ledger
                    {
                        let entry = self.failed_call_entry(workflow, stage, tier, started);
                        ledger.record(&entry).await;
                    }
                    let mut result = partial_result(stage, group_index, StageStatus::Failed, first_tier, tier, attempts, cost_micros, tokens, started);
                    result.failure = Some(StageFailure {
                        kind: error_kind(&error),
                        retriable: error.is_retryable(),
                        detail: error.to_string(),
                    });
                    return (result, usage);
                }
            }
        }
    }

    /// Resolve a stage's model at a tier: the pinned model when allowed,
    /// otherwise the cheapest registered model at the tier (ties broken
    /// by id for determinism).
    fn resolve_model(&self, stage: &StageSpec, tier: Tier, pinned_allowed: bool) -> Option<ModelDescriptor> {
        let registry = self.dispatcher.registry();
        if pinned_allowed
            && let Some(pinned) = &stage.model
            && let Some(descriptor) = registry.get(pinned)
        {
            return Some(descriptor.clone());
        }
        registry
            .at_tier(tier)
            .min_by(|a, b| {
                let price =
                    |m: &ModelDescriptor| m.input_cost_per_million + m.output_cost_per_million;
                price(a).cmp(&price(b)).then_with(|| a.id.cmp(&b.id))
            })
            .cloned()
    }

    /// Ledger line for a failed call: zero cost, zero tokens.
    fn failed_call_entry(
        &self,
        workflow: &str,
        stage: &StageSpec,
        tier: Tier,
        started: Instant,
    ) -> TelemetryEntry {
        let registry = self.dispatcher.registry();
        let (model_id, provider) = self
            .resolve_model(stage, tier, true)
            .map(|d| (d.id, d.provider))
            .or_else(|| {
                stage
                    .model
                    .as_ref()
                    .and_then(|m| registry.get(m))
                    .map(|d| (d.id.clone(), d.provider.clone()))
            })
            .unwrap_or_else(|| ("unknown".into(), "unknown".into()));
        TelemetryEntry {
            schema_version: SCHEMA_VERSION.to_string(),
            ts_utc: chrono::Utc::now(),
            workflow: workflow.to_string(),
            stage: stage.name.clone(),
            tier,
            model_id,
            provider,
            cost: micros_to_decimal(0),
            tokens: TokenUsage::default(),
            cache: CacheInfo::miss(),
            duration_ms: started.elapsed().as_millis() as u64,
            user_id: self.user_id_hash.clone(),
        }
    }

    /// Report a completed stage to the pattern sink. Sink failures are
    /// logged and swallowed.
    async fn observe(&self, workflow: &str, result: &StageResult) {
        let observation = PatternObservation {
            workflow: workflow.to_string(),
            stage: result.name.clone(),
            tier_used: result.tier_used.unwrap_or(Tier::Cheap),
            escalated_from: result.escalated_from,
            cache: result.cache.unwrap_or(CacheInfo::miss()),
            cost_micros: result.cost_micros,
            duration_ms: result.duration_ms,
            confidence: result.confidence,
        };
        if let Err(error) = self.sink.on_stage_complete(&observation).await {
            tracing::debug!(%error, stage = %result.name, "pattern sink failed");
        }
    }
}

/// Consecutive stages sharing a parallel group id collapse into one
/// fan-out unit; everything else runs alone.
fn group_plan(stages: &[StageSpec]) -> Vec<Vec<usize>> {
    let mut plan: Vec<Vec<usize>> = Vec::new();
    for (idx, stage) in stages.iter().enumerate() {
        let joins_previous = match (&stage.parallel_group, plan.last()) {
            (Some(group), Some(last)) => {
                last.last().is_some_and(|&prev| stages[prev].parallel_group.as_ref() == Some(group))
            }
            _ => false,
        };
        if joins_previous {
            plan.last_mut().expect("non-empty plan").push(idx);
        } else {
            plan.push(vec![idx]);
        }
    }
    plan
}

/// Declared inputs missing from both the value map and the
/// earlier-output set.
fn missing_inputs(
    stage: &StageSpec,
    values: &HashMap<String, String>,
    optional_keys: &HashSet<String>,
) -> Option<String> {
    let missing: Vec<&str> = stage
        .required_inputs
        .iter()
        .filter(|k| !values.contains_key(*k) && !optional_keys.contains(*k))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(format!("missing inputs: {}", missing.join(", ")))
    }
}

fn failed_stage(
    stage: &StageSpec,
    group_index: usize,
    kind: &str,
    retriable: bool,
    detail: String,
) -> StageResult {
    let mut result = StageResult::unstarted(&stage.name, StageStatus::Failed, group_index);
    result.failure = Some(StageFailure {
        kind: kind.into(),
        retriable,
        detail,
    });
    result
}

#[allow(clippy::too_many_arguments)]
fn partial_result(
    stage: &StageSpec,
    group_index: usize,
    status: StageStatus,
    first_tier: Tier,
    tier: Tier,
    attempts: u32,
    cost_micros: u64,
    tokens: TokenUsage,
    started: Instant,
) -> StageResult {
    StageResult {
        name: stage.name.clone(),
        status,
        output: None,
        confidence: None,
        tier_used: (attempts > 0).then_some(tier),
        escalated_from: (tier > first_tier).then_some(first_tier),
        attempts,
        cost_micros,
        tokens,
        cache: None,
        fallback_chain: Vec::new(),
        group_index,
        failure: None,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

/// Whether an escalation trigger fires for a completed attempt.
fn triggered(
    trigger: &EscalationTrigger,
    parsed: Option<&serde_json::Value>,
    confidence: Option<f32>,
    text: &str,
) -> bool {
    match trigger {
        EscalationTrigger::LowConfidence { below } => {
            confidence.is_some_and(|c| c < *below)
        }
        EscalationTrigger::ParseFailure => parsed.is_none(),
        EscalationTrigger::ExplicitSignal => {
            let flagged = parsed
                .and_then(|v| v.get("escalate"))
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            flagged || text.contains("ESCALATE")
        }
    }
}

/// Normalize a provider error into a report-stable kind string.
fn error_kind(error: &ProviderError) -> String {
    match error {
        ProviderError::Network(_) => "network",
        ProviderError::RateLimit { .. } => "rate_limit",
        ProviderError::Timeout(_) => "timeout",
        ProviderError::ServiceUnavailable(_) => "service_unavailable",
        ProviderError::Authentication(_) => "authentication",
        ProviderError::InvalidRequest(_) => "invalid_request",
        ProviderError::ModelNotFound(_) => "model_not_found",
        ProviderError::ContentPolicy(_) => "content_policy",
        ProviderError::CircuitOpen { .. } => "circuit_open",
        ProviderError::AllProvidersFailed { .. } => "all_providers_failed",
        ProviderError::Cancelled => "cancelled",
        _ => "other",
    }
    .to_string()
}
