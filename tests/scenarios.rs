//! End-to-end scenarios against the assembled runtime with mock
//! providers: cache short-circuiting, coalescing, circuit breaking with
//! fallback, budget caps, escalation, and savings analytics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use maestro_cache::CacheConfig;
use maestro_dispatch::CircuitState;
use maestro_engine::{ExecOptions, StageStatus, WorkflowOutcome};
use maestro_runtime::{MaestroConfig, Runtime};
use maestro_telemetry::{hash_user_id, TelemetryEntry, SCHEMA_VERSION};
use maestro_types::test_utils::MockProvider;
use maestro_types::{
    micros_to_decimal, CacheInfo, CompletionRequest, CompletionResponse, Provider, ProviderError,
    Tier, TokenUsage,
};

const BASE_CONFIG: &str = r#"
providers:
  mockai:
    api_key_env: MOCKAI_API_KEY
models:
  m-cheap:
    provider: mockai
    tier: cheap
    input_cost_per_million: 1
    output_cost_per_million: 1
    context_window: 200000
  m-capable:
    provider: mockai
    tier: capable
    input_cost_per_million: 3
    output_cost_per_million: 15
    context_window: 200000
  m-premium:
    provider: mockai
    tier: premium
    input_cost_per_million: 15
    output_cost_per_million: 75
    context_window: 200000
workflows:
  echo:
    stages:
      - name: answer
        role: You echo.
        tier: cheap
        prompt: "{text}"
        inputs: [text]
        temperature: 0.2
        max_tokens: 64
"#;

fn inputs(text: &str) -> HashMap<String, String> {
    [("text".to_string(), text.to_string())].into()
}

fn runtime_with<P: Provider + 'static>(provider: P) -> (tempfile::TempDir, Runtime) {
    let config = MaestroConfig::from_yaml(BASE_CONFIG).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Runtime::builder(config)
        .data_dir(tmp.path())
        .provider("mockai", provider)
        .build()
        .unwrap();
    (tmp, runtime)
}

/// Wraps a provider with a small delay so concurrent invocations are
/// genuinely in flight together.
struct Delayed<P>(Arc<P>);

impl<P: Provider + 'static> Provider for Delayed<P> {
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> impl std::future::Future<Output = Result<CompletionResponse, ProviderError>> + Send {
        let inner = Arc::clone(&self.0);
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            inner.complete(request).await
        }
    }
}

// --- S1: cache warm short-circuit ---

#[tokio::test]
async fn s1_warm_cache_short_circuits_the_second_invocation() {
    let provider = Arc::new(MockProvider::returning("R"));
    let (_tmp, runtime) = runtime_with(Arc::clone(&provider));

    let first = runtime
        .run("echo", inputs("hello"), ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(first.outcome, WorkflowOutcome::Completed);
    assert_eq!(first.output("answer"), Some("R"));
    assert!(first.cost_micros > 0);
    assert_eq!(first.cache.misses, 1);

    let second = runtime
        .run("echo", inputs("hello"), ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(second.output("answer"), Some("R"));
    assert_eq!(second.cost_micros, 0);
    assert_eq!(second.cache.hits, 1);
    assert_eq!(
        second.stage("answer").unwrap().cache,
        Some(CacheInfo::exact_hit())
    );
    assert_eq!(provider.call_count(), 1);

    // Two ledger lines; the second is a zero-cost hit.
    let mut entries = runtime.ledger().recent(10).await.unwrap();
    entries.reverse();
    assert_eq!(entries.len(), 2);
    assert!(!entries[0].cache.hit);
    assert!(entries[1].cache.hit);
    assert_eq!(entries[1].cost_micros(), 0);
}

// --- S2: coalescing ---

#[tokio::test]
async fn s2_ten_concurrent_identical_invocations_issue_one_provider_call() {
    let counter = Arc::new(MockProvider::returning("R"));
    let (_tmp, runtime) = runtime_with(Delayed(Arc::clone(&counter)));
    let runtime = Arc::new(runtime);

    let calls = (0..10).map(|_| {
        let runtime = Arc::clone(&runtime);
        async move {
            runtime
                .run("echo", inputs("same"), ExecOptions::default())
                .await
                .unwrap()
        }
    });
    let reports = futures::future::join_all(calls).await;

    assert_eq!(counter.call_count(), 1);
    assert!(reports.iter().all(|r| r.output("answer") == Some("R")));

    let entries = runtime.ledger().recent(100).await.unwrap();
    assert_eq!(entries.len(), 10);
    let hits = entries.iter().filter(|e| e.cache.hit).count();
    assert_eq!(hits, 9);
    assert_eq!(entries.iter().filter(|e| !e.cache.hit).count(), 1);
    // Invariant: every hit entry is zero-cost, every entry well-formed.
    for entry in &entries {
        assert_eq!(entry.schema_version, SCHEMA_VERSION);
        assert!(!entry.workflow.is_empty());
        if entry.cache.hit {
            assert_eq!(entry.cost_micros(), 0);
        }
    }
}

// --- S3: circuit opens, fallback succeeds ---

const FALLBACK_CONFIG: &str = r#"
providers:
  p1:
    api_key_env: P1_API_KEY
    fallback_chain: [m-p2-capable]
  p2:
    api_key_env: P2_API_KEY
models:
  m-p1-capable:
    provider: p1
    tier: capable
    input_cost_per_million: 3
    output_cost_per_million: 15
    context_window: 200000
  m-p2-capable:
    provider: p2
    tier: capable
    input_cost_per_million: 3
    output_cost_per_million: 15
    context_window: 200000
workflows:
  review:
    stages:
      - name: review
        role: You review.
        tier: capable
        model: m-p1-capable
        prompt: "{text}"
        inputs: [text]
        max_tokens: 64
resilience:
  retry_initial_ms: 1
  retry_max_ms: 4
  retry_max_attempts: 1
  circuit_failures_open: 5
  circuit_cooldown_ms: 30000
  half_open_probes: 2
"#;

#[tokio::test]
async fn s3_circuit_opens_and_fallback_serves() {
    let p1 = Arc::new(MockProvider::echo());
    p1.fail_next(64);
    let p2 = Arc::new(MockProvider::returning("from p2"));

    let config = MaestroConfig::from_yaml(FALLBACK_CONFIG).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Runtime::builder(config)
        .data_dir(tmp.path())
        .provider("p1", Arc::clone(&p1))
        .provider("p2", Arc::clone(&p2))
        .build()
        .unwrap();

    // Five invocations: p1 fails once each (one attempt per model),
    // fallback serves, and the fifth failure opens p1's circuit.
    // Distinct inputs keep the cache out of the picture.
    for i in 0..5 {
        let report = runtime
            .run("review", inputs(&format!("change {i}")), ExecOptions::default())
            .await
            .unwrap();
        let stage = report.stage("review").unwrap();
        assert_eq!(stage.status, StageStatus::Completed);
        assert_eq!(
            stage.fallback_chain,
            vec!["m-p1-capable".to_string(), "m-p2-capable".to_string()]
        );
        assert_eq!(stage.output.as_deref(), Some("from p2"));
    }
    assert_eq!(p1.call_count(), 5);

    let breaker = runtime
        .engine()
        .dispatcher()
        .dispatcher()
        .endpoint("p1")
        .unwrap()
        .breaker();
    assert_eq!(breaker.state(), CircuitState::Open);

    // Sixth invocation inside the cooldown: p1 is skipped entirely.
    let report = runtime
        .run("review", inputs("change 6"), ExecOptions::default())
        .await
        .unwrap();
    let stage = report.stage("review").unwrap();
    assert_eq!(stage.status, StageStatus::Completed);
    assert_eq!(
        stage.fallback_chain,
        vec!["m-p1-capable".to_string(), "m-p2-capable".to_string()]
    );
    assert_eq!(p1.call_count(), 5);
    assert_eq!(p2.call_count(), 6);
}

// --- S4: budget cap with required and optional stages ---

const BUDGET_CONFIG: &str = r#"
providers:
  mockai:
    api_key_env: MOCKAI_API_KEY
models:
  m-cheap:
    provider: mockai
    tier: cheap
    input_cost_per_million: 1
    output_cost_per_million: 1
    context_window: 200000
  m-premium:
    provider: mockai
    tier: premium
    input_cost_per_million: 15
    output_cost_per_million: 75
    context_window: 200000
workflows:
  capped:
    stages:
      - name: a
        tier: cheap
        prompt: "run {text}"
        inputs: [text]
        max_tokens: 64
      - name: b
        tier: premium
        required: false
        prompt: "deep {text}"
        max_tokens: 64
      - name: c
        tier: cheap
        prompt: "wrap {a}"
        max_tokens: 64
"#;

#[tokio::test]
async fn s4_budget_skips_the_optional_stage_only() {
    let config = MaestroConfig::from_yaml(BUDGET_CONFIG).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Runtime::builder(config)
        .data_dir(tmp.path())
        .provider("mockai", MockProvider::echo())
        .build()
        .unwrap();

    let options = ExecOptions {
        budget_cap_micros: Some(300),
        ..ExecOptions::default()
    };
    let report = runtime.run("capped", inputs("x"), options).await.unwrap();

    assert_eq!(report.outcome, WorkflowOutcome::Completed);
    assert_eq!(report.stage("a").unwrap().status, StageStatus::Completed);
    assert_eq!(report.stage("b").unwrap().status, StageStatus::SkippedBudget);
    assert_eq!(report.stage("c").unwrap().status, StageStatus::Completed);
    assert!(report.cost_micros <= 300);
}

// --- S5: escalation on low confidence ---

const ESCALATION_CONFIG: &str = r#"
providers:
  mockai:
    api_key_env: MOCKAI_API_KEY
models:
  m-capable:
    provider: mockai
    tier: capable
    input_cost_per_million: 3
    output_cost_per_million: 15
    context_window: 200000
  m-premium:
    provider: mockai
    tier: premium
    input_cost_per_million: 15
    output_cost_per_million: 75
    context_window: 200000
workflows:
  review:
    stages:
      - name: review
        tier: capable
        prompt: "review {text}"
        inputs: [text]
        max_tokens: 64
        escalation:
          trigger: low_confidence
          below: 0.6
          max_escalations: 1
"#;

#[tokio::test]
async fn s5_low_confidence_escalates_to_premium() {
    let provider = MockProvider::echo();
    provider.push_ok(CompletionResponse {
        text: r#"{"confidence": 0.4}"#.into(),
        model: "m-capable".into(),
        usage: TokenUsage::new(100, 50),
    });
    provider.push_ok(CompletionResponse {
        text: r#"{"confidence": 0.9}"#.into(),
        model: "m-premium".into(),
        usage: TokenUsage::new(100, 50),
    });

    let config = MaestroConfig::from_yaml(ESCALATION_CONFIG).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Runtime::builder(config)
        .data_dir(tmp.path())
        .provider("mockai", provider)
        .build()
        .unwrap();

    let report = runtime
        .run("review", inputs("the diff"), ExecOptions::default())
        .await
        .unwrap();
    let stage = report.stage("review").unwrap();
    assert_eq!(stage.status, StageStatus::Completed);
    assert_eq!(stage.tier_used, Some(Tier::Premium));
    assert_eq!(stage.escalated_from, Some(Tier::Capable));
    assert_eq!(stage.confidence, Some(0.9));
    assert_eq!(stage.attempts, 2);

    // Exactly two ledger lines for the stage, tiers strictly ascending.
    let mut entries = runtime.ledger().recent(10).await.unwrap();
    entries.reverse();
    let review_entries: Vec<&TelemetryEntry> =
        entries.iter().filter(|e| e.stage == "review").collect();
    assert_eq!(review_entries.len(), 2);
    assert_eq!(review_entries[0].tier, Tier::Capable);
    assert_eq!(review_entries[1].tier, Tier::Premium);
    assert!(review_entries[0].tier < review_entries[1].tier);
}

// --- S6: savings calculation ---

#[tokio::test]
async fn s6_savings_match_the_closed_form() {
    let (_tmp, runtime) = runtime_with(MockProvider::echo());
    let registry = Arc::clone(runtime.registry());
    let premium = registry.premium_reference().unwrap().clone();

    // 100 calls: 40 CHEAP, 40 CAPABLE, 20 PREMIUM, fixed token counts.
    let tokens = TokenUsage::new(1_000, 500);
    let mut expected_actual: u64 = 0;
    for i in 0..100u32 {
        let (tier, model_id) = match i % 5 {
            0 | 1 => (Tier::Cheap, "m-cheap"),
            2 | 3 => (Tier::Capable, "m-capable"),
            _ => (Tier::Premium, "m-premium"),
        };
        let cost = registry.get(model_id).unwrap().cost_micros(&tokens);
        expected_actual += cost;
        let entry = TelemetryEntry {
            schema_version: SCHEMA_VERSION.to_string(),
            ts_utc: chrono::Utc::now(),
            workflow: "mixed".into(),
            stage: "s".into(),
            tier,
            model_id: model_id.into(),
            provider: "mockai".into(),
            cost: micros_to_decimal(cost),
            tokens,
            cache: CacheInfo::miss(),
            duration_ms: 10,
            user_id: Some(hash_user_id("dev")),
        };
        runtime.ledger().record(&entry).await;
    }

    let savings = runtime.savings(Duration::from_secs(30 * 24 * 60 * 60)).await.unwrap();
    let expected_baseline = 100 * premium.cost_micros(&tokens);
    assert_eq!(savings.baseline_cost, micros_to_decimal(expected_baseline));
    assert_eq!(savings.actual_cost, micros_to_decimal(expected_actual));
    assert_eq!(
        savings.absolute_savings,
        micros_to_decimal(expected_baseline - expected_actual)
    );
    let expected_percent =
        (expected_baseline - expected_actual) as f64 / expected_baseline as f64;
    assert!((savings.percent_savings - expected_percent).abs() < 1e-9);
}

// --- Boundary: routing failures never guess ---

#[tokio::test]
async fn empty_routing_text_fails() {
    let (_tmp, runtime) = runtime_with(MockProvider::echo());
    let error = runtime
        .route("", &maestro_router::RouteHints::default(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        maestro_types::RouteError::RoutingFailure { .. }
    ));
}

// --- Boundary: cache disabled per invocation ---

#[tokio::test]
async fn no_cache_option_always_dispatches() {
    let provider = Arc::new(MockProvider::returning("R"));
    let (_tmp, runtime) = runtime_with(Arc::clone(&provider));

    let options = || ExecOptions {
        enable_cache: false,
        ..ExecOptions::default()
    };
    runtime.run("echo", inputs("hello"), options()).await.unwrap();
    runtime.run("echo", inputs("hello"), options()).await.unwrap();
    assert_eq!(provider.call_count(), 2);
}

#[test]
fn cache_defaults_match_the_contract() {
    let config = CacheConfig::default();
    assert_eq!(config.max_bytes, 256 * 1024 * 1024);
    assert_eq!(config.semantic_threshold, 0.92);
    assert_eq!(
        config.semantic_age_limit,
        Duration::from_secs(7 * 24 * 60 * 60)
    );
}
