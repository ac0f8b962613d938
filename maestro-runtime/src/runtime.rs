//! The long-lived runtime value and its builder.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use maestro_cache::{BoxedEmbedder, CacheConfig, CacheMode, CacheSnapshot, CachedDispatcher};
use maestro_dispatch::{
    BoxedProvider, CircuitBreakerConfig, Dispatcher, EndpointConfig, ProviderEndpoint, RetryPolicy,
};
use maestro_engine::{builtin_workflows, ExecOptions, WorkflowEngine, WorkflowReport};
use maestro_provider_http::HttpProvider;
use maestro_router::{RouteHints, RoutingConfig, RoutingDecision, RoutingTables, SmartRouter};
use maestro_telemetry::{LedgerConfig, Savings, Stats, UsageLedger};
use maestro_types::{
    ConfigError, EngineError, ModelRegistry, PatternSink, Provider, RouteError, TelemetryError,
    Tier,
};

use crate::config::MaestroConfig;

/// Everything a maestro process needs, explicitly constructed and
/// owned in one place.
pub struct Runtime {
    registry: Arc<ModelRegistry>,
    dispatcher: Arc<CachedDispatcher>,
    ledger: Arc<UsageLedger>,
    router: SmartRouter,
    engine: WorkflowEngine,
}

/// Builder for [`Runtime`]. Providers may be injected (tests, local
/// backends); anything not injected is built as an [`HttpProvider`]
/// from its configured `api_key_env`.
pub struct RuntimeBuilder {
    config: MaestroConfig,
    data_dir: Option<PathBuf>,
    providers: HashMap<String, BoxedProvider>,
    embedder: Option<BoxedEmbedder>,
    sink: Option<Arc<dyn PatternSink>>,
    register_builtins: bool,
}

impl Runtime {
    /// Start building a runtime from a parsed configuration.
    #[must_use]
    pub fn builder(config: MaestroConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            data_dir: None,
            providers: HashMap::new(),
            embedder: None,
            sink: None,
            register_builtins: true,
        }
    }

    /// Execute a workflow.
    ///
    /// # Errors
    ///
    /// See [`WorkflowEngine::execute`].
    pub async fn run(
        &self,
        workflow: &str,
        inputs: HashMap<String, String>,
        options: ExecOptions,
    ) -> Result<WorkflowReport, EngineError> {
        self.engine.execute(workflow, inputs, options).await
    }

    /// Route free text to a workflow.
    ///
    /// # Errors
    ///
    /// See [`SmartRouter::route`].
    pub async fn route(
        &self,
        text: &str,
        hints: &RouteHints,
        cancel: &CancellationToken,
    ) -> Result<RoutingDecision, RouteError> {
        self.router.route(text, hints, cancel).await
    }

    /// The workflow engine.
    #[must_use]
    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// The smart router.
    #[must_use]
    pub fn router(&self) -> &SmartRouter {
        &self.router
    }

    /// The usage ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    /// The model registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Usage stats over a trailing window.
    ///
    /// # Errors
    ///
    /// Ledger I/O failures.
    pub async fn stats(&self, window: Duration) -> Result<Stats, TelemetryError> {
        self.ledger.stats(window).await
    }

    /// Savings versus the all-PREMIUM baseline.
    ///
    /// # Errors
    ///
    /// Ledger I/O failures.
    pub async fn savings(&self, window: Duration) -> Result<Savings, TelemetryError> {
        self.ledger.savings(window, &self.registry).await
    }

    /// Current cache counters.
    #[must_use]
    pub fn cache_snapshot(&self) -> CacheSnapshot {
        self.dispatcher.snapshot()
    }

    /// Drop every cached response.
    pub fn reset_cache(&self) {
        self.dispatcher.reset();
    }

    /// Delete all telemetry files. Requires explicit confirmation.
    ///
    /// # Errors
    ///
    /// [`TelemetryError::ResetNotConfirmed`] without the flag.
    pub async fn reset_telemetry(&self, confirm: bool) -> Result<(), TelemetryError> {
        self.ledger.reset(confirm).await
    }
}

impl RuntimeBuilder {
    /// Override the data directory (default: `MAESTRO_DATA_DIR`, then
    /// `DATA_DIR`, then `./.maestro`).
    #[must_use]
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Inject a provider for a provider id instead of building an HTTP
    /// client for it.
    #[must_use]
    pub fn provider<P: Provider + 'static>(mut self, id: impl Into<String>, provider: P) -> Self {
        self.providers.insert(id.into(), BoxedProvider::new(provider));
        self
    }

    /// Inject the embedding provider for hybrid cache mode.
    #[must_use]
    pub fn embedder(mut self, embedder: BoxedEmbedder) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Replace the default no-op pattern sink.
    #[must_use]
    pub fn pattern_sink(mut self, sink: Arc<dyn PatternSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Skip registering the built-in workflow set.
    #[must_use]
    pub fn without_builtin_workflows(mut self) -> Self {
        self.register_builtins = false;
        self
    }

    /// Wire everything up.
    ///
    /// # Errors
    ///
    /// `ConfigError` on invalid configuration, missing API key
    /// environment variables, or workflow definitions that fail
    /// validation.
    pub fn build(mut self) -> Result<Runtime, ConfigError> {
        let config = std::mem::take(&mut self.config);

        let registry = Arc::new(ModelRegistry::new(config.build_registry()?)?);

        let retry = RetryPolicy {
            initial_delay: Duration::from_millis(config.resilience.retry_initial_ms),
            multiplier: 2.0,
            max_delay: Duration::from_millis(config.resilience.retry_max_ms),
            max_attempts: config.resilience.retry_max_attempts,
        };
        let breaker = CircuitBreakerConfig {
            failures_to_open: config.resilience.circuit_failures_open,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_millis(config.resilience.circuit_cooldown_ms),
            half_open_probes: config.resilience.half_open_probes,
        };

        let mut dispatcher = Dispatcher::new(Arc::clone(&registry)).with_retry(retry);
        let mut provider_ids: Vec<String> = config.providers.keys().cloned().collect();
        for injected in self.providers.keys() {
            if !config.providers.contains_key(injected) {
                provider_ids.push(injected.clone());
            }
        }
        provider_ids.sort();
        for id in provider_ids {
            let endpoint_config = EndpointConfig {
                concurrency: config
                    .providers
                    .get(&id)
                    .and_then(|p| p.concurrency)
                    .unwrap_or(8),
                default_timeout: Duration::from_secs(60),
                breaker: breaker.clone(),
            };
            let endpoint = if let Some(provider) = self.providers.remove(&id) {
                ProviderEndpoint::new(&id, provider, endpoint_config)
            } else {
                let provider_config = &config.providers[&id];
                let api_key = std::env::var(&provider_config.api_key_env)
                    .map_err(|_| ConfigError::MissingEnv(provider_config.api_key_env.clone()))?;
                let mut http = HttpProvider::new(api_key);
                if let Some(endpoint_url) = &provider_config.endpoint {
                    http = http.base_url(endpoint_url.clone());
                }
                ProviderEndpoint::new(&id, http, endpoint_config)
            };
            dispatcher = dispatcher.with_endpoint(endpoint);
        }

        let cache_mode = match config.cache.mode.as_str() {
            "hash" => CacheMode::Hash,
            "hybrid" => CacheMode::Hybrid,
            other => {
                return Err(ConfigError::Invalid(format!("unknown cache mode: {other}")));
            }
        };
        let cache_config = CacheConfig {
            enabled: config.cache.enabled,
            mode: cache_mode,
            max_bytes: config.cache.max_bytes,
            semantic_threshold: config.cache.semantic_threshold,
            semantic_age_limit: Duration::from_secs(
                u64::from(config.cache.semantic_age_limit_days) * 24 * 60 * 60,
            ),
        };
        let mut cached = CachedDispatcher::new(Arc::new(dispatcher), cache_config);
        if let Some(embedder) = self.embedder.take() {
            cached = cached.with_embedder(embedder);
        }
        let cached = Arc::new(cached);

        let data_dir = self
            .data_dir
            .take()
            .or_else(|| std::env::var_os("MAESTRO_DATA_DIR").map(PathBuf::from))
            .or_else(|| std::env::var_os("DATA_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./.maestro"));
        let ledger = Arc::new(UsageLedger::new(LedgerConfig {
            enabled: config.telemetry.enabled,
            dir: config
                .telemetry
                .dir
                .clone()
                .unwrap_or_else(|| data_dir.join("telemetry")),
            max_file_bytes: config.telemetry.max_file_bytes,
            retention_days: config.telemetry.retention_days,
        }));

        let mut engine = WorkflowEngine::new(Arc::clone(&cached)).with_ledger(Arc::clone(&ledger));
        if let Some(sink) = self.sink.take() {
            engine = engine.with_pattern_sink(sink);
        }
        if let Some(user_id) = &config.user_id {
            engine = engine.with_user_id(user_id);
        }

        let mut definitions = Vec::new();
        if self.register_builtins {
            definitions.extend(builtin_workflows());
        }
        definitions.extend(config.build_workflows()?);
        for definition in definitions {
            engine
                .register_workflow(definition)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }

        let routing = RoutingConfig {
            hard_threshold: config.routing.hard_threshold,
            ambiguity_band: config.routing.ambiguity_band,
            min_threshold: config.routing.min_threshold,
        };
        let mut router = SmartRouter::new(routing, RoutingTables::builtin());
        for name in engine.list_workflows() {
            if let Some(definition) = engine.definition(&name)
                && let Some(first) = definition.stages.first()
            {
                router.set_workflow_tier(&name, first.default_tier);
            }
        }
        let classifier_model = registry
            .at_tier(Tier::Cheap)
            .min_by(|a, b| a.id.cmp(&b.id))
            .map(|m| m.id.clone());
        if let Some(model) = classifier_model {
            router = router.with_classifier(Arc::clone(&cached), model);
        }

        tracing::debug!(
            models = registry.len(),
            workflows = engine.list_workflows().len(),
            "runtime assembled"
        );
        Ok(Runtime {
            registry,
            dispatcher: cached,
            ledger,
            router,
            engine,
        })
    }
}
