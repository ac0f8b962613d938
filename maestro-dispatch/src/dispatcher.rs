//! The dispatch pipeline: chain walk, retry loop, breaker bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use maestro_types::{
    CacheInfo, CallOutcome, CompletionRequest, CompletionResponse, ModelDescriptor, ModelRegistry,
    ProviderError,
};

use crate::endpoint::ProviderEndpoint;
use crate::retry::RetryPolicy;

/// Resilient provider client.
///
/// Owns the endpoint table and the model registry reference; stateless
/// otherwise, so it is cheap to share behind an `Arc`.
pub struct Dispatcher {
    registry: Arc<ModelRegistry>,
    endpoints: HashMap<String, Arc<ProviderEndpoint>>,
    retry: RetryPolicy,
}

impl Dispatcher {
    /// Create a dispatcher over the given registry with default retry
    /// policy and no endpoints.
    #[must_use]
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            endpoints: HashMap::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Register a provider endpoint. Later registrations under the same
    /// id replace earlier ones; done once at startup.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: ProviderEndpoint) -> Self {
        self.endpoints.insert(endpoint.id.clone(), Arc::new(endpoint));
        self
    }

    /// Look up an endpoint by provider id.
    #[must_use]
    pub fn endpoint(&self, id: &str) -> Option<&Arc<ProviderEndpoint>> {
        self.endpoints.get(id)
    }

    /// The model registry this dispatcher resolves against.
    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Execute one prompt against `request.model`, with retry, circuit
    /// breaking, timeout, and fallback.
    ///
    /// # Errors
    ///
    /// Permanent provider errors surface immediately. Transient failures
    /// are retried, then the fallback chain is walked; full exhaustion
    /// returns [`ProviderError::AllProvidersFailed`]. Cancellation
    /// returns [`ProviderError::Cancelled`].
    pub async fn call(
        &self,
        request: CompletionRequest,
        caller_deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<CallOutcome, ProviderError> {
        let primary = self
            .registry
            .get(&request.model)
            .ok_or_else(|| ProviderError::ModelNotFound(request.model.clone()))?;

        let mut chain = vec![primary.id.clone()];
        chain.extend(primary.fallback_chain.iter().cloned());

        let mut attempted: Vec<String> = Vec::with_capacity(chain.len());
        for model_id in chain {
            let Some(descriptor) = self.registry.get(&model_id) else {
                tracing::debug!(model = %model_id, "skipping unregistered fallback model");
                continue;
            };
            let Some(endpoint) = self.endpoints.get(&descriptor.provider) else {
                if attempted.is_empty() {
                    return Err(ProviderError::InvalidRequest(format!(
                        "no endpoint registered for provider {}",
                        descriptor.provider
                    )));
                }
                tracing::debug!(provider = %descriptor.provider, "skipping model without endpoint");
                continue;
            };

            attempted.push(model_id.clone());
            match self
                .call_one_model(endpoint, descriptor, &request, caller_deadline, cancel)
                .await
            {
                Ok((response, duration)) => {
                    let cost_micros = descriptor.cost_micros(&response.usage);
                    return Ok(CallOutcome {
                        response,
                        provider: descriptor.provider.clone(),
                        model_id,
                        cost_micros,
                        duration,
                        fallback_chain: attempted,
                        cache: CacheInfo::miss(),
                    });
                }
                Err(error) if error.triggers_fallback() => {
                    tracing::debug!(model = %model_id, %error, "falling back");
                }
                Err(error) => return Err(error),
            }
        }

        Err(ProviderError::AllProvidersFailed { attempted })
    }

    /// Retry loop against a single model. Breaker admission, semaphore,
    /// and timeout are applied per attempt; the breaker sees one
    /// success/failure per attempt.
    async fn call_one_model(
        &self,
        endpoint: &ProviderEndpoint,
        descriptor: &ModelDescriptor,
        request: &CompletionRequest,
        caller_deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(CompletionResponse, Duration), ProviderError> {
        let attempt_timeout = match caller_deadline {
            Some(deadline) => deadline.min(endpoint.default_timeout),
            None => endpoint.default_timeout,
        };

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            if !endpoint.breaker.try_admit() {
                return Err(ProviderError::CircuitOpen {
                    provider: endpoint.id.clone(),
                });
            }

            let permit = tokio::select! {
                () = cancel.cancelled() => return Err(ProviderError::Cancelled),
                permit = endpoint.semaphore.acquire() => permit
                    .map_err(|_| ProviderError::ServiceUnavailable("provider semaphore closed".into()))?,
            };

            let mut attempt_request = request.clone();
            attempt_request.model = descriptor.id.clone();

            let started = Instant::now();
            // Biased toward the result: work that already finished is
            // delivered (and recorded) even when cancellation lands in
            // the same instant.
            let result = tokio::select! {
                biased;
                result = tokio::time::timeout(attempt_timeout, endpoint.provider.complete(attempt_request)) => result,
                () = cancel.cancelled() => {
                    drop(permit);
                    return Err(ProviderError::Cancelled);
                }
            };
            drop(permit);

            let error = match result {
                Ok(Ok(response)) => {
                    endpoint.breaker.record_success();
                    return Ok((response, started.elapsed()));
                }
                Ok(Err(error)) if error.is_retryable() => {
                    endpoint.breaker.record_failure();
                    error
                }
                Ok(Err(error)) => return Err(error),
                Err(_elapsed) => {
                    endpoint.breaker.record_failure();
                    ProviderError::Timeout(attempt_timeout)
                }
            };

            attempt += 1;
            if attempt >= self.retry.max_attempts {
                return Err(error);
            }

            let hint = match &error {
                ProviderError::RateLimit { retry_after } => *retry_after,
                _ => None,
            };
            let delay = self.retry.delay_for(attempt - 1, hint);
            tracing::debug!(
                model = %descriptor.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                %error,
                "retrying after transient error"
            );
            tokio::select! {
                () = cancel.cancelled() => return Err(ProviderError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitState;
    use crate::endpoint::EndpointConfig;
    use maestro_types::test_utils::MockProvider;
    use maestro_types::{Provider, Tier, TokenUsage};
    use rust_decimal::Decimal;

    fn model(id: &str, provider: &str, fallback: &[&str]) -> ModelDescriptor {
        ModelDescriptor {
            id: id.into(),
            provider: provider.into(),
            tier: Tier::Capable,
            input_cost_per_million: Decimal::from(3),
            output_cost_per_million: Decimal::from(15),
            context_window: 200_000,
            supports_cache_control: false,
            fallback_chain: fallback.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    fn registry(models: Vec<ModelDescriptor>) -> Arc<ModelRegistry> {
        Arc::new(ModelRegistry::new(models).unwrap())
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn success_records_cost_and_chain() {
        let registry = registry(vec![model("m1", "p1", &[])]);
        let dispatcher = Dispatcher::new(registry)
            .with_endpoint(ProviderEndpoint::new(
                "p1",
                MockProvider::with_fn(|req| {
                    Ok(CompletionResponse {
                        text: "answer".into(),
                        model: req.model.clone(),
                        usage: TokenUsage::new(1_000_000, 0),
                    })
                }),
                EndpointConfig::default(),
            ));

        let outcome = dispatcher
            .call(CompletionRequest::new("m1", "prompt"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.response.text, "answer");
        assert_eq!(outcome.fallback_chain, vec!["m1".to_string()]);
        // 1M input tokens at 3.00/M = 3.00 units.
        assert_eq!(outcome.cost_micros, 3_000_000);
        assert!(!outcome.cache.hit);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_then_fall_back() {
        let p1 = MockProvider::echo();
        p1.fail_next(8); // more than max_attempts
        let p2 = MockProvider::returning("from p2");

        let registry = registry(vec![model("m1", "p1", &["m2"]), model("m2", "p2", &[])]);
        let dispatcher = Dispatcher::new(registry)
            .with_retry(fast_retry(4))
            .with_endpoint(ProviderEndpoint::new("p1", p1, EndpointConfig::default()))
            .with_endpoint(ProviderEndpoint::new("p2", p2, EndpointConfig::default()));

        let outcome = dispatcher
            .call(CompletionRequest::new("m1", "prompt"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.response.text, "from p2");
        assert_eq!(outcome.model_id, "m2");
        assert_eq!(outcome.provider, "p2");
        assert_eq!(outcome.fallback_chain, vec!["m1".to_string(), "m2".to_string()]);
    }

    #[tokio::test]
    async fn permanent_errors_do_not_walk_the_chain() {
        let p1 = MockProvider::echo();
        p1.push_err(ProviderError::Authentication("bad key".into()));
        let p2 = MockProvider::returning("never");

        let registry = registry(vec![model("m1", "p1", &["m2"]), model("m2", "p2", &[])]);
        let dispatcher = Dispatcher::new(registry)
            .with_retry(fast_retry(4))
            .with_endpoint(ProviderEndpoint::new("p1", p1, EndpointConfig::default()))
            .with_endpoint(ProviderEndpoint::new("p2", p2, EndpointConfig::default()));

        let error = dispatcher
            .call(CompletionRequest::new("m1", "prompt"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, ProviderError::Authentication(_)));
        let p2_endpoint = dispatcher.endpoint("p2").unwrap();
        assert_eq!(p2_endpoint.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_rejects_without_an_attempt() {
        let p1 = Arc::new(MockProvider::echo());
        p1.fail_next(64);

        let registry = registry(vec![model("m1", "p1", &[])]);
        let dispatcher = Dispatcher::new(registry)
            .with_retry(fast_retry(1))
            .with_endpoint(ProviderEndpoint::new("p1", Arc::clone(&p1), EndpointConfig::default()));

        // Five transient failures open the circuit.
        for _ in 0..5 {
            let error = dispatcher
                .call(CompletionRequest::new("m1", "x"), None, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(error, ProviderError::AllProvidersFailed { .. }));
        }
        let endpoint = dispatcher.endpoint("p1").unwrap();
        assert_eq!(endpoint.breaker().state(), CircuitState::Open);
        assert_eq!(p1.call_count(), 5);

        // Sixth call: rejected at the breaker, no provider attempt.
        let error = dispatcher
            .call(CompletionRequest::new("m1", "x"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        match error {
            ProviderError::AllProvidersFailed { attempted } => {
                assert_eq!(attempted, vec!["m1".to_string()]);
            }
            other => panic!("expected AllProvidersFailed, got {other}"),
        }
        assert_eq!(p1.call_count(), 5);
    }

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits() {
        let registry = registry(vec![model("m1", "p1", &[])]);
        let dispatcher = Dispatcher::new(registry).with_endpoint(ProviderEndpoint::new(
            "p1",
            MockProvider::echo(),
            EndpointConfig::default(),
        ));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = dispatcher
            .call(CompletionRequest::new("m1", "x"), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(error, ProviderError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out_as_transient() {
        struct SlowProvider;
        impl Provider for SlowProvider {
            fn complete(
                &self,
                request: CompletionRequest,
            ) -> impl std::future::Future<Output = Result<CompletionResponse, ProviderError>> + Send
            {
                async move {
                    tokio::time::sleep(Duration::from_secs(300)).await;
                    Ok(maestro_types::test_utils::echo_response(&request))
                }
            }
        }

        let registry = registry(vec![model("m1", "p1", &[])]);
        let dispatcher = Dispatcher::new(registry)
            .with_retry(fast_retry(2))
            .with_endpoint(ProviderEndpoint::new("p1", SlowProvider, EndpointConfig::default()));

        let error = dispatcher
            .call(
                CompletionRequest::new("m1", "x"),
                Some(Duration::from_millis(50)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match error {
            ProviderError::AllProvidersFailed { .. } | ProviderError::Timeout(_) => {}
            other => panic!("expected timeout path, got {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_model_is_a_permanent_error() {
        let registry = registry(vec![]);
        let dispatcher = Dispatcher::new(registry);
        let error = dispatcher
            .call(CompletionRequest::new("ghost", "x"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, ProviderError::ModelNotFound(_)));
    }
}
