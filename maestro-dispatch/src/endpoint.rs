//! Provider endpoints: the erased provider handle plus its health state
//! and concurrency bound.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use maestro_types::{CompletionRequest, CompletionResponse, Provider, ProviderError};

use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};

// --- Type erasure for Provider (RPITIT is not dyn-compatible) ---

/// Type alias for a pinned, boxed, Send completion future.
type ProviderFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CompletionResponse, ProviderError>> + Send + 'a>>;

/// Dyn-compatible wrapper for [`Provider`].
trait ErasedProvider: Send + Sync {
    fn erased_complete(&self, request: CompletionRequest) -> ProviderFuture<'_>;
}

impl<P: Provider> ErasedProvider for P {
    fn erased_complete(&self, request: CompletionRequest) -> ProviderFuture<'_> {
        Box::pin(self.complete(request))
    }
}

/// A type-erased provider handle for the endpoint table.
///
/// Wraps any [`Provider`] into a dyn-compatible form, the same way the
/// engine boxes hooks: the generic trait stays ergonomic at the edges
/// and the erasure happens exactly once, here.
#[derive(Clone)]
pub struct BoxedProvider(Arc<dyn ErasedProvider>);

impl BoxedProvider {
    /// Wrap any [`Provider`] into a type-erased `BoxedProvider`.
    #[must_use]
    pub fn new<P: Provider + 'static>(provider: P) -> Self {
        BoxedProvider(Arc::new(provider))
    }

    /// Send one completion attempt to the wrapped provider.
    pub(crate) async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.0.erased_complete(request).await
    }
}

// A boxed provider is itself a provider, so pre-erased handles can be
// registered anywhere a concrete one is accepted.
impl Provider for BoxedProvider {
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> impl Future<Output = Result<CompletionResponse, ProviderError>> + Send {
        self.0.erased_complete(request)
    }
}

/// Endpoint tuning knobs.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Maximum in-flight calls to this provider.
    pub concurrency: usize,
    /// Default per-attempt timeout when the caller sets none shorter.
    pub default_timeout: Duration,
    /// Circuit breaker configuration.
    pub breaker: CircuitBreakerConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            default_timeout: Duration::from_secs(60),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// One registered provider: client handle, health state, backpressure.
pub struct ProviderEndpoint {
    /// Provider identifier (matches `ModelDescriptor::provider`).
    pub id: String,
    pub(crate) provider: BoxedProvider,
    pub(crate) semaphore: Arc<Semaphore>,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) default_timeout: Duration,
}

impl ProviderEndpoint {
    /// Register a provider under the given id.
    #[must_use]
    pub fn new<P: Provider + 'static>(id: impl Into<String>, provider: P, config: EndpointConfig) -> Self {
        Self {
            id: id.into(),
            provider: BoxedProvider::new(provider),
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            breaker: CircuitBreaker::new(config.breaker),
            default_timeout: config.default_timeout,
        }
    }

    /// The endpoint's circuit breaker (observability and tests).
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}
