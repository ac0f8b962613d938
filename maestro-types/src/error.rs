//! Error types for each concern.
//!
//! The taxonomy mirrors the dispatch pipeline: provider errors are
//! normalized inside the dispatch layer, cache and telemetry errors are
//! non-fatal and degrade, and the engine converts stage-level failures
//! into structured results instead of letting them cross the API
//! boundary.

use std::time::Duration;

/// Errors from LLM provider calls.
///
/// The first group is transient (retried with backoff, then subject to
/// fallback), the second terminal (surfaced immediately, never retried).
/// `CircuitOpen` and `AllProvidersFailed` are produced by the dispatch
/// layer, not by providers themselves.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    // Transient errors
    /// Network-level error (connection reset, DNS failure, etc.).
    #[error("network error: {0}")]
    Network(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Rate limited by the provider.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimit {
        /// Suggested retry delay, if provided by the API.
        retry_after: Option<Duration>,
    },
    /// Request timed out.
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    /// Provider service is temporarily unavailable (5xx).
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    // Terminal errors
    /// Authentication/authorization failure.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Malformed or invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Requested model does not exist.
    #[error("model not found: {0}")]
    ModelNotFound(String),
    /// The request was refused on content-policy grounds.
    #[error("content policy refusal: {0}")]
    ContentPolicy(String),

    // Dispatch-layer outcomes
    /// Circuit breaker is open for the provider; no HTTP attempt was made.
    #[error("provider unavailable: circuit open for {provider}")]
    CircuitOpen {
        /// The provider whose circuit is open.
        provider: String,
    },
    /// Every model in the fallback chain was exhausted.
    #[error("all providers failed after trying {}", attempted.join(", "))]
    AllProvidersFailed {
        /// Model ids attempted, in order.
        attempted: Vec<String>,
    },
    /// The call was cancelled via its cancellation token.
    #[error("cancelled")]
    Cancelled,

    // Catch-all
    /// Any other provider error.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl ProviderError {
    /// Whether this error is likely transient and the attempt can be
    /// retried against the same provider.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimit { .. } | Self::Timeout(_) | Self::ServiceUnavailable(_)
        )
    }

    /// Whether this error should move the call down the fallback chain
    /// (retries exhausted on a transient error, or circuit open).
    #[must_use]
    pub fn triggers_fallback(&self) -> bool {
        self.is_retryable() || matches!(self, Self::CircuitOpen { .. })
    }
}

/// Errors from embedding provider calls (semantic cache only).
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    /// Authentication/authorization failure.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Rate limited by the provider.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimit {
        /// Suggested retry delay, if provided by the API.
        retry_after: Option<Duration>,
    },
    /// Malformed or invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Network-level error.
    #[error("network error: {0}")]
    Network(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Any other embedding error.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Errors from the response cache backend.
///
/// These never fail a call: the cache layer logs once and bypasses.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The coalescing leader died without broadcasting a result.
    #[error("coalesced leader dropped without a result")]
    LeaderDropped,
    /// Backend storage failure.
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Errors from the telemetry ledger.
///
/// Write failures never fail workflows; read/analytics failures surface
/// to the analytics caller only.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// I/O error reading or writing ledger files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A ledger line could not be serialized or parsed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// `reset` called without the explicit confirmation flag.
    #[error("reset requires explicit confirmation")]
    ResetNotConfirmed,
}

/// Errors from workflow engine entry points.
///
/// Stage-level failures never appear here; they are encoded in the
/// structured `WorkflowReport`. This enum carries only caller mistakes
/// and pre-start cancellation.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The requested workflow is not registered.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),
    /// A workflow with this name is already registered with a different
    /// definition.
    #[error("workflow {0} already registered with a different definition")]
    DuplicateWorkflow(String),
    /// The definition failed validation at registration.
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),
    /// Caller-supplied inputs or options are invalid.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The invocation was cancelled before any stage started.
    #[error("cancelled")]
    Cancelled,
}

/// Errors from the smart router.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// No workflow scored above the minimum threshold, or the
    /// disambiguation classifier was unavailable and the keyword pass
    /// stayed ambiguous. Never guess.
    #[error("no workflow matched the request")]
    RoutingFailure {
        /// Closest candidates, best first, for the caller to surface.
        suggestions: Vec<String>,
    },
}

/// Errors from pattern sinks. Logged by the engine, never propagated.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    /// The sink rejected or failed to record the observation.
    #[error("pattern sink failed: {0}")]
    Failed(String),
}

/// Configuration errors. Fatal at startup.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The config file could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),
    /// The config parsed but is semantically invalid.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// A referenced environment variable (API key) is not set.
    #[error("missing environment variable: {0}")]
    MissingEnv(String),
}
