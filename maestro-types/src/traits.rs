//! Protocol traits: provider, embedding provider, pattern sink.

use std::future::Future;

use async_trait::async_trait;

use crate::error::{EmbeddingError, PatternError, ProviderError};
use crate::types::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, PatternObservation,
};

/// LLM provider interface.
///
/// Each backend (Anthropic-style HTTP, local, mock) implements this
/// trait. Uses RPITIT and is NOT object-safe; the dispatch layer's
/// endpoint table erases it behind a boxed adapter where `dyn` is needed.
///
/// Implementations perform exactly one attempt per call. Retry, timeout,
/// circuit breaking, and fallback live in the dispatch layer, never here.
pub trait Provider: Send + Sync {
    /// Send a completion request to the provider.
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> impl Future<Output = Result<CompletionResponse, ProviderError>> + Send;
}

/// Embedding provider interface, used only by the semantic cache.
///
/// Injected into the cache as a dependency; when absent, the cache runs
/// in hash-only mode. Uses RPITIT and is NOT object-safe.
pub trait EmbeddingProvider: Send + Sync {
    /// Produce one embedding vector per input text.
    fn embed(
        &self,
        request: EmbeddingRequest,
    ) -> impl Future<Output = Result<EmbeddingResponse, EmbeddingError>> + Send;
}

/// Observer of completed workflow stages.
///
/// The engine calls this after every completed stage so a pattern
/// library can learn reusable routing/escalation patterns across
/// sessions. Sink failures are logged and never fail the stage.
///
/// Object-safe by design: sinks are registered as `Arc<dyn PatternSink>`
/// and the default is [`NoopPatternSink`].
#[async_trait]
pub trait PatternSink: Send + Sync {
    /// Record one completed stage.
    async fn on_stage_complete(
        &self,
        observation: &PatternObservation,
    ) -> Result<(), PatternError>;
}

impl<P: Provider> Provider for std::sync::Arc<P> {
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> impl Future<Output = Result<CompletionResponse, ProviderError>> + Send {
        (**self).complete(request)
    }
}

impl<E: EmbeddingProvider> EmbeddingProvider for std::sync::Arc<E> {
    fn embed(
        &self,
        request: EmbeddingRequest,
    ) -> impl Future<Output = Result<EmbeddingResponse, EmbeddingError>> + Send {
        (**self).embed(request)
    }
}

/// The default pattern sink: records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPatternSink;

#[async_trait]
impl PatternSink for NoopPatternSink {
    async fn on_stage_complete(
        &self,
        _observation: &PatternObservation,
    ) -> Result<(), PatternError> {
        Ok(())
    }
}
