//! Test doubles for the provider and embedding protocols.
//!
//! Enabled with the `test-utils` feature. Used by unit tests across the
//! workspace and by the workspace-level scenario tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{EmbeddingError, ProviderError};
use crate::traits::{EmbeddingProvider, Provider};
use crate::types::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, TokenUsage,
};

/// Scripted provider with a call counter.
///
/// Pops scripted results in order; once the script is exhausted, falls
/// back to a response function (default: echo the prompt with a token
/// count derived from its length).
///
/// The call counter counts every `complete` invocation, which is how the
/// coalescing and circuit-breaker tests observe "exactly N upstream
/// calls were issued."
pub struct MockProvider {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<CompletionResponse, ProviderError>>>,
    fallback: Box<dyn Fn(&CompletionRequest) -> Result<CompletionResponse, ProviderError> + Send + Sync>,
}

impl MockProvider {
    /// A provider that echoes the prompt back as the completion.
    #[must_use]
    pub fn echo() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            fallback: Box::new(|request| Ok(echo_response(request))),
        }
    }

    /// A provider that always returns the given text.
    #[must_use]
    pub fn returning(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            fallback: Box::new(move |request| {
                Ok(CompletionResponse {
                    text: text.clone(),
                    model: request.model.clone(),
                    usage: TokenUsage::new((request.prompt.len() / 4) as u64, 16),
                })
            }),
        }
    }

    /// A provider with a custom response function.
    #[must_use]
    pub fn with_fn<F>(fallback: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<CompletionResponse, ProviderError> + Send + Sync + 'static,
    {
        Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            fallback: Box::new(fallback),
        }
    }

    /// Queue a scripted success for the next call.
    pub fn push_ok(&self, response: CompletionResponse) {
        self.script
            .lock()
            .expect("mock script lock")
            .push_back(Ok(response));
    }

    /// Queue a scripted failure for the next call.
    pub fn push_err(&self, error: ProviderError) {
        self.script
            .lock()
            .expect("mock script lock")
            .push_back(Err(error));
    }

    /// Queue `n` consecutive `ServiceUnavailable` failures.
    pub fn fail_next(&self, n: usize) {
        for _ in 0..n {
            self.push_err(ProviderError::ServiceUnavailable("scripted failure".into()));
        }
    }

    /// How many times `complete` has been called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Build an echo response for a request: text mirrors the prompt.
#[must_use]
pub fn echo_response(request: &CompletionRequest) -> CompletionResponse {
    CompletionResponse {
        text: request.prompt.clone(),
        model: request.model.clone(),
        usage: TokenUsage::new((request.prompt.len() / 4) as u64, (request.prompt.len() / 4) as u64),
    }
}

impl Provider for MockProvider {
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> impl std::future::Future<Output = Result<CompletionResponse, ProviderError>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().expect("mock script lock").pop_front();
        let result = match scripted {
            Some(result) => result,
            None => (self.fallback)(&request),
        };
        async move { result }
    }
}

/// Deterministic embedder: maps each text to a byte-histogram vector.
/// Texts with the same bytes in any order map to identical vectors,
/// which is what the semantic-cache tests need.
pub struct MockEmbedder {
    calls: AtomicUsize,
    dimensions: usize,
    fail: std::sync::atomic::AtomicBool,
}

impl MockEmbedder {
    /// Create an embedder producing vectors of the given dimension.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            dimensions,
            fail: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Make subsequent `embed` calls fail (degradation tests).
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    /// How many times `embed` has been called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        // Byte histogram: position-independent, so texts with the same
        // bytes in any order map to identical vectors.
        let mut v = vec![1.0f32; self.dimensions];
        for byte in text.bytes() {
            v[byte as usize % self.dimensions] += 1.0;
        }
        v
    }
}

impl EmbeddingProvider for MockEmbedder {
    fn embed(
        &self,
        request: EmbeddingRequest,
    ) -> impl std::future::Future<Output = Result<EmbeddingResponse, EmbeddingError>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail.load(Ordering::SeqCst) {
            Err(EmbeddingError::InvalidRequest("scripted failure".into()))
        } else {
            Ok(EmbeddingResponse {
                embeddings: request.input.iter().map(|t| self.vector_for(t)).collect(),
                model: "mock-embed".into(),
            })
        };
        async move { result }
    }
}
