//! The cached dispatcher: exact lookup, semantic fallback, coalesced
//! builds, all wrapped around the resilient dispatch layer.

use std::sync::{Arc, Once};
use std::time::Instant;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use maestro_dispatch::Dispatcher;
use maestro_types::{
    CacheInfo, CallOutcome, CompletionRequest, ModelRegistry, ProviderError, Tier,
};

use crate::coalesce::{BuildRole, InFlight, SharedProviderError};
use crate::fingerprint::{canonicalize, Fingerprint};
use crate::semantic::{BoxedEmbedder, SemanticIndex};
use crate::store::{CacheConfig, CacheMode, CacheSnapshot, LruStore, StoredEntry};

static EMBEDDER_DEGRADED: Once = Once::new();
static FOLLOWER_DEGRADED: Once = Once::new();

/// One provider-bound call as the engine sees it: the request plus the
/// dispatch context the cache needs for fingerprinting.
#[derive(Debug, Clone)]
pub struct CallSpec {
    /// The completion request; `request.model` is the primary model.
    pub request: CompletionRequest,
    /// Tier this call runs at (part of the fingerprint).
    pub tier: Tier,
    /// Caller deadline for each provider attempt.
    pub deadline: Option<std::time::Duration>,
    /// Per-invocation cache opt-out.
    pub use_cache: bool,
}

impl CallSpec {
    /// A cache-enabled call with no extra deadline.
    #[must_use]
    pub fn new(request: CompletionRequest, tier: Tier) -> Self {
        Self {
            request,
            tier,
            deadline: None,
            use_cache: true,
        }
    }
}

/// Response cache wrapped around a [`Dispatcher`].
///
/// This is the handle the workflow engine talks to; it guarantees
/// at-most-one concurrent build per fingerprint and never fails a call
/// on cache trouble.
pub struct CachedDispatcher {
    dispatcher: Arc<Dispatcher>,
    config: CacheConfig,
    store: Mutex<LruStore>,
    semantic: Option<SemanticIndex>,
    inflight: InFlight,
}

impl CachedDispatcher {
    /// Wrap a dispatcher in a cache with the given configuration.
    ///
    /// Hybrid mode needs an embedder via
    /// [`with_embedder`](Self::with_embedder); without one it behaves as
    /// hash-only.
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>, config: CacheConfig) -> Self {
        Self {
            store: Mutex::new(LruStore::new(config.max_bytes)),
            dispatcher,
            config,
            semantic: None,
            inflight: InFlight::new(),
        }
    }

    /// Inject the embedding provider for hybrid mode.
    #[must_use]
    pub fn with_embedder(mut self, embedder: BoxedEmbedder) -> Self {
        if self.config.mode == CacheMode::Hybrid {
            self.semantic = Some(SemanticIndex::new(embedder));
        }
        self
    }

    /// The model registry behind the wrapped dispatcher.
    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        self.dispatcher.registry()
    }

    /// The wrapped dispatcher (for calls that must bypass the cache).
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Current cache counters.
    #[must_use]
    pub fn snapshot(&self) -> CacheSnapshot {
        self.store.lock().snapshot()
    }

    /// Drop every cached entry and semantic vector.
    pub fn reset(&self) {
        self.store.lock().clear();
        if let Some(semantic) = &self.semantic {
            semantic.remove_all();
        }
    }

    /// Execute a call through the cache.
    ///
    /// # Errors
    ///
    /// Provider errors pass through unchanged (coalesced followers see
    /// the leader's error wrapped, with the original as `source`).
    /// Cache trouble never surfaces here.
    pub async fn call(
        &self,
        spec: CallSpec,
        cancel: &CancellationToken,
    ) -> Result<CallOutcome, ProviderError> {
        if !self.config.enabled || !spec.use_cache {
            return self
                .dispatcher
                .call(spec.request, spec.deadline, cancel)
                .await;
        }

        let fingerprint = Fingerprint::compute(&spec.request, spec.tier);
        let lookup_started = Instant::now();

        // Exact index first: O(1), no await.
        {
            let mut store = self.store.lock();
            if let Some(entry) = store.get(&fingerprint) {
                store.exact_hits += 1;
                drop(store);
                tracing::debug!(%fingerprint, "exact cache hit");
                return Ok(hit_outcome(entry, CacheInfo::exact_hit(), lookup_started));
            }
        }

        // Semantic fallback, when configured. An embedder failure
        // degrades to hash-only for this call and warns once.
        let query_vector = match &self.semantic {
            Some(semantic) => match semantic.embed(&canonicalize(&spec.request.prompt)).await {
                Ok(vector) => Some(vector),
                Err(error) => {
                    EMBEDDER_DEGRADED.call_once(|| {
                        tracing::warn!(%error, "embedding model unavailable, cache degraded to hash-only");
                    });
                    None
                }
            },
            None => None,
        };
        if let (Some(semantic), Some(vector)) = (&self.semantic, &query_vector) {
            let found = semantic.search(
                vector,
                &spec.request.model,
                spec.tier,
                self.config.semantic_threshold,
                self.config.semantic_age_limit,
            );
            if let Some(source_fingerprint) = found {
                let mut store = self.store.lock();
                if let Some(entry) = store.get(&source_fingerprint) {
                    store.semantic_hits += 1;
                    drop(store);
                    tracing::debug!(%fingerprint, source = %source_fingerprint, "semantic cache hit");
                    return Ok(hit_outcome(entry, CacheInfo::semantic_hit(), lookup_started));
                }
            }
        }

        // Real miss: coalesce concurrent identical builds.
        match self.inflight.join(fingerprint) {
            BuildRole::Leader => {
                self.build_as_leader(fingerprint, spec, query_vector, cancel)
                    .await
            }
            BuildRole::Follower(mut receiver) => {
                let received = tokio::select! {
                    () = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    received = receiver.recv() => received,
                };
                match received {
                    Ok(Ok(outcome)) => Ok(CallOutcome {
                        cost_micros: 0,
                        duration: lookup_started.elapsed(),
                        cache: CacheInfo::exact_hit(),
                        ..outcome
                    }),
                    Ok(Err(shared)) => Err(shared.into_provider_error()),
                    Err(_recv) => {
                        // Leader vanished without a result; bypass the
                        // cache rather than fail the call.
                        FOLLOWER_DEGRADED.call_once(|| {
                            tracing::warn!("coalescing leader dropped, bypassing cache");
                        });
                        self.dispatcher
                            .call(spec.request, spec.deadline, cancel)
                            .await
                    }
                }
            }
        }
    }

    /// The leader path: one provider call, store, broadcast, release.
    async fn build_as_leader(
        &self,
        fingerprint: Fingerprint,
        spec: CallSpec,
        query_vector: Option<Vec<f32>>,
        cancel: &CancellationToken,
    ) -> Result<CallOutcome, ProviderError> {
        // If this future is dropped mid-build, the guard abandons the
        // slot so followers wake up instead of waiting forever.
        let mut guard = LeaderGuard {
            inflight: &self.inflight,
            fingerprint,
            armed: true,
        };
        let result = self
            .dispatcher
            .call(spec.request.clone(), spec.deadline, cancel)
            .await;
        guard.armed = false;

        match result {
            Ok(outcome) => {
                let evicted = {
                    let mut store = self.store.lock();
                    store.misses += 1;
                    store.insert(
                        fingerprint,
                        outcome.response.clone(),
                        outcome.model_id.clone(),
                        outcome.provider.clone(),
                        spec.tier,
                    )
                };
                if let Some(semantic) = &self.semantic {
                    semantic.remove(&evicted);
                    if let Some(vector) = query_vector {
                        semantic.insert(fingerprint, vector, spec.request.model.clone(), spec.tier);
                    }
                }
                // Store before release: a follower that re-misses after
                // the slot clears will find the entry.
                self.inflight.complete(&fingerprint, Ok(outcome.clone()));
                Ok(outcome)
            }
            Err(error) => {
                let shared = Arc::new(error);
                self.inflight
                    .complete(&fingerprint, Err(SharedProviderError(Arc::clone(&shared))));
                // With no followers the broadcast clone is dropped and
                // the original error comes back out intact.
                match Arc::try_unwrap(shared) {
                    Ok(original) => Err(original),
                    Err(still_shared) => Err(SharedProviderError(still_shared).into_provider_error()),
                }
            }
        }
    }
}

struct LeaderGuard<'a> {
    inflight: &'a InFlight,
    fingerprint: Fingerprint,
    armed: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inflight.abandon(&self.fingerprint);
        }
    }
}

/// Assemble a zero-cost outcome from a stored entry.
fn hit_outcome(entry: StoredEntry, cache: CacheInfo, lookup_started: Instant) -> CallOutcome {
    CallOutcome {
        fallback_chain: vec![entry.model_id.clone()],
        provider: entry.provider,
        model_id: entry.model_id,
        response: entry.response,
        cost_micros: 0,
        duration: lookup_started.elapsed(),
        cache,
    }
}
