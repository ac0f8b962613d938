//! Embedding index for near-identical prompt matching.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use maestro_types::{EmbeddingError, EmbeddingProvider, EmbeddingRequest, EmbeddingResponse, Tier};

use crate::fingerprint::Fingerprint;

// --- Type erasure for EmbeddingProvider (RPITIT is not dyn-compatible) ---

/// Type alias for a pinned, boxed, Send embedding future.
type EmbedFuture<'a> =
    Pin<Box<dyn Future<Output = Result<EmbeddingResponse, EmbeddingError>> + Send + 'a>>;

/// Dyn-compatible wrapper for [`EmbeddingProvider`].
trait ErasedEmbedder: Send + Sync {
    fn erased_embed(&self, request: EmbeddingRequest) -> EmbedFuture<'_>;
}

impl<E: EmbeddingProvider> ErasedEmbedder for E {
    fn erased_embed(&self, request: EmbeddingRequest) -> EmbedFuture<'_> {
        Box::pin(self.embed(request))
    }
}

/// A type-erased embedding provider, injected into the cache for hybrid
/// mode.
#[derive(Clone)]
pub struct BoxedEmbedder(Arc<dyn ErasedEmbedder>);

impl BoxedEmbedder {
    /// Wrap any [`EmbeddingProvider`] into a type-erased `BoxedEmbedder`.
    #[must_use]
    pub fn new<E: EmbeddingProvider + 'static>(embedder: E) -> Self {
        BoxedEmbedder(Arc::new(embedder))
    }

    /// Embed one text, with the provider's default embedding model.
    pub(crate) async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .0
            .erased_embed(EmbeddingRequest {
                model: String::new(),
                input: vec![text.to_string()],
            })
            .await?;
        response
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidRequest("empty embedding response".into()))
    }
}

struct SemanticEntry {
    fingerprint: Fingerprint,
    vector: Vec<f32>,
    model_id: String,
    tier: Tier,
    created_at: Instant,
}

/// The semantic side index: prompt vectors pointing back at exact
/// entries. Linear scan; the candidate set is bounded by the LRU store.
pub(crate) struct SemanticIndex {
    embedder: BoxedEmbedder,
    entries: Mutex<Vec<SemanticEntry>>,
}

impl SemanticIndex {
    pub fn new(embedder: BoxedEmbedder) -> Self {
        Self {
            embedder,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embedder.embed_one(text).await
    }

    /// Record a vector for a freshly stored exact entry.
    pub fn insert(&self, fingerprint: Fingerprint, vector: Vec<f32>, model_id: String, tier: Tier) {
        let mut entries = self.entries.lock();
        entries.retain(|e| e.fingerprint != fingerprint);
        entries.push(SemanticEntry {
            fingerprint,
            vector,
            model_id,
            tier,
            created_at: Instant::now(),
        });
    }

    /// Best match above the similarity floor, constrained to the same
    /// model and tier and to entries younger than the age limit.
    pub fn search(
        &self,
        query: &[f32],
        model_id: &str,
        tier: Tier,
        threshold: f32,
        age_limit: Duration,
    ) -> Option<Fingerprint> {
        let entries = self.entries.lock();
        let mut best: Option<(f32, Fingerprint)> = None;
        for entry in entries.iter() {
            if entry.model_id != model_id || entry.tier != tier {
                continue;
            }
            if entry.created_at.elapsed() > age_limit {
                continue;
            }
            let similarity = cosine(query, &entry.vector);
            if similarity >= threshold && best.is_none_or(|(s, _)| similarity > s) {
                best = Some((similarity, entry.fingerprint));
            }
        }
        best.map(|(_, fp)| fp)
    }

    /// Drop vectors whose exact entries were evicted.
    pub fn remove(&self, evicted: &[Fingerprint]) {
        if evicted.is_empty() {
            return;
        }
        self.entries
            .lock()
            .retain(|e| !evicted.contains(&e.fingerprint));
    }

    /// Drop every vector (cache reset).
    pub fn remove_all(&self) {
        self.entries.lock().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Cosine similarity with a zero-norm guard.
fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_types::test_utils::MockEmbedder;
    use maestro_types::CompletionRequest;

    fn fp(prompt: &str) -> Fingerprint {
        Fingerprint::compute(&CompletionRequest::new("m", prompt), Tier::Cheap)
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn search_matches_same_model_and_tier_only() {
        let index = SemanticIndex::new(BoxedEmbedder::new(MockEmbedder::new(8)));
        let vector = index.embed("review this diff").await.unwrap();
        index.insert(fp("review this diff"), vector.clone(), "m1".into(), Tier::Capable);

        let age = Duration::from_secs(600);
        assert!(index.search(&vector, "m1", Tier::Capable, 0.92, age).is_some());
        assert!(index.search(&vector, "m2", Tier::Capable, 0.92, age).is_none());
        assert!(index.search(&vector, "m1", Tier::Premium, 0.92, age).is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_not_matched() {
        let index = SemanticIndex::new(BoxedEmbedder::new(MockEmbedder::new(8)));
        let vector = index.embed("hello").await.unwrap();
        index.insert(fp("hello"), vector.clone(), "m1".into(), Tier::Cheap);
        assert!(
            index
                .search(&vector, "m1", Tier::Cheap, 0.92, Duration::ZERO)
                .is_none()
        );
    }

    #[tokio::test]
    async fn removal_drops_vectors() {
        let index = SemanticIndex::new(BoxedEmbedder::new(MockEmbedder::new(8)));
        let vector = index.embed("hello").await.unwrap();
        index.insert(fp("hello"), vector, "m1".into(), Tier::Cheap);
        assert_eq!(index.len(), 1);
        index.remove(&[fp("hello")]);
        assert_eq!(index.len(), 0);
    }
}
