//! Byte-bounded LRU store for exact-fingerprint entries.

use std::collections::HashMap;
use std::time::Instant;

use maestro_types::{CompletionResponse, Tier};

use crate::fingerprint::Fingerprint;

/// Cache operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Exact-fingerprint lookup only.
    Hash,
    /// Exact lookup plus embedding-similarity fallback.
    Hybrid,
}

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Master switch; disabled means every call goes straight through.
    pub enabled: bool,
    /// Hash-only or hybrid (semantic) matching.
    pub mode: CacheMode,
    /// Upper bound on stored response bytes.
    pub max_bytes: usize,
    /// Cosine similarity floor for semantic hits.
    pub semantic_threshold: f32,
    /// Maximum age of an entry eligible for semantic matching.
    pub semantic_age_limit: std::time::Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: CacheMode::Hash,
            max_bytes: 256 * 1024 * 1024,
            semantic_threshold: 0.92,
            semantic_age_limit: std::time::Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// One cached response plus the metadata analytics and the semantic
/// index need.
#[derive(Debug, Clone)]
pub(crate) struct StoredEntry {
    pub response: CompletionResponse,
    pub model_id: String,
    pub provider: String,
    pub tier: Tier,
    pub created_at: Instant,
    pub hit_count: u64,
    pub bytes: usize,
    recency: u64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    /// Stored entries.
    pub entries: usize,
    /// Stored response bytes.
    pub bytes: usize,
    /// Exact hits served since startup.
    pub exact_hits: u64,
    /// Semantic hits served since startup.
    pub semantic_hits: u64,
    /// Misses since startup (coalesced followers not included).
    pub misses: u64,
}

/// The exact index: `HashMap` keyed by fingerprint with a monotonic
/// recency stamp per entry. Lookup is O(1); eviction scans for the
/// stalest entry, which is fine at the entry counts a 256 MB response
/// cache holds.
pub(crate) struct LruStore {
    entries: HashMap<Fingerprint, StoredEntry>,
    total_bytes: usize,
    max_bytes: usize,
    clock: u64,
    pub exact_hits: u64,
    pub semantic_hits: u64,
    pub misses: u64,
}

impl LruStore {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            total_bytes: 0,
            max_bytes,
            clock: 0,
            exact_hits: 0,
            semantic_hits: 0,
            misses: 0,
        }
    }

    /// Look up an entry, bumping recency and hit count on success.
    pub fn get(&mut self, fingerprint: &Fingerprint) -> Option<StoredEntry> {
        self.clock += 1;
        let clock = self.clock;
        if let Some(entry) = self.entries.get_mut(fingerprint) {
            entry.recency = clock;
            entry.hit_count += 1;
            Some(entry.clone())
        } else {
            None
        }
    }

    /// Read an entry without touching recency (semantic index reads).
    pub fn peek(&self, fingerprint: &Fingerprint) -> Option<&StoredEntry> {
        self.entries.get(fingerprint)
    }

    /// Admit an entry, evicting stalest-first until it fits. Returns the
    /// evicted fingerprints so the semantic index can drop its vectors.
    ///
    /// An entry larger than the whole budget is not admitted.
    pub fn insert(
        &mut self,
        fingerprint: Fingerprint,
        response: CompletionResponse,
        model_id: String,
        provider: String,
        tier: Tier,
    ) -> Vec<Fingerprint> {
        let bytes = response.text.len() + model_id.len() + 64;
        if bytes > self.max_bytes {
            return Vec::new();
        }

        self.clock += 1;
        if let Some(old) = self.entries.insert(
            fingerprint,
            StoredEntry {
                response,
                model_id,
                provider,
                tier,
                created_at: Instant::now(),
                hit_count: 0,
                bytes,
                recency: self.clock,
            },
        ) {
            self.total_bytes -= old.bytes;
        }
        self.total_bytes += bytes;

        let mut evicted = Vec::new();
        while self.total_bytes > self.max_bytes {
            let stalest = self
                .entries
                .iter()
                .filter(|(fp, _)| **fp != fingerprint)
                .min_by_key(|(_, e)| e.recency)
                .map(|(fp, _)| *fp);
            let Some(victim) = stalest else { break };
            if let Some(entry) = self.entries.remove(&victim) {
                self.total_bytes -= entry.bytes;
            }
            evicted.push(victim);
        }
        evicted
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            entries: self.entries.len(),
            bytes: self.total_bytes,
            exact_hits: self.exact_hits,
            semantic_hits: self.semantic_hits,
            misses: self.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_types::{CompletionRequest, TokenUsage};

    fn response(text: &str) -> CompletionResponse {
        CompletionResponse {
            text: text.into(),
            model: "m".into(),
            usage: TokenUsage::new(10, 10),
        }
    }

    fn fp(prompt: &str) -> Fingerprint {
        Fingerprint::compute(&CompletionRequest::new("m", prompt), Tier::Cheap)
    }

    #[test]
    fn get_after_insert_returns_the_entry() {
        let mut store = LruStore::new(1024 * 1024);
        let fingerprint = fp("a");
        store.insert(fingerprint, response("R"), "m".into(), "p".into(), Tier::Cheap);
        let entry = store.get(&fingerprint).unwrap();
        assert_eq!(entry.response.text, "R");
        assert_eq!(entry.hit_count, 1);
    }

    #[test]
    fn byte_limit_evicts_least_recently_used() {
        // Each entry is text len + model len + 64 overhead.
        let entry_bytes = 1 + 1 + 64;
        let mut store = LruStore::new(entry_bytes * 2);

        store.insert(fp("a"), response("A"), "m".into(), "p".into(), Tier::Cheap);
        store.insert(fp("b"), response("B"), "m".into(), "p".into(), Tier::Cheap);
        // Touch "a" so "b" is the LRU victim.
        assert!(store.get(&fp("a")).is_some());

        let evicted = store.insert(fp("c"), response("C"), "m".into(), "p".into(), Tier::Cheap);
        assert_eq!(evicted, vec![fp("b")]);
        assert!(store.get(&fp("a")).is_some());
        assert!(store.get(&fp("b")).is_none());
        assert!(store.get(&fp("c")).is_some());
    }

    #[test]
    fn oversized_entries_are_not_admitted() {
        let mut store = LruStore::new(32);
        let evicted = store.insert(fp("big"), response(&"x".repeat(1024)), "m".into(), "p".into(), Tier::Cheap);
        assert!(evicted.is_empty());
        assert!(store.get(&fp("big")).is_none());
        assert_eq!(store.snapshot().entries, 0);
    }

    #[test]
    fn reinserting_replaces_without_double_counting() {
        let mut store = LruStore::new(1024);
        store.insert(fp("a"), response("first"), "m".into(), "p".into(), Tier::Cheap);
        let before = store.snapshot().bytes;
        store.insert(fp("a"), response("other"), "m".into(), "p".into(), Tier::Cheap);
        let after = store.snapshot().bytes;
        assert_eq!(store.snapshot().entries, 1);
        assert_eq!(before, after);
    }

    #[test]
    fn clear_empties_the_store() {
        let mut store = LruStore::new(1024);
        store.insert(fp("a"), response("A"), "m".into(), "p".into(), Tier::Cheap);
        store.clear();
        assert_eq!(store.snapshot().entries, 0);
        assert_eq!(store.snapshot().bytes, 0);
    }
}
