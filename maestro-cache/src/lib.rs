#![deny(missing_docs)]
//! # maestro-cache — response cache with coalesced builds
//!
//! Short-circuits identical (and, optionally, near-identical) LLM calls:
//!
//! - **Hash mode (always on):** exact [`Fingerprint`] lookup over a
//!   byte-bounded LRU store. O(1) lookup, zero provider cost on hits.
//! - **Semantic mode (optional):** an embedding index over stored
//!   prompts; misses fall back to a cosine-similarity search scoped to
//!   the same `(model, tier)` and a freshness window. Degrades silently
//!   to hash-only when the embedder is unavailable.
//! - **Coalescing:** concurrent misses on one fingerprint elect a
//!   leader; everyone else awaits the leader's broadcast. At most one
//!   in-flight provider call per fingerprint, process-wide.
//!
//! Cache failures never fail a call — they are logged once per process
//! and the call proceeds uncached.

pub mod cached;
pub mod coalesce;
pub mod fingerprint;
pub mod semantic;
pub mod store;

pub use cached::{CachedDispatcher, CallSpec};
pub use fingerprint::Fingerprint;
pub use semantic::BoxedEmbedder;
pub use store::{CacheConfig, CacheMode, CacheSnapshot};
