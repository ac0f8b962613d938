#![deny(missing_docs)]
//! # maestro-types — core types and protocol traits
//!
//! This crate defines the data model and the protocol boundaries that the
//! rest of the maestro workspace composes around:
//!
//! | Boundary | Trait | What it does |
//! |----------|-------|-------------|
//! | Provider | [`Provider`] | One prompt in, one completion out |
//! | Embedding | [`EmbeddingProvider`] | Text in, vector out (semantic cache) |
//! | Pattern sink | [`PatternSink`] | Observes completed stages |
//!
//! Plus the shared value types: [`Tier`], [`ModelDescriptor`],
//! [`ModelRegistry`], [`CompletionRequest`]/[`CompletionResponse`],
//! [`TokenUsage`], [`CallOutcome`], and the per-concern error enums.
//!
//! ## Money
//!
//! Prices enter the system as [`rust_decimal::Decimal`] values in the
//! canonical currency unit (per million tokens). All internal arithmetic is
//! integer micro-units (`u64`) — see [`money`]. Floats never touch a cost
//! sum.
//!
//! ## Provider traits and object safety
//!
//! [`Provider`] and [`EmbeddingProvider`] use RPITIT and are intentionally
//! NOT object-safe. Where a `dyn` boundary is needed (the dispatch layer's
//! per-provider endpoint table, the cache's embedder slot), the consuming
//! crate erases the trait behind a boxed adapter. [`PatternSink`] is the
//! object-safe exception: sinks are registered as `Arc<dyn PatternSink>`.

pub mod error;
pub mod money;
pub mod traits;
pub mod types;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use error::{
    CacheError, ConfigError, EmbeddingError, EngineError, PatternError, ProviderError, RouteError,
    TelemetryError,
};
pub use money::{decimal_to_micros, micros_to_decimal};
pub use traits::{EmbeddingProvider, NoopPatternSink, PatternSink, Provider};
pub use types::{
    CacheHitKind, CacheInfo, CallOutcome, CompletionRequest, CompletionResponse, EmbeddingRequest,
    EmbeddingResponse, ModelDescriptor, ModelRegistry, PatternObservation, Tier, TokenUsage,
};

// Re-export: cancellation is part of the protocol surface (every suspension
// point honors it), so consumers get the token type from here.
pub use tokio_util::sync::CancellationToken;
