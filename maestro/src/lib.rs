#![deny(missing_docs)]
//! # maestro — umbrella crate
//!
//! Single import surface for the maestro workspace. Re-exports the
//! member crates behind feature flags, plus a `prelude` for the happy
//! path.

#[cfg(feature = "core")]
pub use maestro_cache;
#[cfg(feature = "core")]
pub use maestro_dispatch;
#[cfg(feature = "engine")]
pub use maestro_engine;
#[cfg(feature = "provider-http")]
pub use maestro_provider_http;
#[cfg(feature = "engine")]
pub use maestro_router;
#[cfg(feature = "runtime")]
pub use maestro_runtime;
#[cfg(feature = "telemetry")]
pub use maestro_telemetry;
#[cfg(feature = "core")]
pub use maestro_types;

/// Happy-path imports for composing maestro systems.
pub mod prelude {
    #[cfg(feature = "core")]
    pub use maestro_types::{
        CacheInfo, CallOutcome, CancellationToken, CompletionRequest, CompletionResponse,
        EmbeddingProvider, ModelDescriptor, ModelRegistry, PatternSink, Provider, ProviderError,
        Tier, TokenUsage,
    };

    #[cfg(feature = "core")]
    pub use maestro_dispatch::{Dispatcher, EndpointConfig, ProviderEndpoint, RetryPolicy};

    #[cfg(feature = "core")]
    pub use maestro_cache::{CacheConfig, CacheMode, CachedDispatcher, CallSpec};

    #[cfg(feature = "engine")]
    pub use maestro_engine::{
        builtin_workflows, ExecOptions, StageSpec, WorkflowDefinition, WorkflowEngine,
        WorkflowOutcome, WorkflowReport,
    };

    #[cfg(feature = "engine")]
    pub use maestro_router::{RouteHints, RoutingDecision, SmartRouter};

    #[cfg(feature = "telemetry")]
    pub use maestro_telemetry::{LedgerConfig, TelemetryEntry, UsageLedger};

    #[cfg(feature = "provider-http")]
    pub use maestro_provider_http::{HttpEmbedder, HttpProvider};

    #[cfg(feature = "runtime")]
    pub use maestro_runtime::{MaestroConfig, Runtime};
}
