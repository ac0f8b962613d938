#![deny(missing_docs)]
//! # maestro-dispatch — resilient provider dispatch
//!
//! The only layer that talks to LLM providers. Wraps any
//! [`maestro_types::Provider`] with:
//!
//! - **Retry**: exponential backoff with full jitter on transient errors.
//! - **Circuit breaking**: per-provider CLOSED → OPEN → HALF_OPEN state
//!   machine; an open circuit rejects without an HTTP attempt.
//! - **Backpressure**: a counting semaphore per provider bounds in-flight
//!   calls; the permit covers each attempt including retries.
//! - **Timeout**: per-attempt deadline of `min(caller, provider default)`.
//! - **Fallback**: an ordered chain of alternate models, tried when
//!   retries are exhausted or a circuit is open. Permanent errors
//!   (auth, invalid request, content policy) surface immediately and
//!   never walk the chain.
//!
//! All suspension points (HTTP I/O, backoff sleeps, semaphore
//! acquisition) honor the call's `CancellationToken`.

pub mod circuit;
pub mod dispatcher;
pub mod endpoint;
pub mod retry;

pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use dispatcher::Dispatcher;
pub use endpoint::{BoxedProvider, EndpointConfig, ProviderEndpoint};
pub use retry::RetryPolicy;
