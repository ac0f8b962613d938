#![deny(missing_docs)]
//! # maestro-provider-http — the HTTP provider
//!
//! A [`maestro_types::Provider`] speaking a messages-style JSON chat API
//! (configurable base URL and auth header for proxies and compatible
//! gateways), plus a [`maestro_types::EmbeddingProvider`] for an
//! embeddings endpoint.
//!
//! One attempt per call, no retry here: resilience is the dispatch
//! layer's job.

pub mod client;
pub mod embeddings;
mod error;
mod mapping;

pub use client::HttpProvider;
pub use embeddings::HttpEmbedder;
