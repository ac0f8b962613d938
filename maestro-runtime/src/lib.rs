#![deny(missing_docs)]
//! # maestro-runtime — wiring it all together
//!
//! Loads `config.yml`/`config.json` (the §external-interface schema),
//! validates it, and builds one [`Runtime`] value owning every
//! long-lived service: model registry, resilient dispatcher, response
//! cache, usage ledger, smart router, workflow engine. There are no
//! process-wide singletons; everything is reachable from the `Runtime`
//! you constructed.

pub mod config;
pub mod runtime;

pub use config::MaestroConfig;
pub use runtime::{Runtime, RuntimeBuilder};
