#![deny(missing_docs)]
//! # maestro-telemetry — the local cost ledger
//!
//! Records every provider-bound call (cache hits included) to an
//! append-only JSON Lines file under `<data_dir>/telemetry/`, then
//! answers cost and savings questions from those files.
//!
//! Privacy posture: no prompts, no responses, no paths, no environment
//! data. A user identifier, when configured, is stored only as a
//! truncated SHA-256 hash.
//!
//! Write failures never fail workflows — the first one is logged, the
//! rest are swallowed. Rotation happens at a size threshold; retention
//! deletes whole rotated files past the cutoff, never individual lines.

pub mod analytics;
pub mod entry;
pub mod ledger;

pub use analytics::{ExportFormat, Savings, Stats, TierStats};
pub use entry::{hash_user_id, TelemetryEntry, SCHEMA_VERSION};
pub use ledger::{LedgerConfig, UsageLedger};
