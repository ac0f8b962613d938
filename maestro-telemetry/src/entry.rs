//! The ledger line format.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use maestro_types::{decimal_to_micros, micros_to_decimal, CacheInfo, CallOutcome, Tier, TokenUsage};

/// Current ledger schema version.
pub const SCHEMA_VERSION: &str = "1.0";

/// One ledger line. Field names are the wire contract; field order is
/// not.
///
/// `cost` is a decimal in the canonical currency unit on the wire;
/// analytics convert back to micro-units before summing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEntry {
    /// Schema version, `"1.0"`.
    #[serde(rename = "v")]
    pub schema_version: String,
    /// UTC timestamp of the call.
    #[serde(rename = "ts")]
    pub ts_utc: DateTime<Utc>,
    /// Workflow name, or `"router"` for classifier calls.
    pub workflow: String,
    /// Stage name within the workflow.
    pub stage: String,
    /// Tier the call ran at (for hits: would have run at).
    pub tier: Tier,
    /// Model that served the call.
    #[serde(rename = "model")]
    pub model_id: String,
    /// Provider that served the call.
    pub provider: String,
    /// Cost in the canonical currency unit. Zero on cache hits.
    pub cost: Decimal,
    /// Token counts (stored-response tokens on hits, for the baseline
    /// comparison).
    pub tokens: TokenUsage,
    /// Cache disposition.
    pub cache: CacheInfo,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Truncated SHA-256 of the configured user identifier, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl TelemetryEntry {
    /// Build a ledger line from a finished call.
    #[must_use]
    pub fn from_outcome(
        workflow: impl Into<String>,
        stage: impl Into<String>,
        tier: Tier,
        outcome: &CallOutcome,
        user_id: Option<String>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            ts_utc: Utc::now(),
            workflow: workflow.into(),
            stage: stage.into(),
            tier,
            model_id: outcome.model_id.clone(),
            provider: outcome.provider.clone(),
            cost: micros_to_decimal(outcome.cost_micros),
            tokens: outcome.response.usage,
            cache: outcome.cache,
            duration_ms: outcome.duration.as_millis() as u64,
            user_id,
        }
    }

    /// Cost in integer micro-units.
    #[must_use]
    pub fn cost_micros(&self) -> u64 {
        decimal_to_micros(self.cost).unwrap_or(0)
    }
}

/// Hash a configured user identifier for storage: SHA-256 hex,
/// truncated to 16 characters.
#[must_use]
pub fn hash_user_id(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_types::{CompletionResponse, TokenUsage};
    use std::time::Duration;

    fn outcome() -> CallOutcome {
        CallOutcome {
            response: CompletionResponse {
                text: "irrelevant".into(),
                model: "m-capable".into(),
                usage: TokenUsage::new(1500, 500),
            },
            provider: "p1".into(),
            model_id: "m-capable".into(),
            cost_micros: 15_000,
            duration: Duration::from_millis(2340),
            fallback_chain: vec!["m-capable".into()],
            cache: CacheInfo::miss(),
        }
    }

    #[test]
    fn wire_format_field_names() {
        let entry = TelemetryEntry::from_outcome(
            "code-review",
            "analysis",
            Tier::Capable,
            &outcome(),
            Some(hash_user_id("dev@example")),
        );
        let line = serde_json::to_string(&entry).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["v"], "1.0");
        assert_eq!(value["workflow"], "code-review");
        assert_eq!(value["stage"], "analysis");
        assert_eq!(value["tier"], "CAPABLE");
        assert_eq!(value["model"], "m-capable");
        assert_eq!(value["provider"], "p1");
        assert_eq!(value["cost"], 0.015);
        assert_eq!(value["tokens"]["input"], 1500);
        assert_eq!(value["tokens"]["output"], 500);
        assert_eq!(value["cache"]["hit"], false);
        assert_eq!(value["duration_ms"], 2340);
        assert_eq!(value["user_id"].as_str().unwrap().len(), 16);
        // Never present: prompts, responses, paths.
        assert!(value.get("prompt").is_none());
        assert!(value.get("response").is_none());
    }

    #[test]
    fn round_trips_through_json() {
        let entry = TelemetryEntry::from_outcome("w", "s", Tier::Cheap, &outcome(), None);
        let line = serde_json::to_string(&entry).unwrap();
        let parsed: TelemetryEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn cost_round_trips_to_micros() {
        let entry = TelemetryEntry::from_outcome("w", "s", Tier::Cheap, &outcome(), None);
        assert_eq!(entry.cost_micros(), 15_000);
    }

    #[test]
    fn user_id_hash_is_stable_and_opaque() {
        let a = hash_user_id("dev@example.com");
        let b = hash_user_id("dev@example.com");
        let c = hash_user_id("other@example.com");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(!a.contains('@'));
    }
}
