//! Cost, cache, and savings analytics over the ledger.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;

use maestro_types::{micros_to_decimal, ModelRegistry, TelemetryError, Tier};

use crate::entry::TelemetryEntry;
use crate::ledger::UsageLedger;

/// Per-tier call counts and cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    /// Calls recorded at this tier.
    pub calls: u64,
    /// Total cost in micro-units.
    pub cost_micros: u64,
}

/// Aggregate usage over a window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    /// Calls in the window.
    pub total_calls: u64,
    /// Per-tier breakdown.
    pub by_tier: HashMap<Tier, TierStats>,
    /// Fraction of calls served from the cache.
    pub cache_hit_rate: f64,
    /// Mean call duration in milliseconds.
    pub avg_duration_ms: f64,
}

/// The savings picture: what the window cost versus the all-PREMIUM
/// counterfactual, plus the cache's contribution.
#[derive(Debug, Clone, Serialize)]
pub struct Savings {
    /// Cost had every call run at the premium reference model, priced
    /// over the recorded token counts.
    pub baseline_cost: Decimal,
    /// What the window actually cost.
    pub actual_cost: Decimal,
    /// `baseline - actual`.
    pub absolute_savings: Decimal,
    /// `(baseline - actual) / baseline`, zero when the baseline is zero.
    pub percent_savings: f64,
    /// Cost avoided by cache hits, priced at each hit's own model.
    pub cache_savings: Decimal,
}

/// Export encoding for `telemetry export`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// One JSON array of entries.
    Json,
    /// CSV with a fixed header row.
    Csv,
}

impl UsageLedger {
    /// Entries whose timestamp falls inside the trailing window.
    async fn window_entries(&self, window: Duration) -> Result<Vec<TelemetryEntry>, TelemetryError> {
        let cutoff = Utc::now()
            - chrono::TimeDelta::from_std(window)
                .map_err(|e| TelemetryError::Serialization(e.to_string()))?;
        let mut entries = self.read_all().await?;
        entries.retain(|e| e.ts_utc >= cutoff);
        Ok(entries)
    }

    /// Aggregate usage over the trailing window.
    ///
    /// # Errors
    ///
    /// I/O failures reading ledger files.
    pub async fn stats(&self, window: Duration) -> Result<Stats, TelemetryError> {
        let entries = self.window_entries(window).await?;
        let mut stats = Stats::default();
        let mut duration_total: u128 = 0;
        let mut hits: u64 = 0;
        for entry in &entries {
            stats.total_calls += 1;
            let tier = stats.by_tier.entry(entry.tier).or_default();
            tier.calls += 1;
            tier.cost_micros += entry.cost_micros();
            duration_total += u128::from(entry.duration_ms);
            if entry.cache.hit {
                hits += 1;
            }
        }
        if stats.total_calls > 0 {
            stats.cache_hit_rate = hits as f64 / stats.total_calls as f64;
            stats.avg_duration_ms = duration_total as f64 / stats.total_calls as f64;
        }
        Ok(stats)
    }

    /// Savings versus the all-PREMIUM baseline over the trailing window.
    ///
    /// The baseline prices every recorded call's token counts at the
    /// registry's premium reference model, a user-auditable
    /// counterfactual rather than a guess.
    ///
    /// # Errors
    ///
    /// I/O failures reading ledger files.
    pub async fn savings(
        &self,
        window: Duration,
        registry: &ModelRegistry,
    ) -> Result<Savings, TelemetryError> {
        let entries = self.window_entries(window).await?;
        let premium = registry.premium_reference();

        let mut baseline_micros: u64 = 0;
        let mut actual_micros: u64 = 0;
        let mut cache_micros: u64 = 0;
        for entry in &entries {
            actual_micros += entry.cost_micros();
            if let Some(premium) = premium {
                baseline_micros += premium.cost_micros(&entry.tokens);
            }
            if entry.cache.hit
                && let Some(model) = registry.get(&entry.model_id)
            {
                cache_micros += model.cost_micros(&entry.tokens);
            }
        }

        let absolute = baseline_micros.saturating_sub(actual_micros);
        let percent = if baseline_micros > 0 {
            absolute as f64 / baseline_micros as f64
        } else {
            0.0
        };
        Ok(Savings {
            baseline_cost: micros_to_decimal(baseline_micros),
            actual_cost: micros_to_decimal(actual_micros),
            absolute_savings: micros_to_decimal(absolute),
            percent_savings: percent,
            cache_savings: micros_to_decimal(cache_micros),
        })
    }

    /// Export the trailing window as JSON or CSV.
    ///
    /// # Errors
    ///
    /// I/O failures reading ledger files; serialization failures.
    pub async fn export(
        &self,
        window: Duration,
        format: ExportFormat,
    ) -> Result<String, TelemetryError> {
        let entries = self.window_entries(window).await?;
        match format {
            ExportFormat::Json => serde_json::to_string_pretty(&entries)
                .map_err(|e| TelemetryError::Serialization(e.to_string())),
            ExportFormat::Csv => Ok(to_csv(&entries)),
        }
    }
}

fn to_csv(entries: &[TelemetryEntry]) -> String {
    let mut out = String::from(
        "ts,workflow,stage,tier,model,provider,cost,input_tokens,output_tokens,cache_hit,duration_ms\n",
    );
    for entry in entries {
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},{}\n",
            entry.ts_utc.to_rfc3339(),
            csv_field(&entry.workflow),
            csv_field(&entry.stage),
            entry.tier,
            csv_field(&entry.model_id),
            csv_field(&entry.provider),
            entry.cost,
            entry.tokens.input_tokens,
            entry.tokens.output_tokens,
            entry.cache.hit,
            entry.duration_ms,
        ));
    }
    out
}

/// Quote a field when it contains CSV metacharacters.
fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}
