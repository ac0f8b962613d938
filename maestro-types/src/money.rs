//! Integer micro-unit money arithmetic.
//!
//! Prices are configured as [`Decimal`] values in the canonical currency
//! unit. Everything downstream of configuration works in `u64` micro-units
//! (one millionth of the unit) so cost sums never drift.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

/// Micro-units per canonical currency unit.
const MICROS_PER_UNIT: u64 = 1_000_000;

/// Convert a decimal currency amount to integer micro-units, rounding to
/// the nearest micro.
///
/// Returns `None` for negative amounts or amounts too large for `u64`.
/// Configuration validation rejects such prices up front, so downstream
/// code may treat a `None` here as zero.
#[must_use]
pub fn decimal_to_micros(value: Decimal) -> Option<u64> {
    if value.is_sign_negative() {
        return None;
    }
    (value * Decimal::from(MICROS_PER_UNIT)).round().to_u64()
}

/// Convert integer micro-units back to a decimal currency amount.
///
/// Used only at the wire surface (telemetry lines, analytics summaries).
#[must_use]
pub fn micros_to_decimal(micros: u64) -> Decimal {
    Decimal::from(micros) / Decimal::from(MICROS_PER_UNIT)
}

/// Ceiling division on u128, for per-token cost math.
///
/// `tokens × price_micros_per_million / 1_000_000`, rounded up so cost is
/// never under-counted.
#[must_use]
pub(crate) fn ceil_div(numerator: u128, denominator: u128) -> u64 {
    let result = numerator.div_ceil(denominator);
    u64::try_from(result).unwrap_or(u64::MAX)
}
