//! Money arithmetic in integer minor units.
//!
//! Amounts are `i64` minor currency units (paise, cents). Rates are basis
//! points, so 10_000 bps is 100 %.

pub const BPS_DENOMINATOR: i64 = 10_000;

/// Largest amount accepted for a single deal: one trillion major units.
pub const MAX_DEAL_SIZE: i64 = 100_000_000_000_000;

/// Narrow an `i128` intermediate to `i64`, saturating at the bounds.
pub fn clamp_to_i64(value: i128) -> i64 {
    value.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Divide with rounding half away from zero.
pub fn div_round(numerator: i128, denominator: i128) -> i64 {
    if denominator == 0 {
        return 0;
    }
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    let rounded = if remainder.abs() * 2 >= denominator.abs() {
        if (numerator < 0) ^ (denominator < 0) {
            quotient - 1
        } else {
            quotient + 1
        }
    } else {
        quotient
    };
    clamp_to_i64(rounded)
}

/// `amount × bps / 10_000`, rounded.
pub fn apply_bps(amount: i64, bps: u32) -> i64 {
    div_round(amount as i128 * bps as i128, BPS_DENOMINATOR as i128)
}
