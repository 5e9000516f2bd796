//! Fixed-point monetary amounts.
//!
//! Every balance, cost and deposit is an `i64` count of micro-units
//! (1.00 = 1_000_000). Decimal text and `f64` configuration values are
//! converted once at the boundary; ledger arithmetic stays integral.

use thiserror::Error;

pub const MICROS_PER_UNIT: i64 = 1_000_000;

const MAX_FRACTION_DIGITS: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid amount {raw:?}: {reason}")]
    Invalid { raw: String, reason: &'static str },
    #[error("amount {raw:?} is out of range")]
    OutOfRange { raw: String },
}

/// Parses an unsigned decimal string such as `"10.00"` or `"0.005"`.
pub fn parse_decimal(raw: &str) -> Result<i64, AmountError> {
    let trimmed = raw.trim();
    let invalid = |reason| AmountError::Invalid {
        raw: raw.to_string(),
        reason,
    };
    if trimmed.is_empty() {
        return Err(invalid("empty"));
    }

    let (whole, fraction) = match trimmed.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (trimmed, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid("no digits"));
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid("expected digits"));
    }
    if fraction.len() > MAX_FRACTION_DIGITS {
        return Err(invalid("more than 6 fractional digits"));
    }

    let out_of_range = || AmountError::OutOfRange {
        raw: raw.to_string(),
    };
    let whole_units: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| out_of_range())?
    };
    let mut fraction_micros: i64 = 0;
    if !fraction.is_empty() {
        let padded = format!("{fraction:0<width$}", width = MAX_FRACTION_DIGITS);
        fraction_micros = padded.parse().map_err(|_| out_of_range())?;
    }

    whole_units
        .checked_mul(MICROS_PER_UNIT)
        .and_then(|micros| micros.checked_add(fraction_micros))
        .ok_or_else(out_of_range)
}

/// Converts a configuration value (e.g. `0.005`) to micro-units, rounding to
/// the nearest micro.
pub fn from_f64(value: f64) -> Option<i64> {
    if !value.is_finite() {
        return None;
    }
    let micros = (value * MICROS_PER_UNIT as f64).round();
    if !micros.is_finite() || micros > i64::MAX as f64 || micros < i64::MIN as f64 {
        return None;
    }
    Some(micros as i64)
}

pub fn to_f64(micros: i64) -> f64 {
    micros as f64 / MICROS_PER_UNIT as f64
}

/// Renders an amount with a fixed number of fractional digits (at most 6),
/// truncating toward zero.
pub fn format_amount(micros: i64, fraction_digits: usize) -> String {
    let digits = fraction_digits.min(MAX_FRACTION_DIGITS);
    let sign = if micros < 0 { "-" } else { "" };
    let abs = micros.unsigned_abs();
    let whole = abs / MICROS_PER_UNIT as u64;
    if digits == 0 {
        return format!("{sign}{whole}");
    }
    let divisor = 10u64.pow((MAX_FRACTION_DIGITS - digits) as u32);
    let fraction = (abs % MICROS_PER_UNIT as u64) / divisor;
    format!("{sign}{whole}.{fraction:0width$}", width = digits)
}

/// Display form used in transaction listings: `+1.000`, `-0.005`, or `Free`.
pub fn display_amount(micros: i64) -> String {
    match micros {
        0 => "Free".to_string(),
        m if m > 0 => format!("+{}", format_amount(m, 3)),
        m => format_amount(m, 3),
    }
}
