//! Resource quantity parsing
//!
//! Memory limits are compared after normalizing to a byte count, so "1Gi"
//! and "1073741824" describe the same limit.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid number in quantity {0:?}")]
    InvalidNumber(String),

    #[error("unknown suffix in quantity {0:?}")]
    UnknownSuffix(String),

    #[error("quantity {0:?} is out of range")]
    Overflow(String),
}

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: [(&str, i32); 7] = [
    ("m", -3),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

/// Parse a quantity such as `256Mi`, `1.5G`, `128974848` or `129e6` into
/// bytes. Fractional byte counts round up.
pub fn parse_bytes(input: &str) -> Result<u128, QuantityError> {
    let raw = input.trim();
    if raw.is_empty() {
        return Err(QuantityError::Empty);
    }

    let number_end = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(number_end);
    let (mantissa, scale) =
        parse_decimal(number).ok_or_else(|| QuantityError::InvalidNumber(input.to_string()))?;

    let overflow = || QuantityError::Overflow(input.to_string());

    if let Some((_, power)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        let multiplier = 1024u128.checked_pow(*power).ok_or_else(overflow)?;
        let scaled = mantissa.checked_mul(multiplier).ok_or_else(overflow)?;
        return Ok(div_ceil_pow10(scaled, scale));
    }

    let exponent = match suffix {
        "" => 0,
        _ if suffix.starts_with(['e', 'E']) && suffix.len() > 1 => suffix[1..]
            .parse::<i32>()
            .map_err(|_| QuantityError::UnknownSuffix(input.to_string()))?,
        _ => DECIMAL_SUFFIXES
            .iter()
            .find(|(s, _)| *s == suffix)
            .map(|(_, e)| *e)
            .ok_or_else(|| QuantityError::UnknownSuffix(input.to_string()))?,
    };

    let net = i32::try_from(scale)
        .ok()
        .and_then(|scale| exponent.checked_sub(scale))
        .ok_or_else(overflow)?;
    if net >= 0 {
        let multiplier = 10u128.checked_pow(net as u32).ok_or_else(overflow)?;
        mantissa.checked_mul(multiplier).ok_or_else(overflow)
    } else {
        Ok(div_ceil_pow10(mantissa, net.unsigned_abs()))
    }
}

/// Splits "12.345" into (12345, 3). Returns None for malformed numbers.
fn parse_decimal(number: &str) -> Option<(u128, u32)> {
    let number = number.strip_prefix('+').unwrap_or(number);
    let (whole, frac) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return None;
    }
    if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }

    let mut digits = String::with_capacity(whole.len() + frac.len());
    digits.push_str(whole);
    digits.push_str(frac);
    let mantissa = digits.parse::<u128>().ok()?;
    Some((mantissa, frac.len() as u32))
}

fn div_ceil_pow10(value: u128, power: u32) -> u128 {
    match 10u128.checked_pow(power) {
        Some(divisor) => value.div_ceil(divisor),
        // value < 10^power for any u128 once power exceeds 38
        None => u128::from(value > 0),
    }
}
