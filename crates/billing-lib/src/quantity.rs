//! Resource quantity parsing
//!
//! Converts cluster quantity strings ("250m", "512Mi", "1e3", "2") into exact
//! decimal values expressed in base units (cores, bytes, devices). Values are
//! kept as `rust_decimal::Decimal` so that summing many small requests never
//! drifts the way floating point would.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Largest decimal exponent accepted in `<n>e<exp>` notation
const MAX_EXPONENT: i32 = 28;

/// Errors produced while parsing a quantity string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid number in quantity '{0}'")]
    InvalidNumber(String),
    #[error("unknown suffix '{suffix}' in quantity '{raw}'")]
    UnknownSuffix { raw: String, suffix: String },
    #[error("negative quantity '{0}'")]
    Negative(String),
    #[error("quantity '{0}' is out of range")]
    OutOfRange(String),
}

/// An exact, non-negative resource amount in base units
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Quantity(Decimal);

impl Quantity {
    /// Zero quantity
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);

    /// Wrap an already-normalized decimal value
    pub fn from_decimal(value: Decimal) -> Self {
        Self(value.normalize())
    }

    /// Parse a quantity string using the cluster quantity grammar
    pub fn parse(raw: &str) -> Result<Self, QuantityError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(QuantityError::Empty);
        }
        if trimmed.starts_with('-') {
            return Err(QuantityError::Negative(raw.to_string()));
        }
        let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);

        let split = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(split);

        let value = parse_number(number).ok_or_else(|| QuantityError::InvalidNumber(raw.to_string()))?;
        let multiplier = suffix_multiplier(suffix).ok_or_else(|| QuantityError::UnknownSuffix {
            raw: raw.to_string(),
            suffix: suffix.to_string(),
        })?;

        value
            .checked_mul(multiplier)
            .map(Self::from_decimal)
            .ok_or_else(|| QuantityError::OutOfRange(raw.to_string()))
    }

    /// The decimal value in base units
    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Add two quantities, returning `None` on overflow
    pub fn checked_add(self, other: Quantity) -> Option<Quantity> {
        self.0.checked_add(other.0).map(Self::from_decimal)
    }
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse the numeric part: digits with at most one decimal point
fn parse_number(number: &str) -> Option<Decimal> {
    if number.is_empty() || number == "." || number.matches('.').count() > 1 {
        return None;
    }
    let mut normalized = String::with_capacity(number.len() + 2);
    if number.starts_with('.') {
        normalized.push('0');
    }
    normalized.push_str(number.strip_suffix('.').unwrap_or(number));
    Decimal::from_str(&normalized).ok()
}

/// Multiplier for a quantity suffix, `None` if the suffix is not recognized
fn suffix_multiplier(suffix: &str) -> Option<Decimal> {
    let multiplier = match suffix {
        "" => Decimal::ONE,
        "n" => Decimal::new(1, 9),
        "u" => Decimal::new(1, 6),
        "m" => Decimal::new(1, 3),
        "k" => Decimal::from(1_000u64),
        "M" => Decimal::from(1_000_000u64),
        "G" => Decimal::from(1_000_000_000u64),
        "T" => Decimal::from(1_000_000_000_000u64),
        "P" => Decimal::from(1_000_000_000_000_000u64),
        "E" => Decimal::from(1_000_000_000_000_000_000u64),
        "Ki" => Decimal::from(1u64 << 10),
        "Mi" => Decimal::from(1u64 << 20),
        "Gi" => Decimal::from(1u64 << 30),
        "Ti" => Decimal::from(1u64 << 40),
        "Pi" => Decimal::from(1u64 << 50),
        "Ei" => Decimal::from(1u64 << 60),
        other => return exponent_multiplier(other),
    };
    Some(multiplier)
}

/// Decimal exponent notation: `e3`, `E-2`, `e+6`
fn exponent_multiplier(suffix: &str) -> Option<Decimal> {
    let digits = suffix.strip_prefix(['e', 'E'])?;
    if digits.is_empty() {
        return None;
    }
    let exponent: i32 = digits.parse().ok()?;
    if exponent.abs() > MAX_EXPONENT {
        return None;
    }

    if exponent < 0 {
        return Some(Decimal::new(1, exponent.unsigned_abs()));
    }
    let mut multiplier = Decimal::ONE;
    for _ in 0..exponent {
        multiplier = multiplier.checked_mul(Decimal::TEN)?;
    }
    Some(multiplier)
}
