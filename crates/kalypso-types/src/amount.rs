use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-point scale for weights, shares and rates (1e18 = 1.0).
pub const WEIGHT_SCALE: u128 = 1_000_000_000_000_000_000;

/// `a * b / d` without overflowing the intermediate product as long as
/// `(d - 1) * b` fits in a u128.
pub fn mul_div(a: u128, b: u128, d: u128, round_up: bool) -> Option<u128> {
    if d == 0 {
        return None;
    }
    let q = a / d;
    let r = a % d;
    let hi = q.checked_mul(b)?;
    let lo_num = r.checked_mul(b)?;
    let mut out = hi.checked_add(lo_num / d)?;
    if round_up && lo_num % d != 0 {
        out = out.checked_add(1)?;
    }
    Some(out)
}

/// Token quantity in base units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TokenAmount(u128);

impl TokenAmount {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u128::MAX);

    pub const fn from_base_units(units: u128) -> Self {
        Self(units)
    }

    /// Whole tokens at 18 decimals.
    pub fn from_tokens(tokens: u64) -> Self {
        Self(tokens as u128 * WEIGHT_SCALE)
    }

    pub fn to_base_units(&self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(&self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(&self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_add(&self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(&self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Scale by a 1e18-based rate, rounding down.
    pub fn apply_rate(&self, rate: u128) -> Option<Self> {
        mul_div(self.0, rate, WEIGHT_SCALE, false).map(Self)
    }

    /// Invert `apply_rate`: smallest amount whose scaled value covers `self`.
    pub fn unapply_rate_ceil(&self, rate: u128) -> Option<Self> {
        mul_div(self.0, WEIGHT_SCALE, rate, true).map(Self)
    }

    /// `self * numerator / denominator`, rounding down.
    pub fn proportion(&self, numerator: u128, denominator: u128) -> Option<Self> {
        mul_div(self.0, numerator, denominator, false).map(Self)
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u128> for TokenAmount {
    fn from(units: u128) -> Self {
        Self(units)
    }
}

impl std::iter::Sum for TokenAmount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, x| acc.saturating_add(x))
    }
}
