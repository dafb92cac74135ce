//! Minor-unit amounts
//!
//! Warden keeps one canonical money representation: a signed 64-bit count
//! of minor units (cents for USD, base units for tokens). Every arithmetic
//! operation is checked; overflow surfaces as [`WardenError::AmountOverflow`].

use crate::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Signed amount in minor units
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(pub i64);

impl Amount {
    /// Create an amount from minor units
    pub const fn new(minor_units: i64) -> Self {
        Self(minor_units)
    }

    /// Zero
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Raw minor units
    pub const fn minor_units(&self) -> i64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn checked_neg(self) -> Option<Self> {
        self.0.checked_neg().map(Self)
    }

    pub fn checked_abs(self) -> Option<Self> {
        self.0.checked_abs().map(Self)
    }

    /// Add, mapping overflow to an error
    pub fn try_add(self, other: Self) -> Result<Self> {
        self.checked_add(other).ok_or(WardenError::AmountOverflow)
    }

    /// Subtract, mapping overflow to an error
    pub fn try_sub(self, other: Self) -> Result<Self> {
        self.checked_sub(other).ok_or(WardenError::AmountOverflow)
    }

    /// Subtract without going below zero
    pub fn saturating_sub_floor_zero(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0).max(0))
    }

    /// Sum an iterator of amounts with overflow checking
    pub fn checked_sum<I: IntoIterator<Item = Amount>>(iter: I) -> Option<Self> {
        iter.into_iter()
            .try_fold(Self::zero(), |acc, amount| acc.checked_add(amount))
    }

    /// `|self| / base` in basis points, saturating at `i64::MAX`.
    ///
    /// Returns `None` when `base` is zero.
    pub fn ratio_bps(self, base: Self) -> Option<i64> {
        if base.0 == 0 {
            return None;
        }
        let num = (self.0 as i128).abs() * 10_000;
        let den = (base.0 as i128).abs();
        Some(i64::try_from(num / den).unwrap_or(i64::MAX))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Amount {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_arithmetic() {
        let a = Amount::new(100);
        assert_eq!(a.checked_add(Amount::new(50)), Some(Amount::new(150)));
        assert_eq!(a.checked_sub(Amount::new(150)), Some(Amount::new(-50)));
        assert_eq!(Amount::new(i64::MAX).checked_add(Amount::new(1)), None);
        assert!(matches!(
            Amount::new(i64::MIN).try_sub(Amount::new(1)),
            Err(WardenError::AmountOverflow)
        ));
    }

    #[test]
    fn test_floor_zero() {
        assert_eq!(
            Amount::new(30).saturating_sub_floor_zero(Amount::new(50)),
            Amount::zero()
        );
        assert_eq!(
            Amount::new(80).saturating_sub_floor_zero(Amount::new(30)),
            Amount::new(50)
        );
    }

    #[test]
    fn test_ratio_bps() {
        assert_eq!(Amount::new(-20).ratio_bps(Amount::new(100)), Some(2000));
        assert_eq!(Amount::new(1).ratio_bps(Amount::new(10_000)), Some(1));
        assert_eq!(Amount::new(5).ratio_bps(Amount::zero()), None);
    }

    #[test]
    fn test_checked_sum() {
        let total = Amount::checked_sum(vec![Amount::new(1), Amount::new(2), Amount::new(3)]);
        assert_eq!(total, Some(Amount::new(6)));
        assert_eq!(
            Amount::checked_sum(vec![Amount::new(i64::MAX), Amount::new(1)]),
            None
        );
    }

    #[test]
    fn test_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&Amount::new(1250)).unwrap(), "1250");
    }
}
