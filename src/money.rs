//! Fixed-point money arithmetic.
//!
//! All amounts are integer cents. Ratio math runs through i128 with a
//! 1e-6 ratio scale before the final truncation to cents, matching the
//! ledger's 2-decimal bookkeeping. Floats never touch a money path.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Basis-point scale: 10_000 bps = 100%.
pub const BPS_SCALE: i128 = 10_000;

/// Ratio scale used for proportional splits (6 decimal places).
pub const RATIO_SCALE: i128 = 1_000_000;

/// An amount of money in integer cents.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    /// Whole currency units, no fractional part.
    pub const fn from_major(units: i64) -> Self {
        Money(units * 100)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn abs(self) -> Money {
        Money(self.0.abs())
    }

    pub fn checked_add(self, rhs: Money) -> Option<Money> {
        self.0.checked_add(rhs.0).map(Money)
    }

    pub fn checked_sub(self, rhs: Money) -> Option<Money> {
        self.0.checked_sub(rhs.0).map(Money)
    }

    pub fn saturating_add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }

    pub fn saturating_sub(self, rhs: Money) -> Money {
        Money(self.0.saturating_sub(rhs.0))
    }

    /// Multiply by a basis-point rate, truncating toward zero.
    ///
    /// `Money::from_major(100).mul_bps(4000)` is 40.00.
    pub fn mul_bps(self, bps: u32) -> Money {
        let v = (self.0 as i128) * (bps as i128) / BPS_SCALE;
        Money(clamp_i64(v))
    }

    /// Grow by a basis-point rate: `x * (1 + bps/10_000)`, truncating.
    ///
    /// This is the threshold compounding step; 10_000.00 grown by 1500
    /// bps is 11_500.00.
    pub fn grow_bps(self, bps: u32) -> Money {
        let v = (self.0 as i128) * (BPS_SCALE + bps as i128) / BPS_SCALE;
        Money(clamp_i64(v))
    }

    /// Proportional share of `self` for `weight` out of `total_weight`.
    ///
    /// The ratio is truncated to 6 decimals first, then the product is
    /// truncated to cents, so repeated shares always undershoot and the
    /// residual can be assigned to the final participant.
    pub fn share(self, weight: u128, total_weight: u128) -> Money {
        if total_weight == 0 {
            return Money::ZERO;
        }
        let ratio = (weight as i128) * RATIO_SCALE / (total_weight as i128);
        let v = (self.0 as i128) * ratio / RATIO_SCALE;
        Money(clamp_i64(v))
    }

    /// Equal split of `self` across `n` recipients, truncating.
    pub fn split_equal(self, n: usize) -> Money {
        if n == 0 {
            return Money::ZERO;
        }
        Money(self.0 / n as i64)
    }
}

fn clamp_i64(v: i128) -> i64 {
    if v > i64::MAX as i128 {
        i64::MAX
    } else if v < i64::MIN as i128 {
        i64::MIN
    } else {
        v as i64
    }
}

impl std::ops::Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Money::saturating_add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

/// Parse error for decimal money strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMoneyError(String);

impl fmt::Display for ParseMoneyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid money amount: {}", self.0)
    }
}

impl std::error::Error for ParseMoneyError {}

impl FromStr for Money {
    type Err = ParseMoneyError;

    /// Accepts `"123"`, `"123.4"`, `"123.45"` and a leading minus.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let (neg, body) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        if body.is_empty() {
            return Err(ParseMoneyError(s.to_string()));
        }
        let (units_str, frac_str) = match body.split_once('.') {
            Some((u, f)) => (u, f),
            None => (body, ""),
        };
        if frac_str.len() > 2 {
            return Err(ParseMoneyError(s.to_string()));
        }
        let units: i64 = units_str
            .parse()
            .map_err(|_| ParseMoneyError(s.to_string()))?;
        let frac: i64 = if frac_str.is_empty() {
            0
        } else {
            let padded = format!("{:0<2}", frac_str);
            padded.parse().map_err(|_| ParseMoneyError(s.to_string()))?
        };
        let cents = units
            .checked_mul(100)
            .and_then(|v| v.checked_add(frac))
            .ok_or_else(|| ParseMoneyError(s.to_string()))?;
        Ok(Money(if neg { -cents } else { cents }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        assert_eq!(Money::from_cents(1234).to_string(), "12.34");
        assert_eq!(Money::from_cents(-5).to_string(), "-0.05");
        assert_eq!("100".parse::<Money>().unwrap(), Money::from_major(100));
        assert_eq!("0.4".parse::<Money>().unwrap(), Money::from_cents(40));
        assert_eq!("-12.34".parse::<Money>().unwrap(), Money::from_cents(-1234));
        assert!("1.234".parse::<Money>().is_err());
        assert!("".parse::<Money>().is_err());
    }

    #[test]
    fn test_mul_bps_truncates() {
        // 40% of 99.99 = 39.996 -> 39.99
        assert_eq!(Money::from_cents(9999).mul_bps(4000), Money::from_cents(3999));
        assert_eq!(Money::from_major(100).mul_bps(4000), Money::from_major(40));
    }

    #[test]
    fn test_grow_bps() {
        assert_eq!(
            Money::from_major(10_000).grow_bps(1500),
            Money::from_major(11_500)
        );
        // 1.15 * 0.01 = 0.0115 -> truncated to 0.01
        assert_eq!(Money::from_cents(1).grow_bps(1500), Money::from_cents(1));
    }

    #[test]
    fn test_share_truncates_like_bc() {
        // weights 10/100 of 100.00: ratio 0.100000, amount 10.00
        let total = Money::from_major(100);
        assert_eq!(total.share(10, 100), Money::from_major(10));
        // 1/3 of 1.00: ratio 0.333333, amount 0.33
        assert_eq!(Money::from_major(1).share(1, 3), Money::from_cents(33));
        assert_eq!(total.share(5, 0), Money::ZERO);
    }

    #[test]
    fn test_split_equal() {
        assert_eq!(Money::from_major(10).split_equal(3), Money::from_cents(333));
        assert_eq!(Money::from_major(10).split_equal(0), Money::ZERO);
    }
}
