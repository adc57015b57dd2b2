// This file is part of round-indexer.
// Copyright (C) 2025 Parlay Labs
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    iter::Sum,
    ops::Add,
    str::FromStr,
};
use thiserror::Error;

/// Fractional digits of canonical amounts and prices.
pub const AMOUNT_DECIMALS: u32 = 8;

/// Fractional digits of raw on-chain amounts.
pub const RAW_DECIMALS: u32 = 18;

/// Fractional digits of odds.
pub const ODDS_DECIMALS: u32 = 4;

/// Fee retained by the market, in basis points.
pub const FEE_BPS: u128 = 300;

const AMOUNT_SCALE: u128 = 10u128.pow(AMOUNT_DECIMALS);
const ODDS_SCALE: u128 = 10u128.pow(ODDS_DECIMALS);
const RAW_TO_AMOUNT_DIVISOR: u128 = 10u128.pow(RAW_DECIMALS - AMOUNT_DECIMALS);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("raw amount {0} exceeds the representable range")]
    Overflow(String),

    #[error("cannot parse decimal value {0}")]
    Malformed(String),
}

/// An exact fixed-point monetary amount with eight fractional digits, backed by an unsigned
/// integer. All arithmetic is integer arithmetic; values never pass through a float.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Amount(u128);

impl Amount {
    pub const ZERO: Self = Self(0);

    /// One whole unit.
    pub const ONE: Self = Self(AMOUNT_SCALE);

    /// Create an amount from an already canonically scaled integer (eight fractional digits).
    pub const fn from_scaled(scaled: u128) -> Self {
        Self(scaled)
    }

    /// Reduce a raw 18-digit on-chain value to the canonical eight digits by exact integer
    /// division; the ten least significant digits are truncated.
    pub fn from_raw(raw: U256) -> Result<Self, AmountError> {
        let reduced = raw / U256::from(RAW_TO_AMOUNT_DIVISOR);
        let scaled = u128::try_from(reduced).map_err(|_| AmountError::Overflow(raw.to_string()))?;
        Ok(Self(scaled))
    }

    pub const fn scaled(self) -> u128 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub const fn abs_diff(self, other: Self) -> Self {
        Self(self.0.abs_diff(other.0))
    }

    /// Truncate to four fractional digits, the precision at which cross-table consistency is
    /// checked.
    pub const fn truncated_4(self) -> u128 {
        self.0 / (AMOUNT_SCALE / ODDS_SCALE)
    }
}

impl Add for Amount {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{:08}",
            self.0 / AMOUNT_SCALE,
            self.0 % AMOUNT_SCALE
        )
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_fixed(s, AMOUNT_DECIMALS)
            .map(Self)
            .ok_or_else(|| AmountError::Malformed(s.to_string()))
    }
}

/// Payout odds with four fractional digits, backed by an unsigned integer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Odds(u64);

impl Odds {
    pub const ZERO: Self = Self(0);

    pub const fn from_scaled(scaled: u64) -> Self {
        Self(scaled)
    }

    pub const fn scaled(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Odds for one side: `(total · (1 − fee)) / side`, truncated to four fractional digits.
    /// Zero when the side has no stake.
    pub fn compute(total: Amount, side: Amount) -> Self {
        if side.is_zero() {
            return Self::ZERO;
        }

        let pool_after_fee = total.scaled() * (10_000 - FEE_BPS) / 10_000;
        let odds = pool_after_fee * ODDS_SCALE / side.scaled();
        Self(u64::try_from(odds).unwrap_or(u64::MAX))
    }
}

impl Display for Odds {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{:04}",
            self.0 / ODDS_SCALE as u64,
            self.0 % ODDS_SCALE as u64
        )
    }
}

impl FromStr for Odds {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_fixed(s, ODDS_DECIMALS)
            .and_then(|scaled| u64::try_from(scaled).ok())
            .map(Self)
            .ok_or_else(|| AmountError::Malformed(s.to_string()))
    }
}

/// A reference price with eight fractional digits, as reported by the price oracle. Prices can
/// be negative on the wire, hence the signed backing.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Price(i64);

impl Price {
    pub const fn from_scaled(scaled: i64) -> Self {
        Self(scaled)
    }

    pub const fn scaled(self) -> i64 {
        self.0
    }
}

impl Display for Price {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs() as u128;
        write!(f, "{sign}{}.{:08}", abs / AMOUNT_SCALE, abs % AMOUNT_SCALE)
    }
}

impl FromStr for Price {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sign, digits) = match s.strip_prefix('-') {
            Some(rest) => (-1i64, rest),
            None => (1, s),
        };

        parse_fixed(digits, AMOUNT_DECIMALS)
            .and_then(|scaled| i64::try_from(scaled).ok())
            .map(|scaled| Self(sign * scaled))
            .ok_or_else(|| AmountError::Malformed(s.to_string()))
    }
}

/// Parse a non-negative decimal string into an integer scaled by `decimals` fractional digits.
/// Excess fractional digits are rejected rather than rounded.
fn parse_fixed(s: &str, decimals: u32) -> Option<u128> {
    let (int_part, frac_part) = match s.split_once('.') {
        Some((int_part, frac_part)) => (int_part, frac_part),
        None => (s, ""),
    };

    if int_part.is_empty() || frac_part.len() > decimals as usize {
        return None;
    }

    let int = int_part.parse::<u128>().ok()?;
    let frac = if frac_part.is_empty() {
        0
    } else {
        frac_part.parse::<u128>().ok()? * 10u128.pow(decimals - frac_part.len() as u32)
    };

    int.checked_mul(10u128.pow(decimals))?.checked_add(frac)
}

#[cfg(test)]
mod tests {
    use crate::domain::{Amount, AmountError, Odds, Price};
    use alloy::primitives::U256;
    use assert_matches::assert_matches;

    #[test]
    fn test_amount_from_raw() {
        // 3 units with 18 fractional digits.
        let raw = U256::from(3_000_000_000_000_000_000u128);
        let amount = Amount::from_raw(raw).expect("raw amount is representable");
        assert_eq!(amount, Amount::from_scaled(300_000_000));
        assert_eq!(amount.to_string(), "3.00000000");

        // Truncation of the ten least significant digits.
        let raw = U256::from(1_234_567_891_234_567_890u128);
        let amount = Amount::from_raw(raw).expect("raw amount is representable");
        assert_eq!(amount.to_string(), "1.23456789");

        let overflowing = U256::MAX;
        assert_matches!(Amount::from_raw(overflowing), Err(AmountError::Overflow(_)));
    }

    #[test]
    fn test_amount_parse_display_round_trip() {
        let amount = "3.876".parse::<Amount>().expect("valid decimal");
        assert_eq!(amount, Amount::from_scaled(387_600_000));
        assert_eq!(amount.to_string(), "3.87600000");

        let amount = "42".parse::<Amount>().expect("valid decimal");
        assert_eq!(amount.to_string(), "42.00000000");

        assert_matches!("1.123456789".parse::<Amount>(), Err(_));
        assert_matches!(".5".parse::<Amount>(), Err(_));
        assert_matches!("abc".parse::<Amount>(), Err(_));
    }

    #[test]
    fn test_odds() {
        // 3 up vs 1 down: up odds (4 · 0.97) / 3 = 1.2933, down odds 3.8800.
        let total = Amount::from_scaled(400_000_000);
        let up = Amount::from_scaled(300_000_000);
        let down = Amount::from_scaled(100_000_000);

        assert_eq!(Odds::compute(total, up).to_string(), "1.2933");
        assert_eq!(Odds::compute(total, down).to_string(), "3.8800");
        assert_eq!(Odds::compute(total, Amount::ZERO), Odds::ZERO);
    }

    #[test]
    fn test_price() {
        let price = "500.00000000".parse::<Price>().expect("valid price");
        assert_eq!(price, Price::from_scaled(50_000_000_000));
        assert_eq!(price.to_string(), "500.00000000");

        let price = "-0.5".parse::<Price>().expect("valid price");
        assert_eq!(price.to_string(), "-0.50000000");
    }

    #[test]
    fn test_truncated_4() {
        let amount = Amount::from_scaled(123_456_789);
        assert_eq!(amount.truncated_4(), 12_345);
    }
}
