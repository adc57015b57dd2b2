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

use crate::domain::{Amount, Epoch, Odds, Price};
use alloy::primitives::{Address, B256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Claim count within one observation epoch at which a wallet is flagged as a multi-claimer.
pub const MULTI_CLAIM_MIN_COUNT: u32 = 5;

/// Cumulative claimed amount within one observation epoch at which a wallet is flagged as a
/// multi-claimer.
pub const MULTI_CLAIM_MIN_TOTAL: Amount = Amount::ONE;

/// A bettor wallet: the lowercased, `0x` prefixed hex rendering of a 20-byte address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Wallet(String);

impl Wallet {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Address> for Wallet {
    fn from(address: Address) -> Self {
        Self(format!("{address:#x}"))
    }
}

impl From<&str> for Wallet {
    fn from(s: &str) -> Self {
        Self(s.to_lowercase())
    }
}

impl Display for Wallet {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The direction of a stake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The settled direction of a round: UP when the close price exceeds the lock price, DOWN
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoundOutcome {
    Up,
    Down,
}

impl RoundOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
        }
    }

    /// Whether a stake in the given direction won this round.
    pub const fn wins(self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (Self::Up, Direction::Up) | (Self::Down, Direction::Down)
        )
    }
}

/// The result of a single bet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BetOutcome {
    Win,
    Loss,
}

impl BetOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Win => "WIN",
            Self::Loss => "LOSS",
        }
    }
}

/// The canonical per-epoch aggregate record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Round {
    pub epoch: Epoch,
    pub start_time: DateTime<Utc>,
    pub lock_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub lock_price: Option<Price>,
    pub close_price: Option<Price>,
    pub outcome: RoundOutcome,
    pub total_amount: Amount,
    pub up_amount: Amount,
    pub down_amount: Amount,
    pub up_odds: Odds,
    pub down_odds: Odds,
}

/// A single directional stake by a wallet within an epoch, keyed by
/// `(epoch, tx_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bet {
    pub epoch: Epoch,
    pub tx_hash: B256,
    pub log_index: u64,
    pub bet_time: DateTime<Utc>,
    pub sender: Wallet,
    pub direction: Direction,
    pub amount: Amount,
    pub outcome: BetOutcome,
    pub block_height: u64,
}

/// A single payout withdrawal observed in `epoch`, settling winnings from the (usually earlier)
/// `bet_epoch`. A single transaction may settle several bet epochs for one wallet, so the
/// uniqueness key is `(epoch, tx_hash, log_index, bet_epoch)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub epoch: Epoch,
    pub bet_epoch: Epoch,
    pub tx_hash: B256,
    pub log_index: u64,
    pub claim_time: DateTime<Utc>,
    pub sender: Wallet,
    pub amount: Amount,
}

/// A derived marker for a wallet whose aggregate claim activity within one observation epoch
/// crossed the multi-claim thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiClaim {
    pub epoch: Epoch,
    pub sender: Wallet,
    pub claim_count: u32,
    pub total_amount: Amount,
}

/// Derive [MultiClaim] rows from the claims of one observation epoch: a row per wallet with
/// at least [MULTI_CLAIM_MIN_COUNT] claims or a cumulative amount of at least
/// [MULTI_CLAIM_MIN_TOTAL]. Output is ordered by wallet for deterministic persistence.
pub fn derive_multi_claims(epoch: Epoch, claims: &[Claim]) -> Vec<MultiClaim> {
    let mut by_sender = std::collections::BTreeMap::<&Wallet, (u32, Amount)>::new();

    for claim in claims {
        let (count, total) = by_sender.entry(&claim.sender).or_insert((0, Amount::ZERO));
        *count += 1;
        *total = *total + claim.amount;
    }

    by_sender
        .into_iter()
        .filter(|(_, (count, total))| {
            *count >= MULTI_CLAIM_MIN_COUNT || *total >= MULTI_CLAIM_MIN_TOTAL
        })
        .map(|(sender, (claim_count, total_amount))| MultiClaim {
            epoch,
            sender: sender.clone(),
            claim_count,
            total_amount,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::domain::{
        Amount, Claim, Direction, RoundOutcome, Wallet, derive_multi_claims,
    };
    use alloy::primitives::{Address, B256};
    use chrono::Utc;

    fn claim(sender: &Wallet, log_index: u64, amount: Amount) -> Claim {
        Claim {
            epoch: 426_238,
            bet_epoch: 426_236,
            tx_hash: B256::ZERO,
            log_index,
            claim_time: Utc::now(),
            sender: sender.clone(),
            amount,
        }
    }

    #[test]
    fn test_wallet_lowercase() {
        let wallet = Wallet::from("0xAbCdEf0123456789aBcDeF0123456789abcdef01");
        assert_eq!(wallet.as_str(), "0xabcdef0123456789abcdef0123456789abcdef01");

        let address = "0xAbCdEf0123456789aBcDeF0123456789abcdef01"
            .parse::<Address>()
            .expect("valid address");
        assert_eq!(Wallet::from(address), wallet);
    }

    #[test]
    fn test_outcome_wins() {
        assert!(RoundOutcome::Up.wins(Direction::Up));
        assert!(!RoundOutcome::Up.wins(Direction::Down));
        assert!(RoundOutcome::Down.wins(Direction::Down));
        assert!(!RoundOutcome::Down.wins(Direction::Up));
    }

    #[test]
    fn test_derive_multi_claims_by_count() {
        let wallet = Wallet::from("0x1111111111111111111111111111111111111111");
        let other = Wallet::from("0x2222222222222222222222222222222222222222");

        let mut claims = (0..5)
            .map(|i| claim(&wallet, i, Amount::from_scaled(1_000_000)))
            .collect::<Vec<_>>();
        claims.push(claim(&other, 5, Amount::from_scaled(1_000_000)));

        let multi_claims = derive_multi_claims(426_238, &claims);
        assert_eq!(multi_claims.len(), 1);
        assert_eq!(multi_claims[0].sender, wallet);
        assert_eq!(multi_claims[0].claim_count, 5);
        assert_eq!(multi_claims[0].total_amount, Amount::from_scaled(5_000_000));
    }

    #[test]
    fn test_derive_multi_claims_by_total() {
        let wallet = Wallet::from("0x1111111111111111111111111111111111111111");

        // A single claim of one unit crosses the total threshold.
        let claims = vec![claim(&wallet, 0, Amount::ONE)];

        let multi_claims = derive_multi_claims(426_238, &claims);
        assert_eq!(multi_claims.len(), 1);
        assert_eq!(multi_claims[0].claim_count, 1);
        assert_eq!(multi_claims[0].total_amount, Amount::ONE);
    }

    #[test]
    fn test_derive_multi_claims_below_thresholds() {
        let wallet = Wallet::from("0x1111111111111111111111111111111111111111");

        let claims = (0..4)
            .map(|i| claim(&wallet, i, Amount::from_scaled(1_000_000)))
            .collect::<Vec<_>>();

        assert!(derive_multi_claims(426_238, &claims).is_empty());
    }
}
