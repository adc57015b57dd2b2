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

use crate::domain::{
    Amount, Bet, BetOutcome, Claim, ClaimEvent, Direction, Epoch, EpochEvents, EventStream,
    MultiClaim, Odds, Price, Round, RoundOutcome, StakeEvent, derive_multi_claims,
    node::RoundMeta,
};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::Deserialize;
use std::{
    collections::HashSet,
    fmt::{self, Display, Formatter},
};
use thiserror::Error;

/// Tolerance of the sum law, in canonically scaled units (10⁻⁴ of a unit).
const SUM_TOLERANCE_SCALED: u128 = 10_000;

/// Configuration for epoch validation.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// How far the epoch embedded in a boundary event may differ from the target.
    #[serde(default = "epoch_tolerance_default")]
    pub epoch_tolerance: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            epoch_tolerance: epoch_tolerance_default(),
        }
    }
}

const fn epoch_tolerance_default() -> u64 {
    20
}

/// One enumerated validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationReason {
    #[error("no round start event observed")]
    NoRoundStart,

    #[error("no stake events observed")]
    NoBets,

    #[error("{stream} event in epoch {epoch} exceeds tolerance around target {target}")]
    BoundaryEpochOutOfRange {
        stream: EventStream,
        epoch: Epoch,
        target: Epoch,
    },

    #[error("{stream} event {tx_hash}#{log_index} has an empty sender")]
    EmptySender {
        stream: EventStream,
        tx_hash: String,
        log_index: u64,
    },

    #[error("{stream} event {tx_hash}#{log_index} has a non-positive amount")]
    NonPositiveAmount {
        stream: EventStream,
        tx_hash: String,
        log_index: u64,
    },

    #[error("claim event {tx_hash}#{log_index} has a zero bet epoch")]
    ZeroBetEpoch { tx_hash: String, log_index: u64 },

    #[error("round total {round_total} deviates from bet sum {bet_sum} beyond tolerance")]
    SumMismatch {
        round_total: Amount,
        bet_sum: Amount,
    },

    #[error("{direction} side total {side_total} deviates from its bet sum {bet_sum}")]
    SideSumMismatch {
        direction: Direction,
        side_total: Amount,
        bet_sum: Amount,
    },

    #[error("{direction} side has stake {side_total} but zero odds")]
    ZeroOddsWithStake {
        direction: Direction,
        side_total: Amount,
    },

    #[error("bet count {bet_count} does not equal up {up_count} plus down {down_count}")]
    BetCountMismatch {
        bet_count: usize,
        up_count: usize,
        down_count: usize,
    },
}

/// Validation failure: the list of every reason found, never just the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub reasons: Vec<ValidationReason>,
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "epoch validation failed: ")?;
        write!(f, "{}", self.reasons.iter().join("; "))
    }
}

impl std::error::Error for ValidationError {}

/// A non-fatal observation recorded alongside a successful validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warning {
    MissingLockPrice,
    MissingClosePrice,
    OutcomeDefaulted,
}

impl Display for Warning {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let s = match self {
            Self::MissingLockPrice => "lock price missing",
            Self::MissingClosePrice => "close price missing",
            Self::OutcomeDefaulted => "outcome defaulted to UP",
        };
        f.write_str(s)
    }
}

/// The canonical record sets produced by a successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedEpoch {
    pub round: Round,
    pub bets: Vec<Bet>,
    pub claims: Vec<Claim>,
    pub multi_claims: Vec<MultiClaim>,
    pub warnings: Vec<Warning>,
}

/// Check structural completeness and cross-stream consistency of an epoch's events and produce
/// the canonical records. Prices come from the round metadata, falling back to the price
/// embedded in the matching boundary event; missing prices are reported as a warning, never
/// replaced with external data.
pub fn validate(
    target_epoch: Epoch,
    events: &EpochEvents,
    meta: &RoundMeta,
    config: &Config,
) -> Result<ValidatedEpoch, ValidationError> {
    let mut reasons = Vec::new();
    let mut warnings = Vec::new();

    check_boundaries(target_epoch, events, config, &mut reasons);
    check_stakes(EventStream::StakeUp, &events.stake_ups, &mut reasons);
    check_stakes(EventStream::StakeDown, &events.stake_downs, &mut reasons);
    check_claims(&events.claims, &mut reasons);

    if events.stake_ups.is_empty() && events.stake_downs.is_empty() {
        reasons.push(ValidationReason::NoBets);
    }

    let up_amount = side_sum(&events.stake_ups, target_epoch);
    let down_amount = side_sum(&events.stake_downs, target_epoch);
    let total_amount = up_amount + down_amount;

    let (lock_price, close_price) = prices(target_epoch, events, meta, &mut warnings);

    let outcome = match (lock_price, close_price) {
        (Some(lock), Some(close)) => {
            if close > lock {
                RoundOutcome::Up
            } else {
                RoundOutcome::Down
            }
        }
        _ => {
            warnings.push(Warning::OutcomeDefaulted);
            RoundOutcome::Up
        }
    };

    let round = Round {
        epoch: target_epoch,
        start_time: wall_clock(meta.start_ts),
        lock_time: wall_clock(meta.lock_ts),
        close_time: wall_clock(meta.close_ts),
        lock_price,
        close_price,
        outcome,
        total_amount,
        up_amount,
        down_amount,
        up_odds: Odds::compute(total_amount, up_amount),
        down_odds: Odds::compute(total_amount, down_amount),
    };

    let bets = bets(target_epoch, events, outcome);
    let claims = claims(target_epoch, &events.claims);
    let multi_claims = derive_multi_claims(target_epoch, &claims);

    check_consistency(&round, &bets, &mut reasons);

    if reasons.is_empty() {
        Ok(ValidatedEpoch {
            round,
            bets,
            claims,
            multi_claims,
            warnings,
        })
    } else {
        Err(ValidationError { reasons })
    }
}

fn check_boundaries(
    target_epoch: Epoch,
    events: &EpochEvents,
    config: &Config,
    reasons: &mut Vec<ValidationReason>,
) {
    let streams = [
        (EventStream::RoundStart, &events.starts),
        (EventStream::RoundLock, &events.locks),
        (EventStream::RoundEnd, &events.ends),
    ];

    for (stream, boundary_events) in streams {
        for event in boundary_events.iter() {
            if event.epoch.abs_diff(target_epoch) > config.epoch_tolerance {
                reasons.push(ValidationReason::BoundaryEpochOutOfRange {
                    stream,
                    epoch: event.epoch,
                    target: target_epoch,
                });
            }
        }
    }

    if !events
        .starts
        .iter()
        .any(|event| event.epoch.abs_diff(target_epoch) <= config.epoch_tolerance)
    {
        reasons.push(ValidationReason::NoRoundStart);
    }
}

fn check_stakes(
    stream: EventStream,
    stakes: &[StakeEvent],
    reasons: &mut Vec<ValidationReason>,
) {
    for stake in stakes {
        if stake.sender.as_str().is_empty() {
            reasons.push(ValidationReason::EmptySender {
                stream,
                tx_hash: format!("{:#x}", stake.tx_hash),
                log_index: stake.log_index,
            });
        }
        if stake.amount.is_zero() {
            reasons.push(ValidationReason::NonPositiveAmount {
                stream,
                tx_hash: format!("{:#x}", stake.tx_hash),
                log_index: stake.log_index,
            });
        }
    }
}

fn check_claims(claims: &[ClaimEvent], reasons: &mut Vec<ValidationReason>) {
    for claim in claims {
        if claim.sender.as_str().is_empty() {
            reasons.push(ValidationReason::EmptySender {
                stream: EventStream::Claim,
                tx_hash: format!("{:#x}", claim.tx_hash),
                log_index: claim.log_index,
            });
        }
        if claim.amount.is_zero() {
            reasons.push(ValidationReason::NonPositiveAmount {
                stream: EventStream::Claim,
                tx_hash: format!("{:#x}", claim.tx_hash),
                log_index: claim.log_index,
            });
        }
        if claim.bet_epoch == 0 {
            reasons.push(ValidationReason::ZeroBetEpoch {
                tx_hash: format!("{:#x}", claim.tx_hash),
                log_index: claim.log_index,
            });
        }
    }
}

fn side_sum(stakes: &[StakeEvent], target_epoch: Epoch) -> Amount {
    stakes
        .iter()
        .filter(|stake| stake.epoch == target_epoch)
        .map(|stake| stake.amount)
        .sum()
}

/// Lock and close prices: round metadata first, then the price embedded in the matching
/// boundary event of the target epoch.
fn prices(
    target_epoch: Epoch,
    events: &EpochEvents,
    meta: &RoundMeta,
    warnings: &mut Vec<Warning>,
) -> (Option<Price>, Option<Price>) {
    let event_price = |boundary_events: &[crate::domain::BoundaryEvent]| {
        boundary_events
            .iter()
            .find(|event| event.epoch == target_epoch)
            .and_then(|event| event.price)
    };

    let lock_price = meta.lock_price.or_else(|| event_price(&events.locks));
    let close_price = meta
        .close_price
        .filter(|_| meta.oracle_called)
        .or_else(|| event_price(&events.ends));

    if lock_price.is_none() {
        warnings.push(Warning::MissingLockPrice);
    }
    if close_price.is_none() {
        warnings.push(Warning::MissingClosePrice);
    }

    (lock_price, close_price)
}

fn bets(target_epoch: Epoch, events: &EpochEvents, outcome: RoundOutcome) -> Vec<Bet> {
    let stream_bets = |stakes: &[StakeEvent], direction: Direction| {
        stakes
            .iter()
            .filter(|stake| stake.epoch == target_epoch)
            .map(|stake| Bet {
                epoch: target_epoch,
                tx_hash: stake.tx_hash,
                log_index: stake.log_index,
                bet_time: stake.timestamp,
                sender: stake.sender.clone(),
                direction,
                amount: stake.amount,
                outcome: if outcome.wins(direction) {
                    BetOutcome::Win
                } else {
                    BetOutcome::Loss
                },
                block_height: stake.block_height,
            })
            .collect::<Vec<_>>()
    };

    let mut bets = stream_bets(&events.stake_ups, Direction::Up);
    bets.extend(stream_bets(&events.stake_downs, Direction::Down));
    bets
}

/// Claim rows for the observation epoch, deduplicated by `(tx_hash, log_index, bet_epoch)` so
/// a legacy pair-only schema cannot double-insert within one commit.
fn claims(target_epoch: Epoch, events: &[ClaimEvent]) -> Vec<Claim> {
    let mut seen = HashSet::new();

    events
        .iter()
        .filter(|event| seen.insert((event.tx_hash, event.log_index, event.bet_epoch)))
        .map(|event| Claim {
            epoch: target_epoch,
            bet_epoch: event.bet_epoch,
            tx_hash: event.tx_hash,
            log_index: event.log_index,
            claim_time: event.timestamp,
            sender: event.sender.clone(),
            amount: event.amount,
        })
        .collect()
}

fn check_consistency(round: &Round, bets: &[Bet], reasons: &mut Vec<ValidationReason>) {
    let bet_sum = bets.iter().map(|bet| bet.amount).sum::<Amount>();
    if round.total_amount.abs_diff(bet_sum).scaled() > SUM_TOLERANCE_SCALED {
        reasons.push(ValidationReason::SumMismatch {
            round_total: round.total_amount,
            bet_sum,
        });
    }

    let sides = [
        (Direction::Up, round.up_amount, round.up_odds),
        (Direction::Down, round.down_amount, round.down_odds),
    ];

    let mut up_count = 0;
    let mut down_count = 0;
    for bet in bets {
        match bet.direction {
            Direction::Up => up_count += 1,
            Direction::Down => down_count += 1,
        }
    }

    for (direction, side_total, odds) in sides {
        let side_bet_sum = bets
            .iter()
            .filter(|bet| bet.direction == direction)
            .map(|bet| bet.amount)
            .sum::<Amount>();

        if side_bet_sum.truncated_4() != side_total.truncated_4() {
            reasons.push(ValidationReason::SideSumMismatch {
                direction,
                side_total,
                bet_sum: side_bet_sum,
            });
        }

        if !side_total.is_zero() && odds.is_zero() {
            reasons.push(ValidationReason::ZeroOddsWithStake {
                direction,
                side_total,
            });
        }
    }

    if bets.len() != up_count + down_count {
        reasons.push(ValidationReason::BetCountMismatch {
            bet_count: bets.len(),
            up_count,
            down_count,
        });
    }
}

fn wall_clock(secs: u64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs as i64, 0).unwrap_or_default()
}
