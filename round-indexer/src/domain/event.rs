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

use crate::domain::{Amount, Epoch, Price, Wallet};
use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use std::fmt::{self, Display, Formatter};

/// The six event streams emitted by the market contract. Decoding is uniform across streams;
/// only the signature-to-filter mapping differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStream {
    RoundStart,
    RoundLock,
    RoundEnd,
    StakeUp,
    StakeDown,
    Claim,
}

impl EventStream {
    pub const ALL: [Self; 6] = [
        Self::RoundStart,
        Self::RoundLock,
        Self::RoundEnd,
        Self::StakeUp,
        Self::StakeDown,
        Self::Claim,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RoundStart => "round_start",
            Self::RoundLock => "round_lock",
            Self::RoundEnd => "round_end",
            Self::StakeUp => "stake_up",
            Self::StakeDown => "stake_down",
            Self::Claim => "claim",
        }
    }
}

impl Display for EventStream {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded contract event before timestamp attachment and amount normalization. All six
/// streams share this shape; fields not carried by a stream are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// The epoch embedded in the event. For stake and boundary events this is the epoch the
    /// event belongs to; for claim events it is the epoch whose winnings are being withdrawn.
    pub epoch: Epoch,
    pub sender: Option<Address>,
    pub amount: Option<U256>,
    pub price: Option<Price>,
    pub block_height: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

/// A round boundary event (start, lock or end) with its block timestamp attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryEvent {
    pub epoch: Epoch,
    pub price: Option<Price>,
    pub block_height: u64,
    pub timestamp: DateTime<Utc>,
    pub tx_hash: B256,
    pub log_index: u64,
}

/// A stake event, normalized to the canonical amount scale, with its block timestamp attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeEvent {
    pub epoch: Epoch,
    pub sender: Wallet,
    pub amount: Amount,
    pub block_height: u64,
    pub timestamp: DateTime<Utc>,
    pub tx_hash: B256,
    pub log_index: u64,
}

/// A claim event. The embedded epoch is the bet epoch being settled; the observation epoch is
/// determined by the block range the event was harvested from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimEvent {
    pub bet_epoch: Epoch,
    pub sender: Wallet,
    pub amount: Amount,
    pub block_height: u64,
    pub timestamp: DateTime<Utc>,
    pub tx_hash: B256,
    pub log_index: u64,
}

/// The harvested events of one epoch's block range, grouped by stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpochEvents {
    pub starts: Vec<BoundaryEvent>,
    pub locks: Vec<BoundaryEvent>,
    pub ends: Vec<BoundaryEvent>,
    pub stake_ups: Vec<StakeEvent>,
    pub stake_downs: Vec<StakeEvent>,
    pub claims: Vec<ClaimEvent>,
}

impl EpochEvents {
    pub fn event_count(&self) -> usize {
        self.starts.len()
            + self.locks.len()
            + self.ends.len()
            + self.stake_ups.len()
            + self.stake_downs.len()
            + self.claims.len()
    }
}
