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
    Amount, BoundaryEvent, ClaimEvent, Epoch, EpochEvents, EventStream, RawEvent, StakeEvent,
    Wallet,
    locator::{BlockLocator, BlockRange},
    node::{ChainNode, NodeError, with_retry},
};
use chrono::{DateTime, Utc};
use log::debug;
use serde::Deserialize;
use std::{collections::HashMap, time::Duration};
use tokio::time::sleep;

/// Configuration for the event harvester.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Ranges longer than this are split into contiguous windows.
    #[serde(default = "max_blocks_per_window_default")]
    pub max_blocks_per_window: u64,

    /// Within a window, log queries are sliced into segments of this many blocks.
    #[serde(default = "slice_size_default")]
    pub slice_size: u64,

    /// Pause between log slices, the backpressure mechanism toward the RPC provider.
    #[serde(default = "slice_sleep_ms_default")]
    pub slice_sleep_ms: u64,

    /// Batch size for block header lookups.
    #[serde(default = "block_header_batch_default")]
    pub block_header_batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_blocks_per_window: max_blocks_per_window_default(),
            slice_size: slice_size_default(),
            slice_sleep_ms: slice_sleep_ms_default(),
            block_header_batch: block_header_batch_default(),
        }
    }
}

const fn max_blocks_per_window_default() -> u64 {
    100_000
}

const fn slice_size_default() -> u64 {
    20_000
}

const fn slice_sleep_ms_default() -> u64 {
    180
}

const fn block_header_batch_default() -> usize {
    200
}

/// Pulls the six event streams for a block range, attaches block timestamps via batched header
/// lookup and normalizes amounts and wallets.
#[derive(Clone)]
pub struct Harvester<N> {
    node: N,
    locator: BlockLocator<N>,
    config: Config,
}

impl<N> Harvester<N>
where
    N: ChainNode,
{
    pub fn new(node: N, locator: BlockLocator<N>, config: Config) -> Self {
        Self {
            node,
            locator,
            config,
        }
    }

    /// Harvest a whole epoch: fetch the range, then keep only stake events whose embedded epoch
    /// equals the target. Boundary events near the range edges may belong to neighboring rounds
    /// and are left for the validator's tolerance check; claim events embed the bet epoch, not
    /// the observation epoch, and are kept unconditionally.
    pub async fn fetch_epoch(
        &self,
        epoch: Epoch,
        range: &BlockRange,
    ) -> Result<EpochEvents, NodeError> {
        let mut events = self.fetch(range.from, range.to).await?;

        events.stake_ups.retain(|stake| stake.epoch == epoch);
        events.stake_downs.retain(|stake| stake.epoch == epoch);

        debug!(
            epoch,
            from = range.from,
            to = range.to,
            event_count = events.event_count();
            "epoch events harvested"
        );

        Ok(events)
    }

    /// Harvest all six streams of the inclusive block range `[from, to]`, windowed and sliced.
    pub async fn fetch(&self, from: u64, to: u64) -> Result<EpochEvents, NodeError> {
        let mut starts = Vec::new();
        let mut locks = Vec::new();
        let mut ends = Vec::new();
        let mut stake_ups = Vec::new();
        let mut stake_downs = Vec::new();
        let mut claims = Vec::new();

        let mut window_from = from;
        while window_from <= to {
            let window_to = window_from
                .saturating_add(self.config.max_blocks_per_window - 1)
                .min(to);

            // The six streams of one window are fetched in parallel.
            let (s, l, e, up, down, claim) = tokio::try_join!(
                self.fetch_stream(EventStream::RoundStart, window_from, window_to),
                self.fetch_stream(EventStream::RoundLock, window_from, window_to),
                self.fetch_stream(EventStream::RoundEnd, window_from, window_to),
                self.fetch_stream(EventStream::StakeUp, window_from, window_to),
                self.fetch_stream(EventStream::StakeDown, window_from, window_to),
                self.fetch_stream(EventStream::Claim, window_from, window_to),
            )?;

            starts.extend(s);
            locks.extend(l);
            ends.extend(e);
            stake_ups.extend(up);
            stake_downs.extend(down);
            claims.extend(claim);

            if window_to == to {
                break;
            }
            window_from = window_to + 1;
        }

        let timestamps = self.block_timestamps([
            &starts, &locks, &ends, &stake_ups, &stake_downs, &claims,
        ])
        .await?;

        Ok(EpochEvents {
            starts: boundary_events(starts, &timestamps),
            locks: boundary_events(locks, &timestamps),
            ends: boundary_events(ends, &timestamps),
            stake_ups: stake_events(stake_ups, &timestamps)?,
            stake_downs: stake_events(stake_downs, &timestamps)?,
            claims: claim_events(claims, &timestamps)?,
        })
    }

    /// One stream over one window, sliced into bounded log queries with a brief pause between
    /// slices.
    async fn fetch_stream(
        &self,
        stream: EventStream,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawEvent>, NodeError> {
        let mut events = Vec::new();
        let mut slice_from = from;

        loop {
            let slice_to = slice_from
                .saturating_add(self.config.slice_size - 1)
                .min(to);

            let node = self.node.clone();
            let slice = with_retry(|| node.logs(stream, slice_from, slice_to)).await?;
            events.extend(slice);

            if slice_to == to {
                break;
            }
            slice_from = slice_to + 1;
            sleep(Duration::from_millis(self.config.slice_sleep_ms)).await;
        }

        Ok(events)
    }

    async fn block_timestamps(
        &self,
        streams: [&Vec<RawEvent>; 6],
    ) -> Result<HashMap<u64, u64>, NodeError> {
        let heights = streams
            .into_iter()
            .flatten()
            .map(|event| event.block_height)
            .collect::<Vec<_>>();

        self.locator
            .timestamps(&heights, self.config.block_header_batch)
            .await
    }
}

fn block_time(timestamps: &HashMap<u64, u64>, height: u64) -> DateTime<Utc> {
    timestamps
        .get(&height)
        .and_then(|&secs| DateTime::from_timestamp(secs as i64, 0))
        .unwrap_or_default()
}

fn boundary_events(
    events: Vec<RawEvent>,
    timestamps: &HashMap<u64, u64>,
) -> Vec<BoundaryEvent> {
    events
        .into_iter()
        .map(|event| BoundaryEvent {
            epoch: event.epoch,
            price: event.price,
            block_height: event.block_height,
            timestamp: block_time(timestamps, event.block_height),
            tx_hash: event.tx_hash,
            log_index: event.log_index,
        })
        .collect()
}

fn stake_events(
    events: Vec<RawEvent>,
    timestamps: &HashMap<u64, u64>,
) -> Result<Vec<StakeEvent>, NodeError> {
    events
        .into_iter()
        .map(|event| {
            let amount = normalized_amount(&event)?;
            Ok(StakeEvent {
                epoch: event.epoch,
                sender: event.sender.map(Wallet::from).unwrap_or_else(|| "".into()),
                amount,
                block_height: event.block_height,
                timestamp: block_time(timestamps, event.block_height),
                tx_hash: event.tx_hash,
                log_index: event.log_index,
            })
        })
        .collect()
}

fn claim_events(
    events: Vec<RawEvent>,
    timestamps: &HashMap<u64, u64>,
) -> Result<Vec<ClaimEvent>, NodeError> {
    events
        .into_iter()
        .map(|event| {
            let amount = normalized_amount(&event)?;
            Ok(ClaimEvent {
                bet_epoch: event.epoch,
                sender: event.sender.map(Wallet::from).unwrap_or_else(|| "".into()),
                amount,
                block_height: event.block_height,
                timestamp: block_time(timestamps, event.block_height),
                tx_hash: event.tx_hash,
                log_index: event.log_index,
            })
        })
        .collect()
}

/// Reduce the raw 18-digit amount to the canonical scale; a missing amount becomes zero and is
/// caught by validation.
fn normalized_amount(event: &RawEvent) -> Result<Amount, NodeError> {
    event
        .amount
        .map(|raw| {
            Amount::from_raw(raw)
                .map_err(|error| NodeError::Permanent(format!("malformed amount: {error}")))
        })
        .transpose()
        .map(|amount| amount.unwrap_or(Amount::ZERO))
}
