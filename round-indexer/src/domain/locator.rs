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
    Epoch,
    node::{BlockHeader, ChainNode, NodeError, with_retry},
};
use futures::future;
use log::debug;
use parking_lot::Mutex;
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

const MS_PER_DAY: u64 = 86_400_000;

/// Upper bound on cached block timestamps; beyond this the cache is pruned.
const TS_CACHE_CAPACITY: usize = 100_000;

/// Configuration for the block locator.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Stride of the outward probe steps in blocks.
    #[serde(default = "stride_default")]
    pub stride: u64,

    /// Estimated average block time, driving the linear seed extrapolation.
    #[serde(default = "avg_block_time_ms_default")]
    pub avg_block_time_ms: u64,

    /// Residual above which the multi-sample fallback kicks in when no anchor seeded the fast
    /// path.
    #[serde(default = "residual_threshold_secs_default")]
    pub residual_threshold_secs: u64,

    #[serde(default = "range_cache_ttl_ms_default")]
    pub range_cache_ttl_ms: u64,

    #[serde(default = "ts_cache_ttl_ms_default")]
    pub ts_cache_ttl_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stride: stride_default(),
            avg_block_time_ms: avg_block_time_ms_default(),
            residual_threshold_secs: residual_threshold_secs_default(),
            range_cache_ttl_ms: range_cache_ttl_ms_default(),
            ts_cache_ttl_ms: ts_cache_ttl_ms_default(),
        }
    }
}

const fn stride_default() -> u64 {
    100
}

const fn avg_block_time_ms_default() -> u64 {
    3_000
}

const fn residual_threshold_secs_default() -> u64 {
    300
}

const fn range_cache_ttl_ms_default() -> u64 {
    1_800_000
}

const fn ts_cache_ttl_ms_default() -> u64 {
    3_600_000
}

const MAX_STRIDE_PROBES: u32 = 3;
const BINARY_ITERATIONS: u32 = 2;
const FALLBACK_SAMPLES: u64 = 5;

/// Which side of the target timestamp the returned block must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The first block whose timestamp is at or after the target.
    FirstAtOrAfter,

    /// The last block whose timestamp is before the target.
    LastBefore,
}

/// An inclusive block range spanning one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub const fn block_count(&self) -> u64 {
        self.to - self.from + 1
    }
}

struct Cached<T> {
    value: T,
    expires_at: Instant,
}

#[derive(Default)]
struct Caches {
    ranges: HashMap<Epoch, Cached<BlockRange>>,
    timestamps: HashMap<u64, Cached<u64>>,
    /// Most recent (height, timestamp) pair observed; seeds the linear extrapolation.
    anchor: Option<BlockHeader>,
}

/// Maps wall-clock timestamps to block heights with bounded binary search, sample-point linear
/// estimation and TTL caches. The chain does not expose a timestamp index, so the locator's job
/// is to keep the number of header lookups small.
///
/// Block timestamps are assumed non-decreasing in height, which the chain guarantees.
#[derive(Clone)]
pub struct BlockLocator<N> {
    node: N,
    config: Config,
    caches: Arc<Mutex<Caches>>,
}

impl<N> BlockLocator<N>
where
    N: ChainNode,
{
    pub fn new(node: N, config: Config) -> Self {
        Self {
            node,
            config,
            caches: Arc::new(Mutex::new(Caches::default())),
        }
    }

    /// The block range `[first ≥ start_ts, last < next_start_ts]` of one epoch, cached per
    /// epoch. When the next round is unknown the right edge falls back to the latest block.
    pub async fn epoch_range(
        &self,
        epoch: Epoch,
        start_ts: u64,
        next_start_ts: Option<u64>,
    ) -> Result<BlockRange, NodeError> {
        {
            let mut caches = self.caches.lock();
            let expired = match caches.ranges.get(&epoch) {
                Some(cached) if cached.expires_at > Instant::now() => {
                    metrics::counter!("locator_cache_hits_total", "cache" => "range")
                        .increment(1);
                    return Ok(cached.value);
                }
                Some(_) => true,
                None => false,
            };
            if expired {
                caches.ranges.remove(&epoch);
            }
        }
        metrics::counter!("locator_cache_misses_total", "cache" => "range").increment(1);

        let from = self.locate(start_ts, Side::FirstAtOrAfter).await?;
        let to = match next_start_ts {
            Some(next_start_ts) => self.locate(next_start_ts, Side::LastBefore).await?,
            None => {
                let node = self.node.clone();
                with_retry(|| node.latest_block()).await?
            }
        };

        let range = BlockRange {
            from,
            to: to.max(from),
        };
        debug!(epoch, from = range.from, to = range.to; "epoch block range located");

        self.caches.lock().ranges.insert(
            epoch,
            Cached {
                value: range,
                expires_at: Instant::now() + Duration::from_millis(self.config.range_cache_ttl_ms),
            },
        );

        Ok(range)
    }

    /// Find the block that satisfies the side-predicate against the target timestamp: seed by
    /// linear extrapolation, step outward in fixed strides, tighten with a short binary search,
    /// correct the boundary one block at a time. A multi-sample fallback bounds the worst case
    /// when the fast path was unseeded and lands far off.
    pub async fn locate(&self, target_ts: u64, side: Side) -> Result<u64, NodeError> {
        let node = self.node.clone();
        let latest = with_retry(|| node.latest_block()).await?;
        let anchor = self.caches.lock().anchor;

        let seed = self.seed(target_ts, anchor, latest);

        // Outward stride probes to bracket the target.
        let stride = self.config.stride;
        let mut below: Option<u64> = None;
        let mut at_or_after: Option<u64> = None;
        let mut probe = seed;

        for _ in 0..MAX_STRIDE_PROBES {
            let header = self.header(probe).await?;

            if header.timestamp < target_ts {
                below = Some(below.map_or(probe, |below| below.max(probe)));
                if at_or_after.is_some() || probe == latest {
                    break;
                }
                probe = (probe + stride).min(latest);
            } else {
                at_or_after = Some(at_or_after.map_or(probe, |at| at.min(probe)));
                if below.is_some() || probe == 0 {
                    break;
                }
                probe = probe.saturating_sub(stride);
            }
        }

        // Short binary tightening inside the bracket, or inside the stride window around the
        // last probe when the probes never crossed the target.
        let (mut lo, mut hi) = match (below, at_or_after) {
            (Some(below), Some(at)) if below < at => (below, at),
            (Some(below), _) => (below, (below + stride).min(latest)),
            (_, Some(at)) => (at.saturating_sub(stride), at),
            (None, None) => (seed.saturating_sub(stride), (seed + stride).min(latest)),
        };

        for _ in 0..BINARY_ITERATIONS {
            if hi - lo <= 1 {
                break;
            }
            let mid = lo + (hi - lo) / 2;
            if self.header(mid).await?.timestamp < target_ts {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        let candidate = match side {
            Side::FirstAtOrAfter => hi,
            Side::LastBefore => lo,
        };

        if let Some(found) = self
            .correct_boundary(candidate, target_ts, side, latest)
            .await?
        {
            let residual = self.header(found).await?.timestamp.abs_diff(target_ts);
            if anchor.is_some() || residual <= self.config.residual_threshold_secs {
                return Ok(found);
            }
        }

        metrics::counter!("locator_fallback_total").increment(1);
        self.locate_fallback(target_ts, side, latest).await
    }

    /// Batched, cache-coalesced timestamp lookup for the given block heights.
    pub async fn timestamps(
        &self,
        heights: &[u64],
        batch_size: usize,
    ) -> Result<HashMap<u64, u64>, NodeError> {
        let mut distinct = heights.to_vec();
        distinct.sort_unstable();
        distinct.dedup();

        let mut timestamps = HashMap::with_capacity(distinct.len());
        for chunk in distinct.chunks(batch_size.max(1)) {
            let headers =
                future::try_join_all(chunk.iter().map(|&height| self.header(height))).await?;
            timestamps.extend(
                headers
                    .into_iter()
                    .map(|header| (header.height, header.timestamp)),
            );
        }

        Ok(timestamps)
    }

    /// A block header, served from the timestamp cache when possible.
    async fn header(&self, height: u64) -> Result<BlockHeader, NodeError> {
        {
            let mut caches = self.caches.lock();
            let expired = match caches.timestamps.get(&height) {
                Some(cached) if cached.expires_at > Instant::now() => {
                    metrics::counter!("locator_cache_hits_total", "cache" => "timestamp")
                        .increment(1);
                    return Ok(BlockHeader {
                        height,
                        timestamp: cached.value,
                    });
                }
                Some(_) => true,
                None => false,
            };
            if expired {
                caches.timestamps.remove(&height);
            }
        }
        metrics::counter!("locator_cache_misses_total", "cache" => "timestamp").increment(1);

        let node = self.node.clone();
        let header = with_retry(|| node.block_header(height)).await?;

        let mut caches = self.caches.lock();
        if caches.timestamps.len() >= TS_CACHE_CAPACITY {
            let now = Instant::now();
            caches.timestamps.retain(|_, cached| cached.expires_at > now);
            if caches.timestamps.len() >= TS_CACHE_CAPACITY {
                caches.timestamps.clear();
            }
        }
        caches.timestamps.insert(
            height,
            Cached {
                value: header.timestamp,
                expires_at: Instant::now() + Duration::from_millis(self.config.ts_cache_ttl_ms),
            },
        );
        if caches.anchor.is_none_or(|anchor| anchor.height < header.height) {
            caches.anchor = Some(header);
        }

        Ok(header)
    }

    fn seed(&self, target_ts: u64, anchor: Option<BlockHeader>, latest: u64) -> u64 {
        let seed = match anchor {
            Some(anchor) => {
                let delta_blocks = (target_ts as i128 - anchor.timestamp as i128) * 1_000
                    / self.config.avg_block_time_ms as i128;
                anchor.height as i128 + delta_blocks
            }

            None => latest as i128 - (MS_PER_DAY / self.config.avg_block_time_ms) as i128,
        };

        seed.clamp(0, latest as i128) as u64
    }

    /// Walk one block at a time until the side-predicate holds, bounded by one stride of steps.
    /// Returns `None` when the bound was exhausted before the boundary was found.
    async fn correct_boundary(
        &self,
        mut height: u64,
        target_ts: u64,
        side: Side,
        latest: u64,
    ) -> Result<Option<u64>, NodeError> {
        for _ in 0..=self.config.stride {
            let timestamp = self.header(height).await?.timestamp;

            match side {
                Side::FirstAtOrAfter => {
                    if timestamp >= target_ts {
                        if height == 0
                            || self.header(height - 1).await?.timestamp < target_ts
                        {
                            return Ok(Some(height));
                        }
                        height -= 1;
                    } else {
                        // The chain tip may still be older than the target.
                        if height == latest {
                            return Ok(Some(latest));
                        }
                        height += 1;
                    }
                }

                Side::LastBefore => {
                    if timestamp < target_ts {
                        if height == latest
                            || self.header(height + 1).await?.timestamp >= target_ts
                        {
                            return Ok(Some(height));
                        }
                        height += 1;
                    } else {
                        // The whole chain may be at or after the target.
                        if height == 0 {
                            return Ok(Some(0));
                        }
                        height -= 1;
                    }
                }
            }
        }

        Ok(None)
    }

    /// Slow path: five evenly distributed samples, a least-squares linear fit to predict the
    /// height, then a full binary search over the bracketing span.
    async fn locate_fallback(&self, target_ts: u64, side: Side, latest: u64) -> Result<u64, NodeError> {
        let span_lo = 0u64;
        let span_hi = latest;

        let step = ((span_hi - span_lo) / (FALLBACK_SAMPLES - 1)).max(1);
        let mut samples = Vec::with_capacity(FALLBACK_SAMPLES as usize);
        for i in 0..FALLBACK_SAMPLES {
            let height = (span_lo + i * step).min(span_hi);
            let header = self.header(height).await?;
            samples.push(header);
            if height == span_hi {
                break;
            }
        }

        let predicted = predict_height(&samples, target_ts, self.config.avg_block_time_ms)
            .clamp(0, latest as i128) as u64;

        // Window around the prediction; widened to the full span when it fails to bracket the
        // target.
        let radius = self.config.stride * 50;
        let mut lo = predicted.saturating_sub(radius);
        let mut hi = (predicted + radius).min(latest);

        if self.header(lo).await?.timestamp >= target_ts
            || (hi < latest && self.header(hi).await?.timestamp < target_ts)
        {
            lo = span_lo;
            hi = span_hi;
        }

        self.binary_boundary(lo, hi, target_ts, side).await
    }

    /// Full binary search for the boundary over `[lo, hi]`, maintaining the invariant
    /// `ts(lo) < target ≤ ts(hi)` once established.
    async fn binary_boundary(
        &self,
        mut lo: u64,
        mut hi: u64,
        target_ts: u64,
        side: Side,
    ) -> Result<u64, NodeError> {
        if self.header(lo).await?.timestamp >= target_ts {
            // Every block in the span is at or after the target.
            return Ok(lo);
        }
        if self.header(hi).await?.timestamp < target_ts {
            // Every block in the span is before the target.
            return Ok(hi);
        }

        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if self.header(mid).await?.timestamp < target_ts {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        Ok(match side {
            Side::FirstAtOrAfter => hi,
            Side::LastBefore => lo,
        })
    }
}

/// Least-squares linear fit of height over timestamp, evaluated at the target. Falls back to
/// the configured average block time when the samples do not spread.
fn predict_height(samples: &[BlockHeader], target_ts: u64, avg_block_time_ms: u64) -> i128 {
    let n = samples.len() as i128;
    let mean_ts = samples.iter().map(|s| s.timestamp as i128).sum::<i128>() / n;
    let mean_height = samples.iter().map(|s| s.height as i128).sum::<i128>() / n;

    let numerator = samples
        .iter()
        .map(|s| (s.timestamp as i128 - mean_ts) * (s.height as i128 - mean_height))
        .sum::<i128>();
    let denominator = samples
        .iter()
        .map(|s| (s.timestamp as i128 - mean_ts).pow(2))
        .sum::<i128>();

    if denominator == 0 {
        return mean_height + (target_ts as i128 - mean_ts) * 1_000 / avg_block_time_ms as i128;
    }

    mean_height + (target_ts as i128 - mean_ts) * numerator / denominator
}
