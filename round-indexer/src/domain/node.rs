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

use crate::domain::{Epoch, EventStream, Price, RawEvent};
use log::debug;
use std::{future::Future, time::Duration};
use thiserror::Error;
use tokio::time::sleep;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Chain access failure, split into the two classes that drive retry behavior.
#[derive(Debug, Clone, Error)]
pub enum NodeError {
    /// Timeout, throttling, 5xx or transport failure; retryable within the same pipeline
    /// invocation.
    #[error("transient chain failure: {0}")]
    Transient(String),

    /// Invalid parameters or a contract revert; not retryable in this attempt.
    #[error("permanent chain failure: {0}")]
    Permanent(String),
}

impl NodeError {
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Per-round metadata as reported by the contract's `rounds` entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundMeta {
    pub epoch: Epoch,
    pub start_ts: u64,
    pub lock_ts: u64,
    pub close_ts: u64,
    pub lock_price: Option<Price>,
    pub close_price: Option<Price>,
    pub oracle_called: bool,
}

/// A block header reduced to the fields the locator needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: u64,
    pub timestamp: u64,
}

/// Chain abstraction: typed, read-only access to the market contract and block headers.
#[trait_variant::make(Send)]
pub trait ChainNode
where
    Self: Clone + Send + Sync + 'static,
{
    /// The epoch currently open for staking.
    async fn current_epoch(&self) -> Result<Epoch, NodeError>;

    /// Metadata of the given round. Querying a round the contract has not created yet fails
    /// with [NodeError::Permanent].
    async fn round_meta(&self, epoch: Epoch) -> Result<RoundMeta, NodeError>;

    /// The height of the latest block.
    async fn latest_block(&self) -> Result<u64, NodeError>;

    /// The header of the block at the given height.
    async fn block_header(&self, height: u64) -> Result<BlockHeader, NodeError>;

    /// All events of one stream within the inclusive block range `[from, to]`.
    async fn logs(&self, stream: EventStream, from: u64, to: u64)
    -> Result<Vec<RawEvent>, NodeError>;
}

/// Run the given chain operation, retrying transient failures with doubling backoff. Permanent
/// failures and exhausted retries are surfaced to the caller.
pub async fn with_retry<T, F, Fut>(operation: F) -> Result<T, NodeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, NodeError>>,
{
    let mut delay = RETRY_BASE_DELAY;

    for attempt in 1..=RETRY_ATTEMPTS {
        match operation().await {
            Ok(value) => return Ok(value),

            Err(error) if error.is_transient() && attempt < RETRY_ATTEMPTS => {
                debug!(attempt, error:%; "retrying transient chain failure");
                sleep(delay).await;
                delay *= 2;
            }

            Err(error) => return Err(error),
        }
    }

    unreachable!("loop returns on the final attempt")
}

#[cfg(test)]
mod tests {
    use crate::domain::node::{NodeError, with_retry};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retry_recovers() {
        let calls = AtomicU32::new(0);

        let result = with_retry(|| async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(NodeError::Transient("throttled".to_string()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_matches!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_exhausts_transient() {
        let calls = AtomicU32::new(0);

        let result = with_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(NodeError::Transient("timeout".to_string()))
        })
        .await;

        assert_matches!(result, Err(NodeError::Transient(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_permanent_not_retried() {
        let calls = AtomicU32::new(0);

        let result = with_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(NodeError::Permanent("revert".to_string()))
        })
        .await;

        assert_matches!(result, Err(NodeError::Permanent(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
