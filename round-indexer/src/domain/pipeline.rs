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
    harvester::{self, Harvester},
    locator::{self, BlockLocator},
    lock::EpochLock,
    node::{ChainNode, NodeError, with_retry},
    storage::{EpochCommit, Storage},
    validator::{self, ValidationError},
};
use chrono_tz::Tz;
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Configuration for the epoch pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// TTL of the per-epoch lock; chosen to exceed typical end-to-end epoch processing.
    #[serde(default = "lock_ttl_secs_default")]
    pub lock_ttl_secs: u64,

    /// IANA timezone for human-facing timestamp formatting.
    #[serde(default = "timezone_default")]
    pub timezone: Tz,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_ttl_secs: lock_ttl_secs_default(),
            timezone: timezone_default(),
        }
    }
}

const fn lock_ttl_secs_default() -> u64 {
    120
}

const fn timezone_default() -> Tz {
    Tz::UTC
}

/// How a pipeline invocation ended short of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The epoch was validated and persisted.
    Committed,

    /// The completion marker already existed.
    SkippedCompleted,

    /// Another worker owns the epoch.
    SkippedLocked,
}

/// Why a pipeline invocation aborted. Every variant surrenders the epoch to a later attempt;
/// only transient chain failures are retried locally, inside the invocation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("persistence failed: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Orchestrates one epoch: completion check, lock, block-range discovery, harvest, validation,
/// atomic commit, release. Data flows forward only; on failure the error is recorded and the
/// lock released.
#[derive(Clone)]
pub struct Pipeline<N, S, L> {
    node: N,
    locator: BlockLocator<N>,
    harvester: Harvester<N>,
    storage: S,
    lock: L,
    validator_config: validator::Config,
    lock_ttl: Duration,
    timezone: Tz,
}

impl<N, S, L> Pipeline<N, S, L>
where
    N: ChainNode,
    S: Storage,
    L: EpochLock,
{
    pub fn new(
        node: N,
        storage: S,
        lock: L,
        config: Config,
        locator_config: locator::Config,
        harvester_config: harvester::Config,
        validator_config: validator::Config,
    ) -> Self {
        let locator = BlockLocator::new(node.clone(), locator_config);
        let harvester = Harvester::new(node.clone(), locator.clone(), harvester_config);

        Self {
            node,
            locator,
            harvester,
            storage,
            lock,
            validator_config,
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            timezone: config.timezone,
        }
    }

    /// Drive one epoch through the pipeline. Skips are not failures; a skipped epoch is owned
    /// elsewhere or already done.
    pub async fn process(&self, epoch: Epoch) -> Result<Outcome, PipelineError> {
        if self.storage.epoch_completed(epoch).await? {
            debug!(epoch; "epoch already completed");
            metrics::counter!("epochs_skipped_total", "reason" => "completed").increment(1);
            return Ok(Outcome::SkippedCompleted);
        }

        if !self.lock.acquire(epoch, self.lock_ttl).await {
            debug!(epoch; "epoch owned by another worker");
            metrics::counter!("epochs_skipped_total", "reason" => "locked").increment(1);
            return Ok(Outcome::SkippedLocked);
        }

        let result = self.process_locked(epoch).await;

        match result {
            Ok(outcome) => {
                self.lock.release(epoch).await;
                Ok(outcome)
            }

            Err(pipeline_error) => {
                error!(epoch, error:% = pipeline_error; "epoch.failed");
                metrics::counter!("epochs_failed_total").increment(1);

                // Diagnostics go through a fresh connection so they survive the rollback.
                if let Err(record_error) = self
                    .storage
                    .record_epoch_error(epoch, &pipeline_error.to_string())
                    .await
                {
                    warn!(epoch, error:% = record_error; "cannot record epoch error");
                }

                self.lock.release(epoch).await;
                Err(pipeline_error)
            }
        }
    }

    async fn process_locked(&self, epoch: Epoch) -> Result<Outcome, PipelineError> {
        // Another worker may have committed between the completion check and lock acquisition;
        // the completion marker is authoritative.
        if self.storage.epoch_completed(epoch).await? {
            return Ok(Outcome::SkippedCompleted);
        }

        let started = Instant::now();
        info!(epoch; "epoch.started");

        let node = self.node.clone();
        let meta = with_retry(|| node.round_meta(epoch)).await?;

        let next_start_ts = match with_retry(|| node.round_meta(epoch + 1)).await {
            Ok(next_meta) => Some(next_meta.start_ts),

            // The next round does not exist yet; "now" substitutes for the right edge.
            Err(NodeError::Permanent(_)) => None,

            Err(transient) => return Err(transient.into()),
        };

        let range = self
            .locator
            .epoch_range(epoch, meta.start_ts, next_start_ts)
            .await?;
        let events = self.harvester.fetch_epoch(epoch, &range).await?;

        let validated = validator::validate(epoch, &events, &meta, &self.validator_config)?;
        for warning in &validated.warnings {
            warn!(epoch, warning:%; "epoch validation warning");
        }

        // Long harvests eat into the TTL budget; refresh it before committing.
        if started.elapsed() > self.lock_ttl / 2 {
            self.lock.extend(epoch, self.lock_ttl).await;
        }

        let commit = EpochCommit::from(validated);
        self.storage.commit_epoch(&commit).await?;

        info!(
            epoch,
            bet_count = commit.bets.len(),
            claim_count = commit.claims.len(),
            total:% = commit.round.total_amount,
            outcome = commit.round.outcome.as_str(),
            closed_at:% = commit.round.close_time.with_timezone(&self.timezone).to_rfc3339();
            "epoch.committed"
        );
        metrics::counter!("epochs_committed_total").increment(1);

        Ok(Outcome::Committed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::domain::{
        Epoch, EventStream, Price, RawEvent, RoundOutcome,
        harvester, locator,
        lock::EpochLock,
        node::{BlockHeader, ChainNode, NodeError, RoundMeta},
        pipeline::{Config, Outcome, Pipeline, PipelineError},
        storage::{EpochCommit, SqlxTransaction, Storage},
        validator,
    };
    use alloy::primitives::{Address, B256, U256};
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::{
        collections::{HashMap, HashSet},
        sync::Arc,
        time::Duration,
    };

    const GENESIS_TS: u64 = 1_700_000_000;
    const BLOCK_SECS: u64 = 3;
    const EPOCH_SECS: u64 = 300;

    /// A chain with three-second blocks and five-minute rounds; round `e` starts at
    /// `GENESIS_TS + e · 300`.
    #[derive(Clone, Default)]
    pub(crate) struct MockChain {
        pub max_epoch: Epoch,
        pub current: Epoch,
        pub stake_ups: Vec<RawEvent>,
        pub stake_downs: Vec<RawEvent>,
        pub claims: Vec<RawEvent>,
        /// Streams that always fail with a transient error.
        pub failing_streams: Vec<EventStream>,
    }

    impl MockChain {
        pub fn start_ts(epoch: Epoch) -> u64 {
            GENESIS_TS + epoch * EPOCH_SECS
        }

        pub fn start_block(epoch: Epoch) -> u64 {
            epoch * EPOCH_SECS / BLOCK_SECS
        }
    }

    pub(crate) fn raw_event(
        epoch: Epoch,
        block_height: u64,
        log_index: u64,
        amount_units: u64,
    ) -> RawEvent {
        RawEvent {
            epoch,
            sender: Some(Address::repeat_byte(0x11)),
            amount: Some(U256::from(amount_units) * U256::from(10u128.pow(18))),
            price: None,
            block_height,
            tx_hash: B256::repeat_byte(block_height as u8),
            log_index,
        }
    }

    impl ChainNode for MockChain {
        async fn current_epoch(&self) -> Result<Epoch, NodeError> {
            Ok(self.current)
        }

        async fn round_meta(&self, epoch: Epoch) -> Result<RoundMeta, NodeError> {
            if epoch > self.max_epoch {
                return Err(NodeError::Permanent(format!("round {epoch} does not exist")));
            }

            Ok(RoundMeta {
                epoch,
                start_ts: Self::start_ts(epoch),
                lock_ts: Self::start_ts(epoch + 1),
                close_ts: Self::start_ts(epoch + 2),
                lock_price: Some(Price::from_scaled(50_000_000_000)),
                close_price: Some(Price::from_scaled(51_000_000_000)),
                oracle_called: true,
            })
        }

        async fn latest_block(&self) -> Result<u64, NodeError> {
            Ok(Self::start_block(self.max_epoch + 3))
        }

        async fn block_header(&self, height: u64) -> Result<BlockHeader, NodeError> {
            Ok(BlockHeader {
                height,
                timestamp: GENESIS_TS + height * BLOCK_SECS,
            })
        }

        async fn logs(
            &self,
            stream: EventStream,
            from: u64,
            to: u64,
        ) -> Result<Vec<RawEvent>, NodeError> {
            if self.failing_streams.contains(&stream) {
                return Err(NodeError::Transient("injected timeout".to_string()));
            }

            let events = match stream {
                EventStream::RoundStart => {
                    // One start event per round, in the round's first block.
                    return Ok((from..=to)
                        .filter(|height| height % (EPOCH_SECS / BLOCK_SECS) == 0)
                        .map(|height| RawEvent {
                            amount: None,
                            sender: None,
                            ..raw_event(
                                height * BLOCK_SECS / EPOCH_SECS,
                                height,
                                0,
                                0,
                            )
                        })
                        .collect());
                }
                EventStream::StakeUp => &self.stake_ups,
                EventStream::StakeDown => &self.stake_downs,
                EventStream::Claim => &self.claims,
                _ => return Ok(vec![]),
            };

            Ok(events
                .iter()
                .filter(|event| (from..=to).contains(&event.block_height))
                .cloned()
                .collect())
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct MockLockState {
        pub held: HashSet<Epoch>,
        pub acquires: u32,
        pub releases: u32,
        pub deny: bool,
    }

    #[derive(Clone, Default)]
    pub(crate) struct MockLock(pub Arc<Mutex<MockLockState>>);

    impl EpochLock for MockLock {
        async fn acquire(&self, epoch: Epoch, _ttl: Duration) -> bool {
            let mut state = self.0.lock();
            state.acquires += 1;
            if state.deny {
                return false;
            }
            state.held.insert(epoch)
        }

        async fn extend(&self, epoch: Epoch, _ttl: Duration) -> bool {
            self.0.lock().held.contains(&epoch)
        }

        async fn release(&self, epoch: Epoch) {
            let mut state = self.0.lock();
            state.held.remove(&epoch);
            state.releases += 1;
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct MockStorageState {
        pub completed: HashSet<Epoch>,
        pub commits: Vec<EpochCommit>,
        pub errors: HashMap<Epoch, String>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct MockStorage(pub Arc<Mutex<MockStorageState>>);

    impl Storage for MockStorage {
        async fn create_tx(&self) -> Result<SqlxTransaction, sqlx::Error> {
            unimplemented!("not used by the pipeline")
        }

        async fn epoch_completed(&self, epoch: Epoch) -> Result<bool, sqlx::Error> {
            Ok(self.0.lock().completed.contains(&epoch))
        }

        async fn delete_live_bets(
            &self,
            _epoch: Epoch,
            _tx: &mut SqlxTransaction,
        ) -> Result<u64, sqlx::Error> {
            unimplemented!("not used by the pipeline")
        }

        async fn save_round(
            &self,
            _round: &crate::domain::Round,
            _tx: &mut SqlxTransaction,
        ) -> Result<(), sqlx::Error> {
            unimplemented!("not used by the pipeline")
        }

        async fn save_bets(
            &self,
            _bets: &[crate::domain::Bet],
            _tx: &mut SqlxTransaction,
        ) -> Result<(), sqlx::Error> {
            unimplemented!("not used by the pipeline")
        }

        async fn save_claims(
            &self,
            _claims: &[crate::domain::Claim],
            _tx: &mut SqlxTransaction,
        ) -> Result<(), sqlx::Error> {
            unimplemented!("not used by the pipeline")
        }

        async fn save_multi_claims(
            &self,
            _multi_claims: &[crate::domain::MultiClaim],
            _tx: &mut SqlxTransaction,
        ) -> Result<(), sqlx::Error> {
            unimplemented!("not used by the pipeline")
        }

        async fn mark_completed(
            &self,
            _epoch: Epoch,
            _tx: &mut SqlxTransaction,
        ) -> Result<(), sqlx::Error> {
            unimplemented!("not used by the pipeline")
        }

        async fn commit_epoch(&self, commit: &EpochCommit) -> Result<(), sqlx::Error> {
            let mut state = self.0.lock();
            state.commits.push(commit.clone());
            state.completed.insert(commit.round.epoch);
            Ok(())
        }

        async fn record_epoch_error(
            &self,
            epoch: Epoch,
            message: &str,
        ) -> Result<(), sqlx::Error> {
            self.0.lock().errors.insert(epoch, message.to_string());
            Ok(())
        }

        async fn get_round(
            &self,
            epoch: Epoch,
        ) -> Result<Option<crate::domain::Round>, sqlx::Error> {
            Ok(self
                .0
                .lock()
                .commits
                .iter()
                .find(|commit| commit.round.epoch == epoch)
                .map(|commit| commit.round.clone()))
        }

        async fn count_bets(&self, epoch: Epoch) -> Result<u64, sqlx::Error> {
            Ok(self
                .0
                .lock()
                .commits
                .iter()
                .filter(|commit| commit.round.epoch == epoch)
                .map(|commit| commit.bets.len() as u64)
                .sum())
        }
    }

    pub(crate) fn chain_with_epoch(epoch: Epoch) -> MockChain {
        let start_block = MockChain::start_block(epoch);

        MockChain {
            max_epoch: epoch + 2,
            current: epoch + 2,
            stake_ups: vec![
                raw_event(epoch, start_block + 10, 1, 2),
                raw_event(epoch, start_block + 20, 2, 1),
            ],
            stake_downs: vec![raw_event(epoch, start_block + 30, 3, 1)],
            claims: vec![raw_event(epoch - 2, start_block + 50, 4, 3)],
            ..Default::default()
        }
    }

    pub(crate) fn pipeline(
        chain: MockChain,
        storage: MockStorage,
        lock: MockLock,
    ) -> Pipeline<MockChain, MockStorage, MockLock> {
        let harvester_config = harvester::Config {
            slice_sleep_ms: 0,
            ..Default::default()
        };

        Pipeline::new(
            chain,
            storage,
            lock,
            Config::default(),
            locator::Config {
                avg_block_time_ms: BLOCK_SECS * 1_000,
                ..Default::default()
            },
            harvester_config,
            validator::Config::default(),
        )
    }

    #[tokio::test]
    async fn test_process_commits() {
        let epoch = 426_236;
        let storage = MockStorage::default();
        let lock = MockLock::default();
        let pipeline = pipeline(chain_with_epoch(epoch), storage.clone(), lock.clone());

        let outcome = pipeline.process(epoch).await.expect("pipeline succeeds");
        assert_eq!(outcome, Outcome::Committed);

        let state = storage.0.lock();
        assert!(state.completed.contains(&epoch));
        assert_eq!(state.commits.len(), 1);

        let commit = &state.commits[0];
        assert_eq!(commit.round.outcome, RoundOutcome::Up);
        assert_eq!(commit.round.total_amount.to_string(), "4.00000000");
        assert_eq!(commit.round.up_odds.to_string(), "1.2933");
        assert_eq!(commit.round.down_odds.to_string(), "3.8800");
        assert_eq!(commit.bets.len(), 3);

        // The claim observed in this epoch settles an earlier bet epoch.
        assert_eq!(commit.claims.len(), 1);
        assert_eq!(commit.claims[0].epoch, epoch);
        assert_eq!(commit.claims[0].bet_epoch, epoch - 2);

        let lock_state = lock.0.lock();
        assert!(lock_state.held.is_empty());
        assert_eq!(lock_state.releases, 1);
    }

    #[tokio::test]
    async fn test_process_skips_completed() {
        let epoch = 426_236;
        let storage = MockStorage::default();
        storage.0.lock().completed.insert(epoch);
        let lock = MockLock::default();
        let pipeline = pipeline(chain_with_epoch(epoch), storage.clone(), lock.clone());

        let outcome = pipeline.process(epoch).await.expect("pipeline succeeds");

        assert_eq!(outcome, Outcome::SkippedCompleted);
        assert_eq!(lock.0.lock().acquires, 0);
        assert!(storage.0.lock().commits.is_empty());
    }

    #[tokio::test]
    async fn test_process_skips_when_locked() {
        let epoch = 426_236;
        let storage = MockStorage::default();
        let lock = MockLock::default();
        lock.0.lock().deny = true;
        let pipeline = pipeline(chain_with_epoch(epoch), storage.clone(), lock.clone());

        let outcome = pipeline.process(epoch).await.expect("pipeline succeeds");

        assert_eq!(outcome, Outcome::SkippedLocked);
        assert!(storage.0.lock().commits.is_empty());
    }

    #[tokio::test]
    async fn test_process_validation_failure_records_error() {
        let epoch = 426_236;
        let mut chain = chain_with_epoch(epoch);
        // A zero-bet epoch must fail validation.
        chain.stake_ups.clear();
        chain.stake_downs.clear();

        let storage = MockStorage::default();
        let lock = MockLock::default();
        let pipeline = pipeline(chain, storage.clone(), lock.clone());

        let error = pipeline.process(epoch).await.expect_err("pipeline fails");
        assert_matches!(error, PipelineError::Validation(_));

        let state = storage.0.lock();
        assert!(state.commits.is_empty());
        assert!(!state.completed.contains(&epoch));
        assert!(state.errors[&epoch].contains("no stake events"));

        let lock_state = lock.0.lock();
        assert!(lock_state.held.is_empty());
        assert_eq!(lock_state.releases, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_transient_failure_surfaces_after_retries() {
        let epoch = 426_236;
        let mut chain = chain_with_epoch(epoch);
        chain.failing_streams = vec![EventStream::StakeUp];

        let storage = MockStorage::default();
        let lock = MockLock::default();
        let pipeline = pipeline(chain, storage.clone(), lock.clone());

        let error = pipeline.process(epoch).await.expect_err("pipeline fails");
        assert_matches!(error, PipelineError::Node(NodeError::Transient(_)));

        let state = storage.0.lock();
        assert!(state.commits.is_empty());
        assert!(state.errors.contains_key(&epoch));
        assert!(lock.0.lock().held.is_empty());
    }

    #[tokio::test]
    async fn test_process_missing_next_round_uses_latest_as_right_edge() {
        let epoch = 426_236;
        let mut chain = chain_with_epoch(epoch);
        // `rounds(epoch + 1)` reverts, so "now" becomes the right edge.
        chain.max_epoch = epoch;

        let storage = MockStorage::default();
        let lock = MockLock::default();
        let pipeline = pipeline(chain, storage.clone(), lock.clone());

        let outcome = pipeline.process(epoch).await.expect("pipeline succeeds");

        assert_eq!(outcome, Outcome::Committed);
        assert_eq!(storage.0.lock().commits.len(), 1);
    }

    #[tokio::test]
    async fn test_process_rerun_is_noop() {
        let epoch = 426_236;
        let storage = MockStorage::default();
        let lock = MockLock::default();
        let pipeline = pipeline(chain_with_epoch(epoch), storage.clone(), lock.clone());

        let first = pipeline.process(epoch).await.expect("pipeline succeeds");
        assert_eq!(first, Outcome::Committed);

        let second = pipeline.process(epoch).await.expect("pipeline succeeds");
        assert_eq!(second, Outcome::SkippedCompleted);
        assert_eq!(storage.0.lock().commits.len(), 1);
    }
}
