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
    lock::EpochLock,
    node::{ChainNode, with_retry},
    pipeline::{Outcome, Pipeline},
    storage::Storage,
};
use anyhow::{Context, bail};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    select,
    signal::unix::Signal,
    sync::watch,
    task,
    time::{sleep, timeout},
};

/// The historical sweeper starts this far below the current epoch; closer rounds may still be
/// open for staking or unsettled.
const SWEEP_START_OFFSET: u64 = 2;

/// The epochs the tip runner races the sweeper for, as offsets below the current epoch.
const TIP_OFFSETS: [u64; 3] = [2, 3, 4];

/// Configuration for the scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The historical sweeper is unconditionally restarted after this long to release
    /// accumulated resources.
    #[serde(default = "main_restart_ms_default")]
    pub main_restart_ms: u64,

    #[serde(default = "tip_interval_ms_default")]
    pub tip_interval_ms: u64,

    #[serde(default = "tip_warmup_ms_default")]
    pub tip_warmup_ms: u64,

    /// How many epochs the sweeper processes before yielding.
    #[serde(default = "sweep_epochs_per_cycle_default")]
    pub sweep_epochs_per_cycle: u32,

    #[serde(with = "humantime_serde", default = "sweep_cycle_pause_default")]
    pub sweep_cycle_pause: Duration,

    /// Failures inside the window before the process shuts down.
    #[serde(default = "max_consecutive_failures_default")]
    pub max_consecutive_failures: u32,

    #[serde(default = "failure_window_ms_default")]
    pub failure_window_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            main_restart_ms: main_restart_ms_default(),
            tip_interval_ms: tip_interval_ms_default(),
            tip_warmup_ms: tip_warmup_ms_default(),
            sweep_epochs_per_cycle: sweep_epochs_per_cycle_default(),
            sweep_cycle_pause: sweep_cycle_pause_default(),
            max_consecutive_failures: max_consecutive_failures_default(),
            failure_window_ms: failure_window_ms_default(),
        }
    }
}

const fn main_restart_ms_default() -> u64 {
    1_800_000
}

const fn tip_interval_ms_default() -> u64 {
    300_000
}

const fn tip_warmup_ms_default() -> u64 {
    300_000
}

const fn sweep_epochs_per_cycle_default() -> u32 {
    10
}

const fn sweep_cycle_pause_default() -> Duration {
    Duration::from_secs(5)
}

const fn max_consecutive_failures_default() -> u32 {
    3
}

const fn failure_window_ms_default() -> u64 {
    600_000
}

/// Run the two drivers until a fatal failure or SIGTERM. On SIGTERM no new epochs are started
/// and in-flight pipeline invocations complete their current transaction before the process
/// exits.
pub async fn run<N, S, L>(
    config: Config,
    node: N,
    pipeline: Pipeline<N, S, L>,
    mut sigterm: Signal,
) -> anyhow::Result<()>
where
    N: ChainNode,
    S: Storage,
    L: EpochLock,
{
    let tracker = Arc::new(FailureTracker::new(
        Duration::from_millis(config.failure_window_ms),
        config.max_consecutive_failures,
    ));
    let (shutdown_sender, shutdown) = watch::channel(false);

    let mut sweeper_task = task::spawn(sweeper(
        config.clone(),
        node.clone(),
        pipeline.clone(),
        tracker.clone(),
        shutdown.clone(),
    ));
    let mut tip_task = task::spawn(tip_runner(
        config,
        node,
        pipeline,
        tracker,
        shutdown,
    ));

    select! {
        result = &mut sweeper_task => {
            tip_task.abort();
            result
                .context("historical sweeper panicked")
                .and_then(|result| result.context("historical sweeper failed"))
        }

        result = &mut tip_task => {
            sweeper_task.abort();
            result
                .context("tip runner panicked")
                .and_then(|result| result.context("tip runner failed"))
        }

        _ = sigterm.recv() => {
            warn!("SIGTERM received");
            let _ = shutdown_sender.send(true);
            let _ = (&mut sweeper_task).await;
            let _ = (&mut tip_task).await;
            Ok(())
        }
    }
}

/// The historical sweeper: walk epochs downward from just below the tip, restarted
/// unconditionally on a fixed period.
async fn sweeper<N, S, L>(
    config: Config,
    node: N,
    pipeline: Pipeline<N, S, L>,
    tracker: Arc<FailureTracker>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    N: ChainNode,
    S: Storage,
    L: EpochLock,
{
    let restart_after = Duration::from_millis(config.main_restart_ms);

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        match timeout(
            restart_after,
            sweep_driver(&config, &node, &pipeline, &tracker, &mut shutdown),
        )
        .await
        {
            Ok(Err(fatal)) => return Err(fatal),
            Ok(Ok(true)) => return Ok(()),
            Ok(Ok(false)) => {}
            Err(_elapsed) => info!("restarting historical sweeper"),
        }
    }
}

/// One incarnation of the sweeper. Returns `Ok(true)` on shutdown, `Ok(false)` when the sweep
/// ran out of epochs, and `Err` on a fatal failure threshold breach.
async fn sweep_driver<N, S, L>(
    config: &Config,
    node: &N,
    pipeline: &Pipeline<N, S, L>,
    tracker: &FailureTracker,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<bool>
where
    N: ChainNode,
    S: Storage,
    L: EpochLock,
{
    // Non-authoritative: reduces redundant completion checks within this incarnation; the
    // completion table is the source of truth.
    let mut attempted = HashSet::<Epoch>::new();

    let current_epoch = match with_retry(|| node.current_epoch()).await {
        Ok(epoch) => epoch,

        Err(error) => {
            warn!(error:%; "cannot read current epoch, backing off");
            return Ok(pause(shutdown, config.sweep_cycle_pause).await);
        }
    };

    info!(current_epoch; "historical sweep started");
    let mut next = current_epoch.saturating_sub(SWEEP_START_OFFSET);

    loop {
        for _ in 0..config.sweep_epochs_per_cycle {
            if *shutdown.borrow() {
                return Ok(true);
            }
            if next == 0 {
                info!("historical sweep reached the first epoch");
                return Ok(false);
            }

            let epoch = next;
            next -= 1;

            if !attempted.insert(epoch) {
                continue;
            }
            let _ = process_epoch(pipeline, tracker, epoch).await?;
        }

        if pause(shutdown, config.sweep_cycle_pause).await {
            return Ok(true);
        }
    }
}

/// The tip runner: after a warm-up, repeatedly race the sweeper for the most recent settled
/// epochs so the tip of the dataset is never stale.
async fn tip_runner<N, S, L>(
    config: Config,
    node: N,
    pipeline: Pipeline<N, S, L>,
    tracker: Arc<FailureTracker>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    N: ChainNode,
    S: Storage,
    L: EpochLock,
{
    if pause(&mut shutdown, Duration::from_millis(config.tip_warmup_ms)).await {
        return Ok(());
    }

    let tip_interval = Duration::from_millis(config.tip_interval_ms);
    let mut attempted = HashSet::<Epoch>::new();

    loop {
        let current_epoch = match with_retry(|| node.current_epoch()).await {
            Ok(epoch) => Some(epoch),

            Err(error) => {
                warn!(error:%; "cannot read current epoch at the tip");
                None
            }
        };

        if let Some(current_epoch) = current_epoch {
            for offset in TIP_OFFSETS {
                if *shutdown.borrow() {
                    return Ok(());
                }

                let Some(epoch) = current_epoch.checked_sub(offset) else {
                    continue;
                };
                if epoch == 0 || attempted.contains(&epoch) {
                    continue;
                }

                // Failed epochs stay retryable on the next tick.
                if let Some(Outcome::Committed | Outcome::SkippedCompleted) =
                    process_epoch(&pipeline, &tracker, epoch).await?
                {
                    attempted.insert(epoch);
                }
            }
        }

        if pause(&mut shutdown, tip_interval).await {
            return Ok(());
        }
    }
}

/// Hand one epoch to the pipeline and account for the result. `Err` means the failure
/// threshold was breached and the process must die.
async fn process_epoch<N, S, L>(
    pipeline: &Pipeline<N, S, L>,
    tracker: &FailureTracker,
    epoch: Epoch,
) -> anyhow::Result<Option<Outcome>>
where
    N: ChainNode,
    S: Storage,
    L: EpochLock,
{
    match pipeline.process(epoch).await {
        Ok(outcome) => {
            if outcome == Outcome::Committed {
                tracker.record_success();
            }
            Ok(Some(outcome))
        }

        // The pipeline has already recorded the error row and released the lock; the tracker
        // decides whether the process survives.
        Err(error) => {
            if tracker.record_failure() {
                bail!("failure threshold breached at epoch {epoch}: {error}");
            }
            Ok(None)
        }
    }
}

/// Sleep, returning early with `true` when shutdown is requested.
async fn pause(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }

    select! {
        _ = sleep(duration) => false,
        _ = shutdown.changed() => true,
    }
}

/// Sliding-window failure accounting shared by both drivers; successful processing resets it.
struct FailureTracker {
    window: Duration,
    max_failures: u32,
    failures: Mutex<VecDeque<Instant>>,
}

impl FailureTracker {
    fn new(window: Duration, max_failures: u32) -> Self {
        Self {
            window,
            max_failures,
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a failure; returns `true` when the threshold is reached.
    fn record_failure(&self) -> bool {
        let mut failures = self.failures.lock();
        let now = Instant::now();

        while failures
            .front()
            .is_some_and(|&at| now.duration_since(at) > self.window)
        {
            failures.pop_front();
        }
        failures.push_back(now);

        failures.len() >= self.max_failures as usize
    }

    fn record_success(&self) {
        self.failures.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        application::{Config, FailureTracker, sweep_driver},
        domain::pipeline::tests::{MockChain, MockLock, MockStorage, pipeline, raw_event},
    };
    use std::time::Duration;
    use tokio::sync::watch;

    #[test]
    fn test_failure_tracker() {
        let tracker = FailureTracker::new(Duration::from_secs(600), 3);

        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(tracker.record_failure());

        tracker.record_success();
        assert!(!tracker.record_failure());
    }

    fn healthy_chain(epochs: std::ops::RangeInclusive<u64>, current: u64) -> MockChain {
        let mut chain = MockChain {
            max_epoch: current,
            current,
            ..Default::default()
        };

        for epoch in epochs {
            let start_block = MockChain::start_block(epoch);
            chain
                .stake_ups
                .push(raw_event(epoch, start_block + 10, 1, 2));
            chain
                .stake_ups
                .push(raw_event(epoch, start_block + 20, 2, 1));
            chain
                .stake_downs
                .push(raw_event(epoch, start_block + 30, 3, 1));
        }

        chain
    }

    fn config() -> Config {
        Config {
            sweep_cycle_pause: Duration::from_millis(0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sweep_driver_commits_downward() {
        let chain = healthy_chain(1..=3, 5);
        let storage = MockStorage::default();
        let lock = MockLock::default();
        let pipeline = pipeline(chain.clone(), storage.clone(), lock.clone());
        let tracker = FailureTracker::new(Duration::from_secs(600), 3);
        let (_sender, mut shutdown) = watch::channel(false);

        let shutdown_requested = sweep_driver(&config(), &chain, &pipeline, &tracker, &mut shutdown)
            .await
            .expect("sweep driver succeeds");

        assert!(!shutdown_requested);

        let state = storage.0.lock();
        let committed = state
            .commits
            .iter()
            .map(|commit| commit.round.epoch)
            .collect::<Vec<_>>();
        assert_eq!(committed, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_sweep_driver_fatal_after_failure_threshold() {
        // Rounds exist but carry no stakes, so every epoch fails validation.
        let chain = MockChain {
            max_epoch: 100,
            current: 100,
            ..Default::default()
        };
        let storage = MockStorage::default();
        let lock = MockLock::default();
        let pipeline = pipeline(chain.clone(), storage.clone(), lock.clone());
        let tracker = FailureTracker::new(Duration::from_secs(600), 3);
        let (_sender, mut shutdown) = watch::channel(false);

        let error = sweep_driver(&config(), &chain, &pipeline, &tracker, &mut shutdown)
            .await
            .expect_err("third failure is fatal");
        assert!(error.to_string().contains("failure threshold"));

        // Exactly three epochs were attempted before the breaker tripped.
        assert_eq!(storage.0.lock().errors.len(), 3);
    }

    #[tokio::test]
    async fn test_sweep_driver_stops_on_shutdown() {
        let chain = healthy_chain(1..=3, 5);
        let storage = MockStorage::default();
        let lock = MockLock::default();
        let pipeline = pipeline(chain.clone(), storage.clone(), lock.clone());
        let tracker = FailureTracker::new(Duration::from_secs(600), 3);
        let (sender, mut shutdown) = watch::channel(false);

        sender.send(true).expect("receiver is alive");

        let stopped = sweep_driver(&config(), &chain, &pipeline, &tracker, &mut shutdown)
            .await
            .expect("sweep driver succeeds");
        assert!(stopped);
        assert!(storage.0.lock().commits.is_empty());
    }
}
