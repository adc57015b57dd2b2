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
    Epoch, EventStream, Price, RawEvent,
    node::{BlockHeader, ChainNode, NodeError, RoundMeta},
};
use alloy::{
    eips::BlockNumberOrTag,
    primitives::{Address, B256, I256, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::{Filter, Log},
    sol,
    sol_types::SolEvent,
    transports::{RpcError, TransportErrorKind},
};
use serde::Deserialize;
use std::{future::IntoFuture, time::Duration};
use tokio::time::timeout;

sol! {
    #[sol(rpc)]
    contract PredictionMarket {
        event RoundStart(uint256 indexed epoch);
        event RoundLock(uint256 indexed epoch, int256 price);
        event RoundEnd(uint256 indexed epoch, int256 price);
        event StakeUp(address indexed sender, uint256 indexed epoch, uint256 amount);
        event StakeDown(address indexed sender, uint256 indexed epoch, uint256 amount);
        event Claim(address indexed sender, uint256 indexed epoch, uint256 amount);

        function currentEpoch() external view returns (uint256);

        function rounds(uint256 epoch)
            external
            view
            returns (
                uint256 epochId,
                uint256 startTimestamp,
                uint256 lockTimestamp,
                uint256 closeTimestamp,
                int256 lockPrice,
                int256 closePrice,
                uint256 totalAmount,
                uint256 upAmount,
                uint256 downAmount,
                bool oracleCalled
            );
    }
}

/// Configuration for the chain node.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP JSON-RPC endpoint.
    pub url: String,

    /// The 20-byte address of the market contract.
    pub contract_address: Address,

    /// Deadline applied to every RPC call.
    #[serde(with = "humantime_serde", default = "rpc_timeout_default")]
    pub rpc_timeout: Duration,
}

const fn rpc_timeout_default() -> Duration {
    Duration::from_secs(30)
}

/// [ChainNode] implementation over an HTTP JSON-RPC provider. Stateless and cheap to clone;
/// every call carries the configured deadline.
#[derive(Clone)]
pub struct RpcNode {
    provider: DynProvider,
    contract_address: Address,
    rpc_timeout: Duration,
}

impl RpcNode {
    pub async fn connect(config: Config) -> Result<Self, NodeError> {
        let provider = ProviderBuilder::new()
            .connect(&config.url)
            .await
            .map_err(|error| NodeError::Permanent(format!("cannot connect provider: {error}")))?
            .erased();

        Ok(Self {
            provider,
            contract_address: config.contract_address,
            rpc_timeout: config.rpc_timeout,
        })
    }

    fn contract(&self) -> PredictionMarket::PredictionMarketInstance<DynProvider> {
        PredictionMarket::new(self.contract_address, self.provider.clone())
    }

    async fn deadline<T>(
        &self,
        future: impl IntoFuture<Output = T, IntoFuture: Send>,
    ) -> Result<T, NodeError> {
        timeout(self.rpc_timeout, future.into_future())
            .await
            .map_err(|_| NodeError::Transient("RPC call timed out".to_string()))
    }
}

impl ChainNode for RpcNode {
    async fn current_epoch(&self) -> Result<Epoch, NodeError> {
        let epoch = self
            .deadline(self.contract().currentEpoch().call())
            .await?
            .map_err(classify_contract_error)?;

        Ok(epoch.to::<u64>())
    }

    async fn round_meta(&self, epoch: Epoch) -> Result<RoundMeta, NodeError> {
        let round = self
            .deadline(self.contract().rounds(U256::from(epoch)).call())
            .await?
            .map_err(classify_contract_error)?;

        // Some deployments return a zeroed struct instead of reverting for rounds that do not
        // exist yet.
        if round.startTimestamp.is_zero() {
            return Err(NodeError::Permanent(format!("round {epoch} does not exist")));
        }

        Ok(RoundMeta {
            epoch,
            start_ts: round.startTimestamp.to::<u64>(),
            lock_ts: round.lockTimestamp.to::<u64>(),
            close_ts: round.closeTimestamp.to::<u64>(),
            lock_price: price_from_raw(round.lockPrice),
            close_price: if round.oracleCalled {
                price_from_raw(round.closePrice)
            } else {
                None
            },
            oracle_called: round.oracleCalled,
        })
    }

    async fn latest_block(&self) -> Result<u64, NodeError> {
        self.deadline(self.provider.get_block_number())
            .await?
            .map_err(classify_rpc_error)
    }

    async fn block_header(&self, height: u64) -> Result<BlockHeader, NodeError> {
        let block = self
            .deadline(
                self.provider
                    .get_block_by_number(BlockNumberOrTag::Number(height)),
            )
            .await?
            .map_err(classify_rpc_error)?
            .ok_or_else(|| NodeError::Permanent(format!("block {height} not found")))?;

        Ok(BlockHeader {
            height,
            timestamp: block.header.timestamp,
        })
    }

    async fn logs(
        &self,
        stream: EventStream,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawEvent>, NodeError> {
        let filter = Filter::new()
            .address(self.contract_address)
            .event_signature(signature_hash(stream))
            .from_block(from)
            .to_block(to);

        let logs = self
            .deadline(self.provider.get_logs(&filter))
            .await?
            .map_err(classify_rpc_error)?;

        logs.into_iter().map(|log| decode_event(stream, log)).collect()
    }
}

fn signature_hash(stream: EventStream) -> B256 {
    match stream {
        EventStream::RoundStart => PredictionMarket::RoundStart::SIGNATURE_HASH,
        EventStream::RoundLock => PredictionMarket::RoundLock::SIGNATURE_HASH,
        EventStream::RoundEnd => PredictionMarket::RoundEnd::SIGNATURE_HASH,
        EventStream::StakeUp => PredictionMarket::StakeUp::SIGNATURE_HASH,
        EventStream::StakeDown => PredictionMarket::StakeDown::SIGNATURE_HASH,
        EventStream::Claim => PredictionMarket::Claim::SIGNATURE_HASH,
    }
}

/// Uniform decoding across the six streams; only the signature-to-field mapping differs.
fn decode_event(stream: EventStream, log: Log) -> Result<RawEvent, NodeError> {
    let block_height = log
        .block_number
        .ok_or_else(|| NodeError::Permanent(format!("{stream} log without block number")))?;
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| NodeError::Permanent(format!("{stream} log without transaction hash")))?;
    let log_index = log
        .log_index
        .ok_or_else(|| NodeError::Permanent(format!("{stream} log without log index")))?;

    let decode_failure =
        |error: alloy::sol_types::Error| NodeError::Permanent(format!("cannot decode {stream} event: {error}"));

    let (epoch, sender, amount, price) = match stream {
        EventStream::RoundStart => {
            let event = PredictionMarket::RoundStart::decode_log(&log.inner)
                .map_err(decode_failure)?
                .data;
            (event.epoch, None, None, None)
        }

        EventStream::RoundLock => {
            let event =
                PredictionMarket::RoundLock::decode_log(&log.inner).map_err(decode_failure)?
                .data;
            (event.epoch, None, None, price_from_raw(event.price))
        }

        EventStream::RoundEnd => {
            let event =
                PredictionMarket::RoundEnd::decode_log(&log.inner).map_err(decode_failure)?
                .data;
            (event.epoch, None, None, price_from_raw(event.price))
        }

        EventStream::StakeUp => {
            let event =
                PredictionMarket::StakeUp::decode_log(&log.inner).map_err(decode_failure)?
                .data;
            (event.epoch, Some(event.sender), Some(event.amount), None)
        }

        EventStream::StakeDown => {
            let event =
                PredictionMarket::StakeDown::decode_log(&log.inner).map_err(decode_failure)?
                .data;
            (event.epoch, Some(event.sender), Some(event.amount), None)
        }

        EventStream::Claim => {
            let event =
                PredictionMarket::Claim::decode_log(&log.inner).map_err(decode_failure)?
                .data;
            (event.epoch, Some(event.sender), Some(event.amount), None)
        }
    };

    Ok(RawEvent {
        epoch: epoch.to::<u64>(),
        sender,
        amount,
        price,
        block_height,
        tx_hash,
        log_index,
    })
}

fn price_from_raw(raw: I256) -> Option<Price> {
    if raw.is_zero() {
        return None;
    }
    i64::try_from(raw).ok().map(Price::from_scaled)
}

/// Throttling and transport problems are retryable; everything the provider answered with a
/// proper error response is treated as permanent, except rate-limit responses.
fn classify_rpc_error(error: RpcError<TransportErrorKind>) -> NodeError {
    match &error {
        RpcError::ErrorResp(payload) => {
            let throttled =
                payload.code == -32005 || payload.message.to_lowercase().contains("limit");
            if throttled {
                NodeError::Transient(error.to_string())
            } else {
                NodeError::Permanent(error.to_string())
            }
        }

        _ => NodeError::Transient(error.to_string()),
    }
}

fn classify_contract_error(error: alloy::contract::Error) -> NodeError {
    match error {
        alloy::contract::Error::TransportError(transport) => classify_rpc_error(transport),

        // Reverts, ABI and decoding problems do not heal on retry.
        other => NodeError::Permanent(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        domain::EventStream,
        infra::node::{PredictionMarket, signature_hash},
    };
    use alloy::sol_types::SolEvent;

    #[test]
    fn test_signature_hashes_are_distinct() {
        let mut hashes = EventStream::ALL.map(signature_hash).to_vec();
        hashes.sort();
        hashes.dedup();
        assert_eq!(hashes.len(), 6);
    }

    #[test]
    fn test_stake_signatures() {
        assert_eq!(
            PredictionMarket::StakeUp::SIGNATURE,
            "StakeUp(address,uint256,uint256)"
        );
        assert_eq!(
            PredictionMarket::StakeDown::SIGNATURE,
            "StakeDown(address,uint256,uint256)"
        );
    }
}
