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

use crate::domain::{Epoch, lock::EpochLock};
use derive_more::Debug;
use log::warn;
use redis::aio::ConnectionManager;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;

/// The opaque value stored under a held lock key; holder identity is not verified, the
/// completion marker is the authoritative idempotence check.
const LOCK_VALUE: &str = "processing";

/// Configuration for the Redis lock service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Redis connection string.
    #[debug(skip)]
    pub url: SecretString,

    /// Key namespace, allowing several deployments to share one Redis.
    #[serde(default = "namespace_default")]
    pub namespace: String,
}

fn namespace_default() -> String {
    "round-indexer".to_string()
}

/// Redis based implementation of [EpochLock]: atomic set-if-absent with expiry under
/// `lock:{namespace}:epoch:{epoch}`.
#[derive(Debug, Clone)]
pub struct RedisLock {
    #[debug(skip)]
    connection: ConnectionManager,
    namespace: String,
}

impl RedisLock {
    /// Connect to the lock service. The connection manager reconnects on its own; individual
    /// commands fail while the service is unreachable, which `acquire` maps to `false`.
    pub async fn connect(config: Config) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(config.url.expose_secret())?;
        let connection = ConnectionManager::new(client).await?;

        Ok(Self {
            connection,
            namespace: config.namespace,
        })
    }

    fn key(&self, epoch: Epoch) -> String {
        format!("lock:{}:epoch:{}", self.namespace, epoch)
    }
}

impl EpochLock for RedisLock {
    async fn acquire(&self, epoch: Epoch, ttl: Duration) -> bool {
        let mut connection = self.connection.clone();

        let response: redis::RedisResult<Option<String>> = redis::cmd("SET")
            .arg(self.key(epoch))
            .arg(LOCK_VALUE)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut connection)
            .await;

        match response {
            Ok(reply) => reply.is_some(),

            // Fail closed: without the lock service there is no mutual exclusion.
            Err(error) => {
                warn!(epoch, error:%; "lock service unreachable, treating epoch as locked");
                false
            }
        }
    }

    async fn extend(&self, epoch: Epoch, ttl: Duration) -> bool {
        let mut connection = self.connection.clone();

        let response: redis::RedisResult<i64> = redis::cmd("PEXPIRE")
            .arg(self.key(epoch))
            .arg(ttl.as_millis() as u64)
            .query_async(&mut connection)
            .await;

        match response {
            Ok(reply) => reply == 1,

            Err(error) => {
                warn!(epoch, error:%; "cannot extend epoch lock");
                false
            }
        }
    }

    async fn release(&self, epoch: Epoch) {
        let mut connection = self.connection.clone();

        let response: redis::RedisResult<i64> = redis::cmd("DEL")
            .arg(self.key(epoch))
            .query_async(&mut connection)
            .await;

        if let Err(error) = response {
            warn!(epoch, error:%; "cannot release epoch lock");
        }
    }
}
