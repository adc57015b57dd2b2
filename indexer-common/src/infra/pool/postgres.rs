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

use derive_more::{Debug, Deref};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::time::Duration;

/// Configuration for the Postgres connection pool.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Postgres connection string.
    #[debug(skip)]
    pub url: SecretString,

    #[serde(default = "max_connections_default")]
    pub max_connections: u32,

    #[serde(default = "min_connections_default")]
    pub min_connections: u32,

    /// How long to wait for a connection from the pool.
    #[serde(with = "humantime_serde", default = "acquire_timeout_default")]
    pub acquire_timeout: Duration,

    /// Server-side statement timeout applied to every connection.
    #[serde(with = "humantime_serde", default = "statement_timeout_default")]
    pub statement_timeout: Duration,
}

const fn max_connections_default() -> u32 {
    10
}

const fn min_connections_default() -> u32 {
    2
}

const fn acquire_timeout_default() -> Duration {
    Duration::from_secs(10)
}

const fn statement_timeout_default() -> Duration {
    Duration::from_secs(30)
}

/// Postgres connection pool.
#[derive(Debug, Clone, Deref)]
pub struct PostgresPool(PgPool);

impl PostgresPool {
    /// Create a new [PostgresPool] with the given config.
    pub async fn new(config: Config) -> Result<Self, sqlx::Error> {
        let Config {
            url,
            max_connections,
            min_connections,
            acquire_timeout,
            statement_timeout,
        } = config;

        let connect_options = url
            .expose_secret()
            .parse::<PgConnectOptions>()?
            .options([(
                "statement_timeout",
                statement_timeout.as_millis().to_string(),
            )]);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(acquire_timeout)
            .connect_with(connect_options)
            .await?;

        Ok(Self(pool))
    }
}
