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

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::de::DeserializeOwned;

const CONFIG_FILE_ENV_VAR: &str = "CONFIG_FILE";
const DEFAULT_CONFIG_FILE: &str = "config.yaml";
const ENV_PREFIX: &str = "APP__";
const ENV_SEPARATOR: &str = "__";

/// Extension methods for loading a configuration from a YAML file overridden by environment
/// variables.
pub trait ConfigExt
where
    Self: DeserializeOwned,
{
    /// Bare environment variables recognized in addition to the `APP__` prefixed ones, each
    /// mapped onto its nested configuration key (separated by `__`). Deployments that only
    /// speak flat environment variables configure the process through these.
    const ENV_ALIASES: &'static [(&'static str, &'static str)] = &[];

    /// Load the configuration from the YAML file given by `CONFIG_FILE` (default `config.yaml`),
    /// then override with `APP__` prefixed environment variables and finally with the bare
    /// aliases from [`Self::ENV_ALIASES`].
    fn load() -> Result<Self, figment::Error> {
        let config_file =
            std::env::var(CONFIG_FILE_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let figment = Figment::new()
            .merge(Yaml::file(config_file))
            .merge(Env::prefixed(ENV_PREFIX).split(ENV_SEPARATOR));

        Self::ENV_ALIASES
            .iter()
            .copied()
            .fold(figment, |figment, (var, key)| {
                figment.merge(
                    Env::raw()
                        .only(&[var])
                        .map(move |_| key.into())
                        .split(ENV_SEPARATOR),
                )
            })
            .extract()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ConfigExt;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Config {
        chain: ChainConfig,
    }

    #[derive(Debug, Deserialize)]
    struct ChainConfig {
        url: String,
        timeout_secs: u64,
    }

    impl ConfigExt for Config {
        const ENV_ALIASES: &'static [(&'static str, &'static str)] =
            &[("CHAIN_URL", "chain__url")];
    }

    #[test]
    fn test_load() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                "chain:\n  url: http://localhost:8545\n  timeout_secs: 30\n",
            )?;

            let config = Config::load().expect("config can be loaded");
            assert_eq!(config.chain.url, "http://localhost:8545");
            assert_eq!(config.chain.timeout_secs, 30);

            jail.set_env("APP__CHAIN__TIMEOUT_SECS", "10");
            jail.set_env("CHAIN_URL", "http://rpc.example.com");

            let config = Config::load().expect("config can be loaded");
            assert_eq!(config.chain.url, "http://rpc.example.com");
            assert_eq!(config.chain.timeout_secs, 10);

            Ok(())
        });
    }
}
