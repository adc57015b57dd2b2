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

use log::{LevelFilter, error};
use logforth::append::Stderr;
use logforth::record::{Level, LevelFilter as LogforthLevelFilter};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::net::SocketAddr;

/// Convert a `log` crate level filter to the equivalent logforth level filter.
fn to_logforth_level_filter(level: LevelFilter) -> LogforthLevelFilter {
    match level {
        LevelFilter::Off => LogforthLevelFilter::Off,
        LevelFilter::Error => LogforthLevelFilter::MoreSevereEqual(Level::Error),
        LevelFilter::Warn => LogforthLevelFilter::MoreSevereEqual(Level::Warn),
        LevelFilter::Info => LogforthLevelFilter::MoreSevereEqual(Level::Info),
        LevelFilter::Debug => LogforthLevelFilter::MoreSevereEqual(Level::Debug),
        LevelFilter::Trace => LogforthLevelFilter::MoreSevereEqual(Level::Trace),
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Prometheus exporter configuration; metrics are only exposed when set.
    #[serde(rename = "metrics", default)]
    pub metrics_config: Option<MetricsConfig>,
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Listen address for the scrape endpoint.
    pub address: SocketAddr,
}

/// Initialize structured logging to stderr; the level is taken from `RUST_LOG`, defaulting to
/// `info`.
pub fn init_logging() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|level| level.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);

    logforth::starter_log::builder()
        .dispatch(|dispatch| {
            dispatch
                .filter(to_logforth_level_filter(level))
                .append(Stderr::default())
        })
        .apply();
}

/// Initialize the Prometheus metrics exporter if configured. Must be called from within a Tokio
/// runtime.
pub fn init_metrics(config: Option<MetricsConfig>) {
    if let Some(MetricsConfig { address }) = config {
        if let Err(err) = PrometheusBuilder::new()
            .with_http_listener(address)
            .install()
        {
            error!(error:% = err; "cannot install Prometheus metrics exporter");
        }
    }
}
