// This file is part of round-indexer.
// Copyright (C) 2025 Parlay Labs
// SPDX-License-Identifier: Apache-2.0

#[tokio::main]
async fn main() {
    use indexer_common::telemetry;
    use log::error;
    use std::panic;

    telemetry::init_logging();
    panic::set_hook(Box::new(|panic| error!(panic:%; "process panicked")));

    if let Err(error) = run().await {
        let backtrace = error.backtrace();
        let error = format!("{error:#}");
        error!(error, backtrace:%; "process exited with ERROR");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    use anyhow::Context;
    use indexer_common::{config::ConfigExt, infra::pool::postgres::PostgresPool, telemetry};
    use log::info;
    use round_indexer::{
        application,
        config::{Config, InfraConfig},
        domain::pipeline::Pipeline,
        infra::{lock::RedisLock, migrations, node::RpcNode, storage::PostgresStorage},
    };
    use tokio::signal::unix::{SignalKind, signal};

    let sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler can be registered");

    let config = Config::load().context("load configuration")?;
    info!(config:?; "starting");

    let Config {
        run_migrations,
        application_config,
        pipeline_config,
        locator_config,
        harvester_config,
        validator_config,
        infra_config:
            InfraConfig {
                node_config,
                storage_config,
                lock_config,
            },
        telemetry_config,
    } = config;

    telemetry::init_metrics(telemetry_config.metrics_config);

    let pool = PostgresPool::new(storage_config)
        .await
        .context("create DB pool for Postgres")?;
    if run_migrations {
        migrations::run(&pool)
            .await
            .context("run database migrations")?;
    }

    let node = RpcNode::connect(node_config)
        .await
        .context("connect chain node")?;
    let lock = RedisLock::connect(lock_config)
        .await
        .context("connect lock service")?;
    let storage = PostgresStorage::new(pool);

    let pipeline = Pipeline::new(
        node.clone(),
        storage,
        lock,
        pipeline_config,
        locator_config,
        harvester_config,
        validator_config,
    );

    application::run(application_config, node, pipeline, sigterm)
        .await
        .context("run round indexer")
}
