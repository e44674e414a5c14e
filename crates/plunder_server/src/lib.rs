// SPDX-License-Identifier: AGPL-3.0-only
// Copyright Authors of plunder

pub mod auth;
pub mod collector;
pub mod config;
mod ops;
pub mod processing;
pub mod storage;
pub mod ws;

use crate::auth::StaticTokenVerifier;
use crate::collector::{CollectorConfig, FlagCollector};
use crate::config::Config;
use crate::processing::ProcessingManager;
use crate::storage::{FlagStore, MemoryFlagStore};
use crate::ws::{KeepaliveConfig, Registry};
use color_eyre::eyre::{Context, Result};
use plunder_common::runtime::create_shutdown_cancellation_token;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info};

pub async fn main(config: Config) -> Result<()> {
    let cancellation_token = create_shutdown_cancellation_token();
    run(config, cancellation_token).await
}

pub async fn run(
    config: Config,
    cancellation_token: tokio_util::sync::CancellationToken,
) -> Result<()> {
    info!("starting server");

    let store: Arc<dyn FlagStore> = Arc::new(MemoryFlagStore::new());
    let verifier = Arc::new(StaticTokenVerifier::new(config.auth_token.clone()));
    let collector = Arc::new(FlagCollector::new(
        store.clone(),
        CollectorConfig::default(),
    ));
    collector.start();

    let registry = Arc::new(Registry::new(
        collector.clone(),
        KeepaliveConfig::default(),
    ));
    let manager = Arc::new(ProcessingManager::new(
        store.clone(),
        registry.clone(),
        cancellation_token.clone(),
    ));
    manager.apply(config.shared_config());

    let ws_addr: SocketAddr = config
        .ws_listen
        .parse()
        .context("unable to parse the websocket listening address")?;
    let ws_listener = TcpListener::bind(ws_addr)
        .await
        .context("unable to start the websocket listener, is the port taken?")?;
    info!("listening on {ws_addr:?}");

    let ops_addr: SocketAddr = config
        .ops_listen
        .parse()
        .context("unable to parse the operational listening address")?;
    let ops_listener = TcpListener::bind(ops_addr)
        .await
        .context("unable to start the operational listener, is the port taken?")?;

    let mut set = JoinSet::new();
    set.spawn(ws::listen(
        ws_listener,
        registry.clone(),
        verifier,
        cancellation_token.clone(),
    ));
    set.spawn(ops::serve(
        ops_listener,
        collector.clone(),
        manager,
        cancellation_token.clone(),
    ));

    join_and_shutdown(set, collector, registry, cancellation_token).await?;

    info!("server stopped");
    Ok(())
}

/// Waits for the listener tasks and then takes the orderly shutdown: the
/// processing loop's child token is already cancelled, the collector takes
/// its final flush, then the live connections are closed. A failed task
/// must not skip that sequence, so the first error is held until the final
/// flush has run. Nothing buffered is silently lost.
async fn join_and_shutdown(
    mut set: JoinSet<Result<()>>,
    collector: Arc<FlagCollector>,
    registry: Arc<Registry>,
    cancellation_token: tokio_util::sync::CancellationToken,
) -> Result<()> {
    let mut failure: Option<color_eyre::eyre::Report> = None;
    while let Some(res) = set.join_next().await {
        match res.map_err(Into::into).and_then(|res| res) {
            Ok(()) => {}
            Err(error) => {
                // take the remaining tasks down with it
                cancellation_token.cancel();
                failure.get_or_insert(error);
            }
        }
    }

    if let Err(error) = collector.stop().await {
        error! {
            ?error,
            "final flush failed during shutdown"
        }
    }
    registry.close_all();

    match failure {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
