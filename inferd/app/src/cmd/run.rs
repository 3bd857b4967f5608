// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Wire the sidecar together and run it until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use inferd_api::state::{ApiState, NodeIdentity};
use inferd_api::worker::{WorkerConfig, WorkerPool};
use inferd_chain_message::tx::TxSigner;
use inferd_chain_rpc::HttpChainClient;
use inferd_queue::mem::MemoryQueue;
use inferd_txmgr::{spawn_consumers, TxManager, TxManagerConfig};

use crate::cmd::key::read_secret_key;
use crate::settings::Settings;

pub async fn exec(settings: Settings) -> anyhow::Result<()> {
    let secret = read_secret_key(&settings.signing_key())?;
    let signer = TxSigner::new(
        secret.clone(),
        &settings.address_prefix,
        settings.chain_id.clone(),
    )?;
    let address = signer.address().to_string();
    tracing::info!(address, "node identity loaded");

    let client = HttpChainClient::new_http(settings.tendermint_rpc_url()?, None)
        .context("cannot create chain client")?;

    let queue = MemoryQueue::new();

    let manager = TxManager::new(
        client.clone(),
        queue.clone(),
        signer,
        TxManagerConfig {
            tx_timeout: settings.broadcast.tx_timeout,
            sync_wait: settings.broadcast.sync_wait,
            send_nack_delay: settings.broadcast.send_retry_delay,
            observe_nack_delay: settings.broadcast.observe_retry_delay,
            max_attempts: settings.broadcast.max_attempts,
            max_block_timeout: settings.broadcast.max_block_timeout,
            ..TxManagerConfig::default()
        },
    );

    let token = CancellationToken::new();
    let consumers = spawn_consumers(manager.clone(), token.clone());

    let workers = WorkerPool::new(
        settings
            .workers
            .iter()
            .map(|w| WorkerConfig {
                url: w.url.clone(),
                models: w.models.clone(),
                concurrency: w.concurrency,
            })
            .collect(),
        reqwest::Client::new(),
    );

    let state = Arc::new(ApiState::new(
        manager,
        client,
        NodeIdentity {
            secret,
            address,
            public_url: settings.api.public_url.clone(),
            fee_denom: settings.fee_denom.clone(),
        },
        workers,
    ));

    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; shutting down");
            interrupt.cancel();
        }
    });

    let listen_addr = settings.listen_addr()?;
    inferd_api::listen(listen_addr, state, token.clone()).await?;

    // The server is down; stop the consumers after their in-flight work.
    token.cancel();
    for consumer in consumers {
        let _ = consumer.await;
    }
    Ok(())
}
