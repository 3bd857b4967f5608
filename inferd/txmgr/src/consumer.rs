// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Background consumers of the two durable streams.
//!
//! Each runs as an independent task and settles every delivery exactly one
//! way: ack (done), nack-with-delay (try again later) or term (poison).
//! Neither consumer acks a record before it has been broadcast, re-queued or
//! confirmed, which keeps the at-least-once chain unbroken across restarts.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use inferd_chain_message::Msg;
use inferd_chain_rpc::{ChainClient, ChainRpcError};
use inferd_queue::{Delivery, DurableQueue, QueueResult, StreamSubscription};

use crate::record::{TxRecord, TxToSend, OBSERVE_STREAM, SEND_STREAM};
use crate::TxManager;

const SEND_CONSUMER: &str = "txmgr-send";
const OBSERVE_CONSUMER: &str = "txmgr-observe";

/// Start both stream consumers. They stop after the in-flight delivery once
/// the token is cancelled.
pub fn spawn_consumers<C, Q>(
    manager: TxManager<C, Q>,
    token: CancellationToken,
) -> Vec<JoinHandle<()>>
where
    C: ChainClient + 'static,
    Q: DurableQueue,
{
    let send = {
        let manager = manager.clone();
        let token = token.clone();
        tokio::spawn(async move { run_send_consumer(manager, token).await })
    };
    let observe = tokio::spawn(async move { run_observe_consumer(manager, token).await });
    vec![send, observe]
}

pub async fn run_send_consumer<C, Q>(manager: TxManager<C, Q>, token: CancellationToken)
where
    C: ChainClient,
    Q: DurableQueue,
{
    let mut sub = match manager.queue_handle().subscribe(SEND_STREAM, SEND_CONSUMER).await {
        Ok(sub) => sub,
        Err(e) => {
            tracing::error!(error = e.to_string(), "cannot subscribe to send stream");
            return;
        }
    };

    loop {
        let delivery = tokio::select! {
            _ = token.cancelled() => break,
            d = sub.next() => match d {
                Some(d) => d,
                None => break,
            },
        };
        if let Err(e) = handle_send(&manager, delivery).await {
            tracing::warn!(error = e.to_string(), "failed to settle send delivery");
        }
    }
    tracing::debug!("send consumer stopped");
}

async fn handle_send<C, Q, D>(manager: &TxManager<C, Q>, delivery: D) -> QueueResult<()>
where
    C: ChainClient,
    Q: DurableQueue,
    D: Delivery,
{
    manager.tracker().update(manager.client()).await;
    if manager.tracker().chain_halted() {
        return delivery
            .nack_with_delay(manager.config().halt_redeliver_delay)
            .await;
    }

    let mut to_send: TxToSend = match serde_json::from_slice(delivery.payload()) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = e.to_string(), "malformed send record; dropping");
            return delivery.term().await;
        }
    };

    if to_send.attempts >= manager.config().max_attempts {
        tracing::warn!(
            id = %to_send.info.id,
            attempts = to_send.attempts,
            "giving up on transaction after max attempts"
        );
        return delivery.ack().await;
    }

    if !to_send.sent {
        let msg = match Msg::from_envelope(&to_send.info.raw_tx) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(
                    id = %to_send.info.id,
                    error = e.to_string(),
                    "cannot re-hydrate message; dropping"
                );
                return delivery.term().await;
            }
        };

        match manager.broadcast(&msg, &mut to_send.info).await {
            Ok(res) => {
                tracing::debug!(id = %to_send.info.id, tx_hash = res.tx_hash, "re-broadcast");
                to_send.sent = true;
            }
            Err(e) if e.is_critical() => {
                tracing::error!(
                    id = %to_send.info.id,
                    error = e.to_string(),
                    "permanent broadcast failure; dropping"
                );
                return delivery.term().await;
            }
            Err(e) => {
                tracing::debug!(id = %to_send.info.id, error = e.to_string(), "broadcast failed");
                return delivery
                    .nack_with_delay(manager.config().send_nack_delay)
                    .await;
            }
        }
    }

    match manager.publish_observe(&to_send.info).await {
        Ok(()) => delivery.ack().await,
        Err(e) => {
            tracing::warn!(
                id = %to_send.info.id,
                error = e.to_string(),
                "cannot hand over to observe stream"
            );
            delivery
                .nack_with_delay(manager.config().send_nack_delay)
                .await
        }
    }
}

pub async fn run_observe_consumer<C, Q>(manager: TxManager<C, Q>, token: CancellationToken)
where
    C: ChainClient,
    Q: DurableQueue,
{
    let mut sub = match manager
        .queue_handle()
        .subscribe(OBSERVE_STREAM, OBSERVE_CONSUMER)
        .await
    {
        Ok(sub) => sub,
        Err(e) => {
            tracing::error!(error = e.to_string(), "cannot subscribe to observe stream");
            return;
        }
    };

    loop {
        let delivery = tokio::select! {
            _ = token.cancelled() => break,
            d = sub.next() => match d {
                Some(d) => d,
                None => break,
            },
        };
        if let Err(e) = handle_observe(&manager, delivery).await {
            tracing::warn!(error = e.to_string(), "failed to settle observe delivery");
        }
    }
    tracing::debug!("observe consumer stopped");
}

async fn handle_observe<C, Q, D>(manager: &TxManager<C, Q>, delivery: D) -> QueueResult<()>
where
    C: ChainClient,
    Q: DurableQueue,
    D: Delivery,
{
    manager.tracker().update(manager.client()).await;

    let info: TxRecord = match serde_json::from_slice(delivery.payload()) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = e.to_string(), "malformed observe record; dropping");
            return delivery.term().await;
        }
    };

    let Some(tx_hash) = info.tx_hash.clone() else {
        // Never broadcast; send it around again.
        return requeue(manager, info, delivery).await;
    };

    match manager.client().tx(&tx_hash).await {
        Ok(result) => {
            if result.is_ok() {
                tracing::debug!(id = %info.id, tx_hash, height = result.height, "tx included");
            } else {
                tracing::warn!(
                    id = %info.id,
                    tx_hash,
                    code = result.code,
                    codespace = result.codespace,
                    log = result.log,
                    "tx rejected on-chain"
                );
            }
            delivery.ack().await
        }
        Err(ChainRpcError::TxNotFound(_)) => {
            if manager.tracker().latest_block_time_nanos() > info.timeout_nanos() {
                // The inclusion window has passed; this broadcast is dead.
                requeue(manager, info, delivery).await
            } else {
                delivery
                    .nack_with_delay(manager.config().observe_nack_delay)
                    .await
            }
        }
        Err(e) => {
            tracing::debug!(id = %info.id, error = e.to_string(), "tx lookup failed");
            delivery
                .nack_with_delay(manager.config().observe_nack_delay)
                .await
        }
    }
}

/// Send a record back for a fresh broadcast, counting the attempt.
async fn requeue<C, Q, D>(manager: &TxManager<C, Q>, mut info: TxRecord, delivery: D) -> QueueResult<()>
where
    C: ChainClient,
    Q: DurableQueue,
    D: Delivery,
{
    info.attempts += 1;
    if info.attempts >= manager.config().max_attempts {
        tracing::warn!(
            id = %info.id,
            attempts = info.attempts,
            "giving up on transaction after max attempts"
        );
        return delivery.ack().await;
    }

    info.tx_hash = None;
    info.timeout = None;

    match manager.enqueue_send(&TxToSend::unsent(info)).await {
        Ok(()) => delivery.ack().await,
        Err(e) => {
            tracing::warn!(error = e.to_string(), "cannot re-queue for send");
            delivery
                .nack_with_delay(manager.config().observe_nack_delay)
                .await
        }
    }
}
