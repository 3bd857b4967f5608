// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Durable transaction manager.
//!
//! Accepts on-chain messages, signs them as unordered transactions, and
//! shepherds them to inclusion through two durable streams: `txs_to_send`
//! holds work that still needs a (re-)broadcast, `txs_to_observe` holds
//! broadcast transactions awaiting an on-chain sighting. The streams are the
//! only persistence; at-most-one-effect comes from unordered nonces plus the
//! timeout timestamp on the chain side and attempt counting on this side.

mod clock;
mod consumer;
mod error;
mod record;
mod tracker;

pub use clock::MonotonicClock;
pub use consumer::spawn_consumers;
pub use error::{check_broadcast, classify_rpc_error, is_critical_log, TxError};
pub use record::{TxRecord, TxToSend, OBSERVE_STREAM, SEND_STREAM};
pub use tracker::{BlockTimeTracker, DEFAULT_MAX_BLOCK_TIMEOUT, REFRESH_INTERVAL};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tendermint::Time;
use tokio::sync::OnceCell;
use uuid::Uuid;

use inferd_chain_message::tx::TxSigner;
use inferd_chain_message::Msg;
use inferd_chain_rpc::{BroadcastResponse, ChainClient, ChainRpcError, ChainStatus, TxResult};
use inferd_queue::DurableQueue;

#[derive(Debug, Clone)]
pub struct TxManagerConfig {
    /// Inclusion window stamped on every transaction.
    pub tx_timeout: Duration,
    /// How long a sync submission waits for an on-chain sighting.
    pub sync_wait: Duration,
    pub sync_poll_interval: Duration,
    /// Redelivery delay after a transient failure on the send stream.
    pub send_nack_delay: Duration,
    /// Redelivery delay while a transaction is not found on-chain yet.
    pub observe_nack_delay: Duration,
    /// Redelivery delay while the chain is halted.
    pub halt_redeliver_delay: Duration,
    /// Broadcast-and-observe cycles before a record is dropped.
    pub max_attempts: u32,
    pub max_block_timeout: Duration,
    /// Minimum spacing between chain status refreshes.
    pub status_refresh_interval: Duration,
}

impl Default for TxManagerConfig {
    fn default() -> Self {
        Self {
            tx_timeout: Duration::from_secs(300),
            sync_wait: Duration::from_secs(15),
            sync_poll_interval: Duration::from_secs(1),
            send_nack_delay: Duration::from_secs(7),
            observe_nack_delay: Duration::from_secs(5),
            halt_redeliver_delay: Duration::from_secs(3),
            max_attempts: 100,
            max_block_timeout: tracker::DEFAULT_MAX_BLOCK_TIMEOUT,
            status_refresh_interval: tracker::REFRESH_INTERVAL,
        }
    }
}

/// What a caller gets back from a retry-class submission.
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub id: Uuid,
    /// The broadcast outcome, when a broadcast happened before the record
    /// was enqueued. `None` means the record went straight to the send
    /// stream (chain halted or transient failure).
    pub broadcast: Option<BroadcastResponse>,
}

struct Inner<C, Q> {
    client: C,
    queue: Q,
    signer: TxSigner,
    tracker: BlockTimeTracker,
    clock: MonotonicClock,
    account_number: OnceCell<u64>,
    config: TxManagerConfig,
}

/// Handle to the transaction manager; clones share state.
pub struct TxManager<C, Q> {
    inner: Arc<Inner<C, Q>>,
}

impl<C, Q> Clone for TxManager<C, Q> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C, Q> TxManager<C, Q>
where
    C: ChainClient,
    Q: DurableQueue,
{
    pub fn new(client: C, queue: Q, signer: TxSigner, config: TxManagerConfig) -> Self {
        let tracker = BlockTimeTracker::new(config.max_block_timeout, config.status_refresh_interval);
        Self {
            inner: Arc::new(Inner {
                client,
                queue,
                signer,
                tracker,
                clock: MonotonicClock::new(),
                account_number: OnceCell::new(),
                config,
            }),
        }
    }

    pub fn tracker(&self) -> &BlockTimeTracker {
        &self.inner.tracker
    }

    pub fn config(&self) -> &TxManagerConfig {
        &self.inner.config
    }

    fn client(&self) -> &C {
        &self.inner.client
    }

    fn queue_handle(&self) -> &Q {
        &self.inner.queue
    }

    /// Fire-and-forget with durable retry.
    ///
    /// Returns an error only for critical failures; any transient problem
    /// (including a halted chain) parks the record on the send stream and
    /// reports success.
    pub async fn submit_with_retry(&self, msg: Msg) -> Result<SubmitReceipt, TxError> {
        let mut info = TxRecord::new(msg.to_envelope());
        let id = info.id;

        self.inner.tracker.update(self.client()).await;
        if self.inner.tracker.chain_halted() {
            tracing::info!(%id, type_url = msg.type_url(), "chain halted; queueing for later");
            self.enqueue_send(&TxToSend::unsent(info)).await?;
            return Ok(SubmitReceipt {
                id,
                broadcast: None,
            });
        }

        match self.broadcast(&msg, &mut info).await {
            Ok(res) => {
                self.enqueue_send(&TxToSend::sent(info)).await?;
                Ok(SubmitReceipt {
                    id,
                    broadcast: Some(res),
                })
            }
            Err(e) if e.is_critical() => Err(e),
            Err(e) => {
                tracing::debug!(%id, error = e.to_string(), "broadcast failed; queueing for retry");
                self.enqueue_send(&TxToSend::unsent(info)).await?;
                Ok(SubmitReceipt {
                    id,
                    broadcast: None,
                })
            }
        }
    }

    /// Single broadcast; every failure surfaces.
    pub async fn submit_no_retry(&self, msg: Msg) -> Result<BroadcastResponse, TxError> {
        self.inner.tracker.update(self.client()).await;
        if self.inner.tracker.chain_halted() {
            return Err(TxError::ChainHalted);
        }
        let mut info = TxRecord::new(msg.to_envelope());
        self.broadcast(&msg, &mut info).await
    }

    /// Broadcast and wait (bounded) for the transaction to appear on-chain.
    ///
    /// A timeout does not roll the broadcast back: the transaction may still
    /// be included until its timeout timestamp passes.
    pub async fn submit_sync(&self, msg: Msg) -> Result<TxResult, TxError> {
        let res = self.submit_no_retry(msg).await?;
        let wait = self.inner.config.sync_wait;
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            match self.client().tx(&res.tx_hash).await {
                Ok(result) => return Ok(result),
                Err(ChainRpcError::TxNotFound(_)) => {}
                Err(e) => {
                    tracing::debug!(error = e.to_string(), "tx lookup failed; will retry")
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TxError::ConfirmationTimeout {
                    tx_hash: res.tx_hash,
                    wait,
                });
            }
            tokio::time::sleep(self.inner.config.sync_poll_interval).await;
        }
    }

    pub async fn bank_balance(&self, address: &str, denom: &str) -> Result<u64, ChainRpcError> {
        self.client().bank_balance(address, denom).await
    }

    pub async fn status(&self) -> Result<ChainStatus, ChainRpcError> {
        self.client().status().await
    }

    /// Sign and broadcast one message, recording hash and timeout on the
    /// record when the mempool accepts it.
    async fn broadcast(&self, msg: &Msg, info: &mut TxRecord) -> Result<BroadcastResponse, TxError> {
        let account_number = *self
            .inner
            .account_number
            .get_or_try_init(|| async {
                self.client()
                    .account_number(&self.inner.signer.address().to_string())
                    .await
            })
            .await
            .map_err(classify_rpc_error)?;

        let now = self.inner.clock.unique_now_nanos();
        let timeout_ns = now.max(self.inner.tracker.latest_block_time_nanos())
            + self.inner.config.tx_timeout.as_nanos() as i64;

        let raw = self
            .inner
            .signer
            .sign_unordered(msg, account_number, timeout_ns)
            .map_err(|e| TxError::Encode(e.to_string()))?;

        let res = self
            .client()
            .broadcast_tx_sync(raw)
            .await
            .map_err(classify_rpc_error)?;
        let res = check_broadcast(res)?;

        info.tx_hash = Some(res.tx_hash.clone());
        info.timeout = Some(
            Time::from_unix_timestamp(
                timeout_ns.div_euclid(1_000_000_000),
                timeout_ns.rem_euclid(1_000_000_000) as u32,
            )
            .map_err(|e| TxError::Encode(format!("timeout out of range: {e}")))?,
        );
        Ok(res)
    }

    async fn enqueue_send(&self, to_send: &TxToSend) -> Result<(), TxError> {
        let payload = serde_json::to_vec(to_send).map_err(|e| TxError::Encode(e.to_string()))?;
        self.inner
            .queue
            .publish(SEND_STREAM, Bytes::from(payload))
            .await?;
        Ok(())
    }

    async fn publish_observe(&self, info: &TxRecord) -> Result<(), TxError> {
        let payload = serde_json::to_vec(info).map_err(|e| TxError::Encode(e.to_string()))?;
        self.inner
            .queue
            .publish(OBSERVE_STREAM, Bytes::from(payload))
            .await?;
        Ok(())
    }
}
