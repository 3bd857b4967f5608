// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! End-to-end runs of the transaction manager against a scripted chain and
//! an in-memory queue: submission, observation, retry, restart and halt.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use inferd_chain_message::msgs::{Msg, MsgClaimRewards};
use inferd_chain_message::tx::TxSigner;
use inferd_chain_rpc::testing::MockChainClient;
use inferd_chain_rpc::BroadcastResponse;
use inferd_crypto::SecretKey;
use inferd_queue::mem::MemoryQueue;
use inferd_queue::DurableQueue;
use inferd_txmgr::{
    spawn_consumers, TxError, TxManager, TxManagerConfig, TxToSend, OBSERVE_STREAM, SEND_STREAM,
};

const PREFIX: &str = "infer";
const CHAIN_ID: &str = "inferchain-1";

struct Harness {
    client: MockChainClient,
    queue: MemoryQueue,
    manager: TxManager<MockChainClient, MemoryQueue>,
}

fn harness(config: TxManagerConfig) -> Harness {
    let client = MockChainClient::new();
    let queue = MemoryQueue::new();

    let signer = TxSigner::new(
        SecretKey::random(&mut rand::thread_rng()),
        PREFIX,
        CHAIN_ID.to_string(),
    )
    .unwrap();

    let address = signer.address().to_string();
    client.state().account_numbers.insert(address, 7);
    client.set_status(1, 1_000);

    let manager = TxManager::new(client.clone(), queue.clone(), signer, config);
    Harness {
        client,
        queue,
        manager,
    }
}

fn test_config() -> TxManagerConfig {
    TxManagerConfig {
        // No refresh rate limit so every iteration sees the mock's head.
        status_refresh_interval: Duration::ZERO,
        ..TxManagerConfig::default()
    }
}

fn claim_msg() -> Msg {
    Msg::from(MsgClaimRewards {
        creator: "infer1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5lzv7xu".to_string(),
        seed: 1,
        epoch_index: 1,
    })
}

/// Synthetic hash the mock assigns to the n-th broadcast.
fn nth_hash(n: usize) -> String {
    format!("{n:064X}")
}

fn included(height: u64) -> inferd_chain_rpc::TxResult {
    inferd_chain_rpc::TxResult {
        height,
        code: 0,
        codespace: String::new(),
        log: String::new(),
        data: Vec::new(),
    }
}

/// Wait until both streams have nothing ready and nothing in flight.
async fn drain(queue: &MemoryQueue) {
    for _ in 0..2_000 {
        let busy = queue.ready_len(SEND_STREAM).await
            + queue.pending_len(SEND_STREAM).await
            + queue.ready_len(OBSERVE_STREAM).await
            + queue.pending_len(OBSERVE_STREAM).await;
        if busy == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("streams did not drain");
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as i64
}

#[tokio::test(start_paused = true)]
async fn successful_submission_is_observed_and_acked() {
    let h = harness(test_config());

    let receipt = h.manager.submit_with_retry(claim_msg()).await.unwrap();
    let broadcast = receipt.broadcast.expect("chain was live, must broadcast");
    assert_eq!(broadcast.tx_hash, nth_hash(1));
    assert_eq!(h.queue.ready_len(SEND_STREAM).await, 1);

    h.client.include_tx(&nth_hash(1), included(2));

    let token = CancellationToken::new();
    let handles = spawn_consumers(h.manager.clone(), token.clone());

    drain(&h.queue).await;
    assert_eq!(h.client.state().broadcasts.len(), 1);

    token.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn observation_resumes_after_restart() {
    let h = harness(test_config());

    // First life: broadcast succeeded, then the process died before the
    // consumers ran. The send stream still holds the sent record.
    h.manager.submit_with_retry(claim_msg()).await.unwrap();
    drop(h.manager);
    assert_eq!(h.queue.ready_len(SEND_STREAM).await, 1);

    // Second life: same queue, fresh manager. The record must flow to the
    // observe stream and ack without a second broadcast.
    let signer = TxSigner::new(
        SecretKey::random(&mut rand::thread_rng()),
        PREFIX,
        CHAIN_ID.to_string(),
    )
    .unwrap();
    h.client
        .state()
        .account_numbers
        .insert(signer.address().to_string(), 8);
    let manager = TxManager::new(h.client.clone(), h.queue.clone(), signer, test_config());

    h.client.include_tx(&nth_hash(1), included(2));

    let token = CancellationToken::new();
    let handles = spawn_consumers(manager, token.clone());

    drain(&h.queue).await;
    assert_eq!(h.client.state().broadcasts.len(), 1);

    token.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn halted_chain_queues_submission_until_blocks_resume() {
    let config = TxManagerConfig {
        max_block_timeout: Duration::ZERO,
        ..test_config()
    };
    let h = harness(config);

    // Two sightings of the same head flag the halt.
    h.manager.tracker().update(&h.client).await;
    h.manager.tracker().update(&h.client).await;
    assert!(h.manager.tracker().chain_halted());

    let receipt = h.manager.submit_with_retry(claim_msg()).await.unwrap();
    assert!(receipt.broadcast.is_none());
    assert!(h.client.state().broadcasts.is_empty());
    assert_eq!(h.queue.ready_len(SEND_STREAM).await, 1);

    // Blocks start again; the send consumer picks the record up.
    h.client.set_status(2, 2_000);
    h.client.include_tx(&nth_hash(1), included(3));

    let token = CancellationToken::new();
    let handles = spawn_consumers(h.manager.clone(), token.clone());

    drain(&h.queue).await;
    assert_eq!(h.client.state().broadcasts.len(), 1);

    token.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn critical_broadcast_failure_surfaces_and_is_not_queued() {
    let h = harness(test_config());
    h.client
        .state()
        .broadcast_script
        .push_back(Ok(BroadcastResponse {
            tx_hash: String::new(),
            code: 2,
            raw_log: "tx too large".to_string(),
        }));

    let err = h
        .manager
        .submit_with_retry(claim_msg())
        .await
        .unwrap_err();
    assert!(matches!(err, TxError::Critical(_)));
    assert_eq!(h.queue.ready_len(SEND_STREAM).await, 0);
}

#[tokio::test(start_paused = true)]
async fn transient_broadcast_failure_is_retried_until_included() {
    let h = harness(test_config());
    h.client
        .state()
        .broadcast_script
        .push_back(Ok(BroadcastResponse {
            tx_hash: String::new(),
            code: 20,
            raw_log: "mempool is full".to_string(),
        }));

    let receipt = h.manager.submit_with_retry(claim_msg()).await.unwrap();
    assert!(receipt.broadcast.is_none());

    // The retry broadcast will be the second call and succeed.
    h.client.include_tx(&nth_hash(2), included(3));

    let token = CancellationToken::new();
    let handles = spawn_consumers(h.manager.clone(), token.clone());

    drain(&h.queue).await;
    assert_eq!(h.client.state().broadcasts.len(), 2);

    token.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn expired_observation_requeues_and_rebroadcasts() {
    let config = TxManagerConfig {
        // Zero inclusion window: the first broadcast expires as soon as the
        // chain clock passes its stamping time.
        tx_timeout: Duration::ZERO,
        ..test_config()
    };
    let h = harness(config);

    let receipt = h.manager.submit_with_retry(claim_msg()).await.unwrap();
    assert!(receipt.broadcast.is_some());

    // The chain head moves past the first broadcast's timeout without
    // including it; only the re-broadcast lands.
    h.client.set_status(2, now_nanos() + 60_000_000_000);
    h.client.include_tx(&nth_hash(2), included(3));

    let token = CancellationToken::new();
    let handles = spawn_consumers(h.manager.clone(), token.clone());

    drain(&h.queue).await;
    assert_eq!(h.client.state().broadcasts.len(), 2);

    token.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn max_attempts_drops_the_record() {
    let h = harness(test_config());

    let msg = claim_msg();
    let mut to_send = TxToSend::unsent(inferd_txmgr::TxRecord::new(msg.to_envelope()));
    to_send.attempts = 100;
    to_send.info.attempts = 100;

    h.queue
        .publish(
            SEND_STREAM,
            serde_json::to_vec(&to_send).unwrap().into(),
        )
        .await
        .unwrap();

    let token = CancellationToken::new();
    let handles = spawn_consumers(h.manager.clone(), token.clone());

    drain(&h.queue).await;
    // Dropped without ever touching the chain.
    assert!(h.client.state().broadcasts.is_empty());

    token.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn malformed_records_are_terminated() {
    let h = harness(test_config());

    h.queue
        .publish(SEND_STREAM, bytes::Bytes::from_static(b"not json"))
        .await
        .unwrap();
    h.queue
        .publish(OBSERVE_STREAM, bytes::Bytes::from_static(b"{\"nope\":1}"))
        .await
        .unwrap();

    let token = CancellationToken::new();
    let handles = spawn_consumers(h.manager.clone(), token.clone());

    drain(&h.queue).await;
    assert!(h.client.state().broadcasts.is_empty());

    token.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn sync_submission_returns_the_onchain_result() {
    let h = harness(test_config());
    h.client.include_tx(&nth_hash(1), included(9));

    let result = h.manager.submit_sync(claim_msg()).await.unwrap();
    assert_eq!(result.height, 9);
    assert!(result.is_ok());
}

#[tokio::test(start_paused = true)]
async fn sync_submission_times_out_with_unknown_outcome() {
    let h = harness(test_config());

    let err = h.manager.submit_sync(claim_msg()).await.unwrap_err();
    match err {
        TxError::ConfirmationTimeout { tx_hash, .. } => assert_eq!(tx_hash, nth_hash(1)),
        other => panic!("expected confirmation timeout, got {other}"),
    }
    // The broadcast is not rolled back.
    assert_eq!(h.client.state().broadcasts.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn no_retry_submission_fails_while_halted() {
    let config = TxManagerConfig {
        max_block_timeout: Duration::ZERO,
        ..test_config()
    };
    let h = harness(config);

    h.manager.tracker().update(&h.client).await;
    h.manager.tracker().update(&h.client).await;

    let err = h
        .manager
        .submit_no_retry(claim_msg())
        .await
        .unwrap_err();
    assert!(matches!(err, TxError::ChainHalted));
    assert!(h.client.state().broadcasts.is_empty());
}
