// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Full-stack runs of the inference protocol: a real HTTP server in front
//! of a scripted chain, an in-memory queue and a fake ML worker, with this
//! node acting as both transfer agent and executor (the self-loop path).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::post;
use axum::{Json, Router};
use prost::Message as _;

use inferd_api::headers;
use inferd_api::state::{ApiState, NodeIdentity};
use inferd_api::worker::{WorkerConfig, WorkerPool};
use inferd_chain_message::agent;
use inferd_chain_message::msgs::{Msg, START_INFERENCE_TYPE_URL};
use inferd_chain_message::tx::{derive_address, MsgExec, TxBody, TxRaw, MSG_EXEC_TYPE_URL};
use inferd_chain_rpc::testing::MockChainClient;
use inferd_chain_rpc::Participant;
use inferd_crypto::SecretKey;
use inferd_queue::mem::MemoryQueue;
use inferd_txmgr::{TxManager, TxManagerConfig};

const PREFIX: &str = "infer";
const CHAIN_ID: &str = "inferchain-1";
const MODEL: &str = "llama-3";

/// Chain clock the mock starts at, nanoseconds.
const CHAIN_TIME: i64 = 1_700_000_000_000_000_000;

struct Stack {
    client: MockChainClient,
    state: Arc<ApiState<MockChainClient, MemoryQueue>>,
    api_url: String,
    dev: SecretKey,
    dev_address: String,
    node_address: String,
    http: reqwest::Client,
}

/// A worker that answers with a unary JSON completion.
fn unary_worker_router() -> Router {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(|| async {
                Json(serde_json::json!({
                    "model": MODEL,
                    "choices": [{"message": {"role": "assistant", "content": "hi"}}],
                    "usage": {"prompt_tokens": 12, "completion_tokens": 3}
                }))
            }),
        )
        .route(
            "/tokenize",
            post(|| async { Json(serde_json::json!({"count": 42})) }),
        )
}

const STREAM_BODY: &str = "data: {\"model\":\"llama-3\",\"choices\":[{\"delta\":{\"content\":\"h\"}}]}\n\n\
     data: {\"choices\":[],\"usage\":{\"prompt_tokens\":0,\"completion_tokens\":7}}\n\n\
     data: [DONE]\n\n";

/// A worker that streams SSE chunks and leaves prompt tokens at zero, which
/// forces the tokenize fallback.
fn streaming_worker_router() -> Router {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(|| async { ([("content-type", "text/event-stream")], STREAM_BODY) }),
        )
        .route(
            "/tokenize",
            post(|| async { Json(serde_json::json!({"count": 42})) }),
        )
}

fn serve(router: Router) -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let server = axum::Server::from_tcp(listener)
        .unwrap()
        .serve(router.into_make_service());
    tokio::spawn(server);
    addr
}

async fn stack(worker: Router) -> Stack {
    let worker_addr = serve(worker);

    // Reserve the API port up front: the node's public URL must be known
    // before the router exists for the self-loop detection to trigger.
    let api_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    api_listener.set_nonblocking(true).unwrap();
    let api_addr = api_listener.local_addr().unwrap();
    let api_url = format!("http://{api_addr}");

    let node = SecretKey::random(&mut rand::thread_rng());
    let node_address = derive_address(&node.public_key(), PREFIX).unwrap().to_string();
    let dev = SecretKey::random(&mut rand::thread_rng());
    let dev_address = "infer1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5lzv7xu".to_string();

    let client = MockChainClient::new();
    client.set_status(100, CHAIN_TIME);
    {
        let mut chain = client.state();
        chain.account_numbers.insert(node_address.clone(), 3);
        chain.participants.insert(
            dev_address.clone(),
            Participant {
                address: dev_address.clone(),
                inference_url: String::new(),
                models: vec![],
                balance: 1_000_000_000,
                public_key: inferd_crypto::to_b64(&inferd_crypto::serialize_public_key(
                    &dev.public_key(),
                )),
            },
        );
        // This node is also a participant: the executor hop verifies the
        // transfer signature against its on-chain key.
        chain.participants.insert(
            node_address.clone(),
            Participant {
                address: node_address.clone(),
                inference_url: api_url.clone(),
                models: vec![MODEL.to_string()],
                balance: 0,
                public_key: inferd_crypto::to_b64(&inferd_crypto::serialize_public_key(
                    &node.public_key(),
                )),
            },
        );
        chain.executors.push(Participant {
            address: node_address.clone(),
            inference_url: api_url.clone(),
            models: vec![MODEL.to_string()],
            balance: 0,
            public_key: inferd_crypto::to_b64(&inferd_crypto::serialize_public_key(
                &node.public_key(),
            )),
        });
    }

    let queue = MemoryQueue::new();
    let signer = inferd_chain_message::tx::TxSigner::new(
        node.clone(),
        PREFIX,
        CHAIN_ID.to_string(),
    )
    .unwrap();
    let manager = TxManager::new(
        client.clone(),
        queue.clone(),
        signer,
        TxManagerConfig {
            status_refresh_interval: Duration::ZERO,
            ..TxManagerConfig::default()
        },
    );

    let workers = WorkerPool::new(
        vec![WorkerConfig {
            url: format!("http://{worker_addr}"),
            models: vec![MODEL.to_string()],
            concurrency: 2,
        }],
        reqwest::Client::new(),
    );

    let state = Arc::new(ApiState::new(
        manager,
        client.clone(),
        NodeIdentity {
            secret: node,
            address: node_address.clone(),
            public_url: api_url.clone(),
            fee_denom: "ncoin".to_string(),
        },
        workers,
    ));

    let router = inferd_api::make_router(state.clone());
    let server = axum::Server::from_tcp(api_listener)
        .unwrap()
        .serve(router.into_make_service());
    tokio::spawn(server);

    Stack {
        client,
        state,
        api_url,
        dev,
        dev_address,
        node_address,
        http: reqwest::Client::new(),
    }
}

fn chat_body() -> Vec<u8> {
    serde_json::json!({
        "model": MODEL,
        "messages": [{"role": "user", "content": "Say hi to the network please."}],
        "max_tokens": 100
    })
    .to_string()
    .into_bytes()
}

impl Stack {
    /// Sign and send a developer (transfer-hop) request.
    async fn send_transfer(&self, body: &[u8], timestamp: i64) -> reqwest::Response {
        let digest = agent::transfer_digest(body, timestamp, &self.node_address);
        let auth_key = agent::sign(&self.dev, &digest).unwrap();
        self.send_transfer_with_key(body, timestamp, &auth_key).await
    }

    async fn send_transfer_with_key(
        &self,
        body: &[u8],
        timestamp: i64,
        auth_key: &str,
    ) -> reqwest::Response {
        self.http
            .post(format!("{}/v1/chat/completions", self.api_url))
            .header(headers::AUTHORIZATION, auth_key)
            .header(headers::TIMESTAMP, timestamp.to_string())
            .header(headers::REQUESTER_ADDRESS, &self.dev_address)
            .body(body.to_vec())
            .send()
            .await
            .unwrap()
    }

    /// Wait for the background finish submission to reach the chain.
    async fn wait_for_broadcasts(&self, count: usize) {
        for _ in 0..200 {
            if self.client.state().broadcasts.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "expected {count} broadcasts, got {}",
            self.client.state().broadcasts.len()
        );
    }

    /// Decode the n-th broadcast back into the domain message it carried.
    fn broadcast_msg(&self, n: usize) -> Msg {
        let raw = self.client.state().broadcasts[n].clone();
        let tx = TxRaw::decode(raw.as_slice()).unwrap();
        let body = TxBody::decode(tx.body_bytes.as_slice()).unwrap();
        // The node signs on the developer's behalf, so every message rides
        // in an authz exec envelope.
        assert_eq!(body.messages[0].type_url, MSG_EXEC_TYPE_URL);
        let exec = MsgExec::decode(body.messages[0].value.as_slice()).unwrap();
        Msg::from_raw(&exec.msgs[0].type_url, &exec.msgs[0].value).unwrap()
    }
}

#[tokio::test]
async fn successful_inference_submits_start_and_finish() {
    let s = stack(unary_worker_router()).await;
    let body = chat_body();

    let response = s.send_transfer(&body, CHAIN_TIME).await;
    assert_eq!(response.status(), 200);
    let completion: serde_json::Value = response.json().await.unwrap();
    assert_eq!(completion["usage"]["completion_tokens"], 3);

    s.wait_for_broadcasts(2).await;

    let digest = agent::transfer_digest(&body, CHAIN_TIME, &s.node_address);
    let auth_key = agent::sign(&s.dev, &digest).unwrap();

    let Msg::StartInference(start) = s.broadcast_msg(0) else {
        panic!("first broadcast must be StartInference");
    };
    assert_eq!(start.inference_id, auth_key);
    assert_eq!(start.requested_by, s.dev_address);
    assert_eq!(start.assigned_to, s.node_address);
    assert_eq!(start.model, MODEL);
    assert_eq!(start.max_tokens, 100);

    let Msg::FinishInference(finish) = s.broadcast_msg(1) else {
        panic!("second broadcast must be FinishInference");
    };
    assert_eq!(finish.inference_id, auth_key);
    assert_eq!(finish.executed_by, s.node_address);
    assert_eq!(finish.transferred_by, s.node_address);
    assert_eq!(finish.prompt_token_count, 12);
    assert_eq!(finish.completion_token_count, 3);

    // The bandwidth booking is released once the response has completed.
    for _ in 0..100 {
        if s.state.bandwidth.tracked_blocks() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(s.state.bandwidth.tracked_blocks(), 0);
}

#[tokio::test]
async fn streaming_inference_uses_the_tokenize_fallback() {
    let s = stack(streaming_worker_router()).await;
    let body = chat_body();

    let response = s.send_transfer(&body, CHAIN_TIME).await;
    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();
    assert!(text.contains("data:"));
    assert!(text.contains("[DONE]"));

    s.wait_for_broadcasts(2).await;

    let Msg::FinishInference(finish) = s.broadcast_msg(1) else {
        panic!("second broadcast must be FinishInference");
    };
    // The stream said zero prompt tokens; the worker's /tokenize said 42.
    assert_eq!(finish.prompt_token_count, 42);
    assert_eq!(finish.completion_token_count, 7);
}

#[tokio::test]
async fn executor_replay_is_rejected_without_chain_traffic() {
    let s = stack(unary_worker_router()).await;
    let body = chat_body();

    let response = s.send_transfer(&body, CHAIN_TIME).await;
    assert_eq!(response.status(), 200);
    s.wait_for_broadcasts(2).await;

    // Replay the executor hop with the same auth key after the first
    // executor response has returned.
    let digest = agent::transfer_digest(&body, CHAIN_TIME, &s.node_address);
    let auth_key = agent::sign(&s.dev, &digest).unwrap();
    let ta_signature = agent::sign(
        &s.state.node.secret,
        &agent::executor_digest(&body, CHAIN_TIME, &s.node_address, &s.node_address),
    )
    .unwrap();

    let response = s
        .http
        .post(format!("{}/v1/chat/completions", s.api_url))
        .header(headers::AUTHORIZATION, &auth_key)
        .header(headers::TIMESTAMP, CHAIN_TIME.to_string())
        .header(headers::REQUESTER_ADDRESS, &s.dev_address)
        .header(headers::INFERENCE_ID, &auth_key)
        .header(headers::SEED, "7")
        .header(headers::TRANSFER_ADDRESS, &s.node_address)
        .header(headers::TA_SIGNATURE, &ta_signature)
        .body(body.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let error: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        error["error"],
        "AuthKey has already been used for an executor request"
    );

    // No further chain traffic.
    assert_eq!(s.client.state().broadcasts.len(), 2);
}

#[tokio::test]
async fn transfer_replay_is_rejected() {
    let s = stack(unary_worker_router()).await;
    let body = chat_body();

    assert_eq!(s.send_transfer(&body, CHAIN_TIME).await.status(), 200);
    s.wait_for_broadcasts(2).await;

    let response = s.send_transfer(&body, CHAIN_TIME).await;
    assert_eq!(response.status(), 400);
    let error: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        error["error"],
        "AuthKey has already been used for a transfer request"
    );
}

#[tokio::test]
async fn bad_signature_is_unauthorized() {
    let s = stack(unary_worker_router()).await;
    let body = chat_body();

    let stranger = SecretKey::random(&mut rand::thread_rng());
    let digest = agent::transfer_digest(&body, CHAIN_TIME, &s.node_address);
    let forged = agent::sign(&stranger, &digest).unwrap();

    let response = s.send_transfer_with_key(&body, CHAIN_TIME, &forged).await;
    assert_eq!(response.status(), 401);
    assert!(s.client.state().broadcasts.is_empty());
}

#[tokio::test]
async fn expired_timestamp_is_unauthorized() {
    let s = stack(unary_worker_router()).await;
    let body = chat_body();

    // Default mock tolerance is 30 s into the past.
    let stale = CHAIN_TIME - 31_000_000_000;
    let response = s.send_transfer(&body, stale).await;
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn unknown_participant_is_not_found() {
    let s = stack(unary_worker_router()).await;
    s.client.state().participants.remove(&s.dev_address);

    let response = s.send_transfer(&chat_body(), CHAIN_TIME).await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn insufficient_balance_is_payment_required() {
    let s = stack(unary_worker_router()).await;
    if let Some(p) = s.client.state().participants.get_mut(&s.dev_address) {
        p.balance = 1;
    }

    let response = s.send_transfer(&chat_body(), CHAIN_TIME).await;
    assert_eq!(response.status(), 402);
}

#[tokio::test]
async fn bandwidth_rejection_is_rate_limited_with_hint() {
    let s = stack(unary_worker_router()).await;
    s.client
        .state()
        .params
        .bandwidth
        .estimated_limits_per_block_kb = 0.0;

    let response = s.send_transfer(&chat_body(), CHAIN_TIME).await;
    assert_eq!(response.status(), 429);
    let error: serde_json::Value = response.json().await.unwrap();
    assert!(error["hint"]["redirect"].is_string());
    assert!(s.client.state().broadcasts.is_empty());
}

#[tokio::test]
async fn grantee_signature_is_accepted() {
    let s = stack(unary_worker_router()).await;
    let body = chat_body();

    // The developer delegated start-inference signing to another key.
    let grantee = SecretKey::random(&mut rand::thread_rng());
    s.client.state().grantees.insert(
        (s.dev_address.clone(), START_INFERENCE_TYPE_URL.to_string()),
        vec![inferd_crypto::to_b64(&inferd_crypto::serialize_public_key(
            &grantee.public_key(),
        ))],
    );

    let digest = agent::transfer_digest(&body, CHAIN_TIME, &s.node_address);
    let auth_key = agent::sign(&grantee, &digest).unwrap();

    let response = s.send_transfer_with_key(&body, CHAIN_TIME, &auth_key).await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn new_participant_submission_broadcasts_once() {
    let s = stack(unary_worker_router()).await;

    let response = s
        .http
        .post(format!("{}/v1/participants", s.api_url))
        .json(&serde_json::json!({
            "address": s.node_address,
            "url": "http://node.example:8080",
            "models": [MODEL],
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["tx_hash"].is_string());
    assert_eq!(s.client.state().broadcasts.len(), 1);
}
