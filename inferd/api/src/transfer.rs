// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! First hop: validate the developer's request, escrow-check, pick an
//! executor, anchor the inference on-chain, and proxy the body onward.

use std::sync::Arc;

use axum::body::StreamBody;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use inferd_chain_message::agent;
use inferd_chain_message::msgs::MsgStartInference;
use inferd_chain_rpc::{ChainClient, Participant};
use inferd_queue::DurableQueue;

use crate::authkey::{retention_blocks, AuthContext};
use crate::bandwidth::BandwidthGuard;
use crate::error::ApiError;
use crate::executor;
use crate::headers::{self, validate_timestamp, InferenceHeaders};
use crate::openai::ChatRequest;
use crate::state::{ApiState, LEGACY_PRICE_PER_TOKEN};

pub async fn handle<C, Q>(
    state: Arc<ApiState<C, Q>>,
    hdrs: InferenceHeaders,
    body: Bytes,
) -> Result<Response, ApiError>
where
    C: ChainClient + Clone + 'static,
    Q: DurableQueue,
{
    let request = ChatRequest::parse(&body).map_err(ApiError::bad_request)?;

    let requester = state.participant(&hdrs.requester_address).await?;
    let dev_keys = state.granted_keys(&requester).await?;

    // The developer signed the body addressed to this transfer agent.
    let digest = agent::transfer_digest(&body, hdrs.timestamp, &state.node.address);
    agent::verify_any(&dev_keys, &digest, &hdrs.auth_key)
        .map_err(|e| ApiError::unauthorized(format!("invalid request signature: {e}")))?;

    let head = state.chain_head().await?;
    let params = state.chain_params().await?;
    validate_timestamp(
        hdrs.timestamp,
        head.latest_block_time,
        params.validation.timestamp_expiration_secs,
        params.validation.timestamp_advance_secs,
    )?;

    let prompt_tokens = request.prompt_tokens_estimate();
    let max_tokens = request.max_tokens_or_default();

    let price_per_token = state
        .client
        .model_price(&request.model)
        .await?
        .unwrap_or(LEGACY_PRICE_PER_TOKEN);
    let escrow = prompt_tokens
        .saturating_add(max_tokens)
        .saturating_mul(price_per_token);
    if requester.balance < escrow {
        return Err(ApiError::payment_required(format!(
            "balance {} cannot cover escrow {escrow}",
            requester.balance
        )));
    }

    state
        .auth_keys
        .record(
            &hdrs.auth_key,
            AuthContext::Transfer,
            head.latest_block_height,
            retention_blocks(params.validation.timestamp_expiration_secs),
        )
        .map_err(ApiError::bad_request)?;

    let lifespan = params.validation.expiration_blocks;
    let (accepted, estimated_kb) = state.bandwidth.can_accept(
        head.latest_block_height,
        prompt_tokens,
        max_tokens,
        &params.bandwidth,
        lifespan,
    );
    if !accepted {
        return Err(ApiError::too_many_requests(
            "bandwidth budget exhausted",
            json!({
                "redirect": "retry through another transfer agent",
                "estimated_kb": estimated_kb,
            }),
        ));
    }
    let guard = BandwidthGuard::book(
        state.bandwidth.clone(),
        head.latest_block_height + lifespan,
        estimated_kb,
    );

    let executor = state
        .client
        .random_executor(&request.model)
        .await?
        .ok_or_else(|| {
            ApiError::unavailable(format!("no executor available for model '{}'", request.model))
        })?;

    let seed: i32 = rand::random();
    let transfer_signature = agent::sign(
        &state.node.secret,
        &agent::executor_digest(&body, hdrs.timestamp, &state.node.address, &executor.address),
    )
    .map_err(|e| ApiError::internal(format!("cannot sign transfer tuple: {e}")))?;

    let start = MsgStartInference {
        creator: hdrs.requester_address.clone(),
        inference_id: hdrs.auth_key.clone(),
        prompt_hash: inferd_crypto::to_b64(&inferd_crypto::sha256(&body)),
        prompt_payload: String::from_utf8_lossy(&body).into_owned(),
        requested_by: hdrs.requester_address.clone(),
        assigned_to: executor.address.clone(),
        model: request.model.clone(),
        max_tokens,
        prompt_token_count: prompt_tokens,
        request_timestamp: hdrs.timestamp,
        original_prompt: request.prompt_text(),
        transfer_signature: transfer_signature.clone(),
    };
    state
        .manager
        .submit_with_retry(start.into())
        .await
        .map_err(|e| ApiError::internal(format!("cannot submit start inference: {e}")))?;

    let onward = InferenceHeaders {
        auth_key: hdrs.auth_key.clone(),
        timestamp: hdrs.timestamp,
        requester_address: hdrs.requester_address.clone(),
        seed: Some(seed),
        inference_id: Some(hdrs.auth_key.clone()),
        transfer_address: Some(state.node.address.clone()),
        ta_signature: Some(transfer_signature),
    };

    if is_self(&executor, &state.node.public_url) {
        // This node is the executor: skip the HTTP hop, keep the protocol.
        let response = executor::handle(state.clone(), onward, body).await?;
        drop(guard);
        return Ok(response);
    }

    forward(state, &executor, onward, body, guard).await
}

fn is_self(executor: &Participant, public_url: &str) -> bool {
    executor.inference_url.trim_end_matches('/') == public_url.trim_end_matches('/')
}

/// Proxy the original body to the chosen executor, streaming its response
/// straight back. The bandwidth booking is released when the passthrough
/// finishes, success or not.
async fn forward<C, Q>(
    state: Arc<ApiState<C, Q>>,
    executor: &Participant,
    hdrs: InferenceHeaders,
    body: Bytes,
    guard: BandwidthGuard,
) -> Result<Response, ApiError>
where
    C: ChainClient,
    Q: DurableQueue,
{
    let url = format!(
        "{}/v1/chat/completions",
        executor.inference_url.trim_end_matches('/')
    );

    let mut request = state
        .http
        .post(&url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(headers::AUTHORIZATION, &hdrs.auth_key)
        .header(headers::TIMESTAMP, hdrs.timestamp.to_string())
        .header(headers::REQUESTER_ADDRESS, &hdrs.requester_address)
        .body(body);
    if let Some(seed) = hdrs.seed {
        request = request.header(headers::SEED, seed.to_string());
    }
    if let Some(id) = &hdrs.inference_id {
        request = request.header(headers::INFERENCE_ID, id);
    }
    if let Some(addr) = &hdrs.transfer_address {
        request = request.header(headers::TRANSFER_ADDRESS, addr);
    }
    if let Some(sig) = &hdrs.ta_signature {
        request = request.header(headers::TA_SIGNATURE, sig);
    }

    let upstream = request
        .send()
        .await
        .map_err(|e| ApiError::bad_gateway(format!("executor unreachable: {e}")))?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    tokio::spawn(async move {
        let mut stream = upstream.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() || failed {
                break;
            }
        }
        drop(guard);
    });

    let mut response =
        (status, StreamBody::new(ReceiverStream::new(rx))).into_response();
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        content_type
            .parse()
            .unwrap_or_else(|_| axum::http::HeaderValue::from_static("application/json")),
    );
    Ok(response)
}
