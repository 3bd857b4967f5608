// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Second hop: verify both signatures in the chain, run the inference on a
//! locked local worker under the deterministic seed, stream the response
//! back, and settle `FinishInference` on-chain once the stream ends.

use std::sync::Arc;

use axum::body::StreamBody;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use inferd_chain_message::agent;
use inferd_chain_message::msgs::MsgFinishInference;
use inferd_chain_rpc::ChainClient;
use inferd_queue::DurableQueue;

use crate::authkey::{retention_blocks, AuthContext};
use crate::error::ApiError;
use crate::headers::{validate_timestamp, InferenceHeaders};
use crate::openai::{self, ChatRequest};
use crate::state::ApiState;
use crate::worker::WorkerLease;

pub async fn handle<C, Q>(
    state: Arc<ApiState<C, Q>>,
    hdrs: InferenceHeaders,
    body: Bytes,
) -> Result<Response, ApiError>
where
    C: ChainClient + Clone + 'static,
    Q: DurableQueue,
{
    let seed = hdrs
        .seed
        .ok_or_else(|| ApiError::bad_request("missing X-Seed"))?;
    let inference_id = hdrs
        .inference_id
        .clone()
        .ok_or_else(|| ApiError::bad_request("missing X-Inference-Id"))?;
    let transfer_address = hdrs
        .transfer_address
        .clone()
        .ok_or_else(|| ApiError::bad_request("missing X-Transfer-Address"))?;
    let ta_signature = hdrs
        .ta_signature
        .clone()
        .ok_or_else(|| ApiError::bad_request("missing X-TA-Signature"))?;

    let request = ChatRequest::parse(&body).map_err(ApiError::bad_request)?;

    // The transfer agent already checked the developer's signature; an
    // executor re-checks it in self-defense before doing any work.
    let requester = state.participant(&hdrs.requester_address).await?;
    let dev_keys = state.granted_keys(&requester).await?;
    let dev_digest = agent::transfer_digest(&body, hdrs.timestamp, &transfer_address);
    agent::verify_any(&dev_keys, &dev_digest, &hdrs.auth_key)
        .map_err(|e| ApiError::unauthorized(format!("invalid request signature: {e}")))?;

    // And the transfer agent's own signature assigning this executor.
    let transfer_participant = state.participant(&transfer_address).await?;
    let ta_keys = state.granted_keys(&transfer_participant).await?;
    let ta_digest = agent::executor_digest(
        &body,
        hdrs.timestamp,
        &transfer_address,
        &state.node.address,
    );
    agent::verify_any(&ta_keys, &ta_digest, &ta_signature)
        .map_err(|e| ApiError::unauthorized(format!("invalid transfer signature: {e}")))?;

    let head = state.chain_head().await?;
    let params = state.chain_params().await?;
    validate_timestamp(
        hdrs.timestamp,
        head.latest_block_time,
        params.validation.timestamp_expiration_secs,
        params.validation.timestamp_advance_secs,
    )?;

    state
        .auth_keys
        .record(
            &hdrs.auth_key,
            AuthContext::Executor,
            head.latest_block_height,
            retention_blocks(params.validation.timestamp_expiration_secs),
        )
        .map_err(ApiError::bad_request)?;

    let lease = state.workers.lock(&request.model).await?;
    let seeded_body =
        openai::inject_seed(&body, seed).map_err(|e| ApiError::internal(e.to_string()))?;
    let upstream = lease.infer(seeded_body).await?;

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::OK);
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    let finish = FinishContext {
        state: state.clone(),
        lease,
        body,
        timestamp: hdrs.timestamp,
        requester_address: hdrs.requester_address.clone(),
        transfer_address,
        inference_id,
        ta_signature,
        prompt_text: request.prompt_text(),
        request_model: request.model.clone(),
        content_type: content_type.clone(),
    };

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    tokio::spawn(pump_and_finish(finish, upstream, tx));

    let mut response = (status, StreamBody::new(ReceiverStream::new(rx))).into_response();
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        content_type
            .parse()
            .unwrap_or_else(|_| axum::http::HeaderValue::from_static("application/json")),
    );
    Ok(response)
}

struct FinishContext<C, Q> {
    state: Arc<ApiState<C, Q>>,
    /// Keeps the worker locked until the finish message is composed, so the
    /// tokenize fallback hits the same worker.
    lease: WorkerLease,
    body: Bytes,
    timestamp: i64,
    requester_address: String,
    transfer_address: String,
    inference_id: String,
    ta_signature: String,
    prompt_text: String,
    request_model: String,
    content_type: String,
}

/// Stream the worker's response to the client while collecting it, then
/// compose and submit `FinishInference`.
async fn pump_and_finish<C, Q>(
    ctx: FinishContext<C, Q>,
    upstream: reqwest::Response,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) where
    C: ChainClient,
    Q: DurableQueue,
{
    let mut collected: Vec<u8> = Vec::new();
    let mut stream = upstream.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                collected.extend_from_slice(&bytes);
                if tx.send(Ok(bytes)).await.is_err() {
                    // Client went away; keep collecting so the work still
                    // settles on-chain.
                    continue;
                }
            }
            Err(e) => {
                let _ = tx
                    .send(Err(std::io::Error::new(std::io::ErrorKind::Other, e)))
                    .await;
                break;
            }
        }
    }
    drop(tx);

    if let Err(e) = finish(ctx, collected).await {
        tracing::warn!(error = e.to_string(), "failed to settle finish inference");
    }
}

async fn finish<C, Q>(ctx: FinishContext<C, Q>, collected: Vec<u8>) -> anyhow::Result<()>
where
    C: ChainClient,
    Q: DurableQueue,
{
    let parsed = openai::parse_upstream(Some(&ctx.content_type), &collected)?;

    let mut prompt_tokens = parsed.prompt_tokens;
    if prompt_tokens == 0 && parsed.streamed {
        // Streaming workers may omit usage counts; re-tokenize on the
        // worker still held by the lease.
        prompt_tokens = ctx
            .lease
            .tokenize(&ctx.request_model, &ctx.prompt_text)
            .await
            .map_err(|e| anyhow::anyhow!("tokenize fallback failed: {e}"))?;
    }

    let executor_signature = agent::sign(
        &ctx.state.node.secret,
        &agent::executor_digest(
            &ctx.body,
            ctx.timestamp,
            &ctx.transfer_address,
            &ctx.state.node.address,
        ),
    )?;

    let msg = MsgFinishInference {
        creator: ctx.requester_address.clone(),
        inference_id: ctx.inference_id.clone(),
        response_hash: parsed.hash,
        response_payload: String::from_utf8_lossy(&collected).into_owned(),
        prompt_token_count: prompt_tokens,
        completion_token_count: parsed.completion_tokens,
        executed_by: ctx.state.node.address.clone(),
        transferred_by: ctx.transfer_address.clone(),
        transfer_signature: ctx.ta_signature.clone(),
        executor_signature,
        request_timestamp: ctx.timestamp,
        requested_by: ctx.requester_address.clone(),
        original_prompt: ctx.prompt_text.clone(),
        model: parsed.model.unwrap_or_else(|| ctx.request_model.clone()),
    };

    ctx.state
        .manager
        .submit_with_retry(msg.into())
        .await
        .map_err(|e| anyhow::anyhow!("submit finish inference: {e}"))?;

    tracing::debug!(inference_id = ctx.inference_id, "finish inference submitted");
    Ok(())
}
