// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! OpenAI-compatible HTTP front end of the sidecar.
//!
//! One route carries both hops of the inference protocol: a request with an
//! inference id and a seed already assigned is the executor hop, anything
//! else is the transfer hop. The second route registers new participants.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

pub mod authkey;
pub mod bandwidth;
pub mod error;
pub mod headers;
pub mod openai;
pub mod state;
pub mod worker;

mod executor;
mod transfer;

use error::ApiError;
use headers::InferenceHeaders;
use inferd_chain_message::msgs::MsgSubmitNewParticipant;
use inferd_chain_rpc::ChainClient;
use inferd_queue::DurableQueue;
use state::ApiState;

/// Serve the API until the token is cancelled.
pub async fn listen<C, Q>(
    listen_addr: SocketAddr,
    state: Arc<ApiState<C, Q>>,
    token: CancellationToken,
) -> anyhow::Result<()>
where
    C: ChainClient + Clone + 'static,
    Q: DurableQueue,
{
    bandwidth::spawn_cleanup(
        state.bandwidth.clone(),
        state.client.clone(),
        bandwidth::DEFAULT_CLEANUP_INTERVAL,
        token.clone(),
    );

    let router = make_router(state);
    let server = axum::Server::try_bind(&listen_addr)?.serve(router.into_make_service());
    tracing::info!(?listen_addr, "bound inference API");

    let shutdown = token.clone();
    server
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Register routes in the `axum` HTTP router.
pub fn make_router<C, Q>(state: Arc<ApiState<C, Q>>) -> Router
where
    C: ChainClient + Clone + 'static,
    Q: DurableQueue,
{
    Router::new()
        .route("/v1/chat/completions", post(handle_chat::<C, Q>))
        .route("/v1/participants", post(handle_participants::<C, Q>))
        .with_state(state)
}

/// One handler for both hops; the headers decide which path runs.
async fn handle_chat<C, Q>(
    State(state): State<Arc<ApiState<C, Q>>>,
    header_map: HeaderMap,
    body: Bytes,
) -> Response
where
    C: ChainClient + Clone + 'static,
    Q: DurableQueue,
{
    let hdrs = match InferenceHeaders::parse(&header_map) {
        Ok(hdrs) => hdrs,
        Err(e) => return e.into_response(),
    };

    let result = if hdrs.is_executor_request() {
        executor::handle(state, hdrs, body).await
    } else {
        transfer::handle(state, hdrs, body).await
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(status = %e.status, error = e.message, "chat request rejected");
            e.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct NewParticipantRequest {
    address: String,
    url: String,
    #[serde(default)]
    models: Vec<String>,
    #[serde(default)]
    worker_public_key: String,
}

/// Submit a new, unfunded participant straight to the chain: a single
/// broadcast with no durable retry, so failures surface to the caller.
async fn handle_participants<C, Q>(
    State(state): State<Arc<ApiState<C, Q>>>,
    Json(request): Json<NewParticipantRequest>,
) -> Response
where
    C: ChainClient + Clone + 'static,
    Q: DurableQueue,
{
    let msg = MsgSubmitNewParticipant {
        creator: request.address,
        url: request.url,
        models: request.models,
        worker_public_key: request.worker_public_key,
    };

    match state.manager.submit_no_retry(msg.into()).await {
        Ok(res) => (
            StatusCode::OK,
            Json(json!({ "tx_hash": res.tx_hash })),
        )
            .into_response(),
        Err(e) if e.is_critical() => ApiError::bad_request(e).into_response(),
        Err(e) => ApiError::bad_gateway(e).into_response(),
    }
}
