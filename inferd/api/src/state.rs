// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use inferd_chain_message::msgs::START_INFERENCE_TYPE_URL;
use inferd_chain_rpc::{ChainClient, ChainParams, ChainStatus, Participant};
use inferd_crypto::{PublicKey, SecretKey};
use inferd_queue::DurableQueue;
use inferd_txmgr::TxManager;

use crate::authkey::AuthKeyTable;
use crate::bandwidth::BandwidthLimiter;
use crate::error::ApiError;
use crate::worker::WorkerPool;

/// Per-token price applied when the chain has no dynamic price for a model.
pub const LEGACY_PRICE_PER_TOKEN: u64 = 1000;

/// This node's identity in the protocol: the key it signs agent tuples
/// with, the address other participants know it by, and the URL under
/// which its executors are reachable (used to detect the self-loop).
pub struct NodeIdentity {
    pub secret: SecretKey,
    pub address: String,
    pub public_url: String,
    pub fee_denom: String,
}

/// Shared state behind every API handler.
///
/// Generic in the chain client and queue so the whole front end can run
/// against scripted collaborators in tests.
pub struct ApiState<C, Q> {
    pub manager: TxManager<C, Q>,
    pub client: C,
    pub bandwidth: Arc<BandwidthLimiter>,
    pub auth_keys: AuthKeyTable,
    pub node: NodeIdentity,
    pub workers: WorkerPool,
    /// Egress client for forwarding to remote executors.
    pub http: reqwest::Client,
}

impl<C, Q> ApiState<C, Q>
where
    C: ChainClient,
    Q: DurableQueue,
{
    pub fn new(
        manager: TxManager<C, Q>,
        client: C,
        node: NodeIdentity,
        workers: WorkerPool,
    ) -> Self {
        Self {
            manager,
            client,
            bandwidth: Arc::new(BandwidthLimiter::new()),
            auth_keys: AuthKeyTable::new(),
            node,
            workers,
            http: reqwest::Client::new(),
        }
    }

    pub async fn chain_head(&self) -> Result<ChainStatus, ApiError> {
        Ok(self.client.status().await?)
    }

    pub async fn chain_params(&self) -> Result<ChainParams, ApiError> {
        Ok(self.client.params().await?)
    }

    pub async fn participant(&self, address: &str) -> Result<Participant, ApiError> {
        self.client
            .participant(address)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("unknown participant: {address}")))
    }

    /// Keys accepted for signatures made on behalf of `granter`: the
    /// granter's own key plus every address it granted start-inference
    /// signing to. Unparseable keys are skipped.
    pub async fn granted_keys(
        &self,
        granter: &Participant,
    ) -> Result<Vec<PublicKey>, ApiError> {
        let mut keys = Vec::new();
        push_key(&mut keys, &granter.public_key);

        let grantees = self
            .client
            .grantees(&granter.address, START_INFERENCE_TYPE_URL)
            .await?;
        for grantee in &grantees {
            push_key(&mut keys, grantee);
        }

        if keys.is_empty() {
            return Err(ApiError::unauthorized(format!(
                "participant {} has no usable signing keys",
                granter.address
            )));
        }
        Ok(keys)
    }
}

fn push_key(keys: &mut Vec<PublicKey>, b64: &str) {
    match inferd_crypto::from_b64(b64).and_then(|bz| inferd_crypto::parse_public_key(&bz)) {
        Ok(key) => keys.push(key),
        Err(e) => tracing::warn!(error = e.to_string(), "skipping unparseable granted key"),
    }
}
