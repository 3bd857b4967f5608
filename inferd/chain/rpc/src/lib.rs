// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Client facade over the local chain node's RPC: transaction broadcast and
//! lookup over `tendermint-rpc`, plus the inference module's queries
//! tunneled through `abci_query`.

mod client;
mod paginated;
mod query;

/// Scriptable in-memory client for tests.
#[cfg(feature = "testing")]
pub mod testing;

pub use client::{http_client, HttpChainClient};
pub use paginated::{get_all_paginated, Page, PageRequest, PAGE_SIZE};
pub use query::{
    BandwidthParams, BroadcastResponse, ChainParams, ChainQuery, ChainStatus, Participant,
    TxResult, ValidationParams,
};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainRpcError {
    /// The transaction is not (yet) known to the node. A dedicated class
    /// because callers poll on it.
    #[error("transaction not found: {0}")]
    TxNotFound(String),
    #[error("chain RPC transport error: {0}")]
    Transport(#[from] tendermint_rpc::Error),
    #[error("query '{path}' failed: {message}")]
    Query { path: String, message: String },
    #[error("response decoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// The semantic operations the sidecar needs from its chain node.
///
/// Kept as a trait so the transaction manager and the API front end can be
/// exercised against a scripted client.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Broadcast a signed transaction, waiting for the mempool check but not
    /// for inclusion.
    async fn broadcast_tx_sync(&self, raw: Vec<u8>) -> Result<BroadcastResponse, ChainRpcError>;

    /// Look up a transaction by its hex hash. `TxNotFound` when the node
    /// does not know it (yet).
    async fn tx(&self, hash: &str) -> Result<TxResult, ChainRpcError>;

    async fn status(&self) -> Result<ChainStatus, ChainRpcError>;

    async fn participant(&self, address: &str) -> Result<Option<Participant>, ChainRpcError>;

    /// A random active executor serving the model, chosen chain-side.
    async fn random_executor(&self, model: &str) -> Result<Option<Participant>, ChainRpcError>;

    /// Base64 public keys allowed to sign `msg_type_url` on behalf of the
    /// granter, the granter's own key included.
    async fn grantees(&self, granter: &str, msg_type_url: &str)
        -> Result<Vec<String>, ChainRpcError>;

    async fn params(&self) -> Result<ChainParams, ChainRpcError>;

    /// Dynamic per-token price of a model, if the chain has one on record.
    async fn model_price(&self, model: &str) -> Result<Option<u64>, ChainRpcError>;

    async fn account_number(&self, address: &str) -> Result<u64, ChainRpcError>;

    async fn bank_balance(&self, address: &str, denom: &str) -> Result<u64, ChainRpcError>;
}
