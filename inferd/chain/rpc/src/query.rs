// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! DTOs of the inference module's ABCI queries and of the transaction
//! endpoints. The module's query codec is JSON over `abci_query` paths.

use serde::{Deserialize, Serialize};

use crate::paginated::PageRequest;

/// Result of a sync broadcast: the mempool check outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastResponse {
    /// Uppercase hex.
    pub tx_hash: String,
    pub code: u32,
    pub raw_log: String,
}

impl BroadcastResponse {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// Result of a transaction lookup: the delivery outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxResult {
    pub height: u64,
    pub code: u32,
    pub codespace: String,
    pub log: String,
    #[serde(default)]
    pub data: Vec<u8>,
}

impl TxResult {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChainStatus {
    pub latest_block_height: u64,
    /// Unix nanoseconds.
    pub latest_block_time: i64,
    pub catching_up: bool,
}

/// On-chain participant record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub address: String,
    pub inference_url: String,
    pub models: Vec<String>,
    /// Spendable balance in the fee denom.
    pub balance: u64,
    /// Base64 SEC1 public key of the participant's developer account.
    pub public_key: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ValidationParams {
    /// How many blocks an inference stays open for validation. Doubles as
    /// the bandwidth accounting window.
    pub expiration_blocks: u64,
    /// How far in the past a request timestamp may lie, seconds.
    pub timestamp_expiration_secs: i64,
    /// How far in the future a request timestamp may lie, seconds.
    pub timestamp_advance_secs: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BandwidthParams {
    pub estimated_limits_per_block_kb: f64,
    pub kb_per_input_token: f64,
    pub kb_per_output_token: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChainParams {
    pub validation: ValidationParams,
    pub bandwidth: BandwidthParams,
}

/// Queries tunneled through `abci_query`, tagged by path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainQuery {
    Participant {
        address: String,
    },
    RandomExecutor {
        model: String,
    },
    Grantees {
        granter: String,
        msg_type_url: String,
        page: PageRequest,
    },
    Params,
    ModelPrice {
        model: String,
    },
    Account {
        address: String,
    },
    Balance {
        address: String,
        denom: String,
    },
}

impl ChainQuery {
    /// The ABCI query path the request is routed by.
    pub fn path(&self) -> &'static str {
        match self {
            ChainQuery::Participant { .. } => "/inference/participant",
            ChainQuery::RandomExecutor { .. } => "/inference/random_executor",
            ChainQuery::Grantees { .. } => "/inference/grantees",
            ChainQuery::Params => "/inference/params",
            ChainQuery::ModelPrice { .. } => "/inference/model_price",
            ChainQuery::Account { .. } => "/auth/account",
            ChainQuery::Balance { .. } => "/bank/balance",
        }
    }
}

/// One page of granted keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GranteesPage {
    pub pubkeys: Vec<String>,
    pub next_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountResponse {
    pub account_number: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPriceResponse {
    pub price_per_token: Option<u64>,
}
