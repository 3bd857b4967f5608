// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! A scriptable [`ChainClient`] so the transaction manager and the API front
//! end can be driven through failure scenarios no real node would produce on
//! demand.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::query::{
    BandwidthParams, BroadcastResponse, ChainParams, ChainStatus, Participant, TxResult,
    ValidationParams,
};
use crate::{ChainClient, ChainRpcError};

pub struct MockState {
    pub status: ChainStatus,
    /// Raw bytes of every broadcast, in order.
    pub broadcasts: Vec<Vec<u8>>,
    /// Scripted broadcast outcomes; when empty every broadcast succeeds
    /// with a synthetic hash.
    pub broadcast_script: VecDeque<Result<BroadcastResponse, ChainRpcError>>,
    /// Transactions the chain "knows"; anything else is not found.
    pub txs: HashMap<String, TxResult>,
    pub participants: HashMap<String, Participant>,
    pub executors: Vec<Participant>,
    /// `(granter, msg_type_url)` to base64 public keys.
    pub grantees: HashMap<(String, String), Vec<String>>,
    pub params: ChainParams,
    pub model_prices: HashMap<String, u64>,
    pub account_numbers: HashMap<String, u64>,
    /// `(address, denom)` to amount.
    pub balances: HashMap<(String, String), u64>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            status: ChainStatus {
                latest_block_height: 1,
                latest_block_time: 1,
                catching_up: false,
            },
            broadcasts: Vec::new(),
            broadcast_script: VecDeque::new(),
            txs: HashMap::new(),
            participants: HashMap::new(),
            executors: Vec::new(),
            grantees: HashMap::new(),
            params: ChainParams {
                validation: ValidationParams {
                    expiration_blocks: 10,
                    timestamp_expiration_secs: 30,
                    timestamp_advance_secs: 10,
                },
                bandwidth: BandwidthParams {
                    estimated_limits_per_block_kb: 100.0,
                    kb_per_input_token: 0.01,
                    kb_per_output_token: 0.5,
                },
            },
            model_prices: HashMap::new(),
            account_numbers: HashMap::new(),
            balances: HashMap::new(),
        }
    }
}

/// Clones share the same scripted state.
#[derive(Clone, Default)]
pub struct MockChainClient {
    state: Arc<Mutex<MockState>>,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    /// Advance the simulated chain by one block.
    pub fn advance_block(&self, block_interval_ns: i64) {
        let mut state = self.state();
        state.status.latest_block_height += 1;
        state.status.latest_block_time += block_interval_ns;
    }

    pub fn set_status(&self, height: u64, time_ns: i64) {
        let mut state = self.state();
        state.status.latest_block_height = height;
        state.status.latest_block_time = time_ns;
    }

    /// Make a previously broadcast transaction visible on-chain.
    pub fn include_tx(&self, tx_hash: &str, result: TxResult) {
        self.state().txs.insert(tx_hash.to_string(), result);
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn broadcast_tx_sync(&self, raw: Vec<u8>) -> Result<BroadcastResponse, ChainRpcError> {
        let mut state = self.state();
        state.broadcasts.push(raw);
        let n = state.broadcasts.len();
        match state.broadcast_script.pop_front() {
            Some(outcome) => outcome,
            None => Ok(BroadcastResponse {
                tx_hash: format!("{n:064X}"),
                code: 0,
                raw_log: String::new(),
            }),
        }
    }

    async fn tx(&self, hash: &str) -> Result<TxResult, ChainRpcError> {
        self.state()
            .txs
            .get(hash)
            .cloned()
            .ok_or_else(|| ChainRpcError::TxNotFound(hash.to_string()))
    }

    async fn status(&self) -> Result<ChainStatus, ChainRpcError> {
        Ok(self.state().status)
    }

    async fn participant(&self, address: &str) -> Result<Option<Participant>, ChainRpcError> {
        Ok(self.state().participants.get(address).cloned())
    }

    async fn random_executor(&self, model: &str) -> Result<Option<Participant>, ChainRpcError> {
        Ok(self
            .state()
            .executors
            .iter()
            .find(|p| p.models.iter().any(|m| m == model))
            .cloned())
    }

    async fn grantees(
        &self,
        granter: &str,
        msg_type_url: &str,
    ) -> Result<Vec<String>, ChainRpcError> {
        Ok(self
            .state()
            .grantees
            .get(&(granter.to_string(), msg_type_url.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn params(&self) -> Result<ChainParams, ChainRpcError> {
        Ok(self.state().params)
    }

    async fn model_price(&self, model: &str) -> Result<Option<u64>, ChainRpcError> {
        Ok(self.state().model_prices.get(model).copied())
    }

    async fn account_number(&self, address: &str) -> Result<u64, ChainRpcError> {
        self.state()
            .account_numbers
            .get(address)
            .copied()
            .ok_or_else(|| ChainRpcError::Query {
                path: "/auth/account".to_string(),
                message: format!("unknown account: {address}"),
            })
    }

    async fn bank_balance(&self, address: &str, denom: &str) -> Result<u64, ChainRpcError> {
        Ok(self
            .state()
            .balances
            .get(&(address.to_string(), denom.to_string()))
            .copied()
            .unwrap_or_default())
    }
}
