// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The records that travel on the durable streams.

use serde::{Deserialize, Serialize};
use tendermint::Time;
use uuid::Uuid;

use inferd_chain_message::MsgEnvelope;

/// Stream of transactions waiting to be broadcast (or re-broadcast).
pub const SEND_STREAM: &str = "txs_to_send";
/// Stream of broadcast transactions waiting to be seen on-chain.
pub const OBSERVE_STREAM: &str = "txs_to_observe";

/// One logical transaction tracked by the manager.
///
/// Created when a caller submits a message; mutated only when the record is
/// re-queued after a broadcast attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRecord {
    pub id: Uuid,
    /// The message in the chain codec's JSON envelope, from which it can be
    /// re-hydrated for re-broadcast.
    #[serde(rename = "rawTx")]
    pub raw_tx: MsgEnvelope,
    /// Hash of the last broadcast, if any. Uppercase hex.
    #[serde(rename = "txHash")]
    pub tx_hash: Option<String>,
    /// RFC3339 nanosecond timestamp after which the last broadcast can no
    /// longer be included.
    pub timeout: Option<Time>,
    pub attempts: u32,
}

impl TxRecord {
    pub fn new(raw_tx: MsgEnvelope) -> Self {
        Self {
            id: Uuid::new_v4(),
            raw_tx,
            tx_hash: None,
            timeout: None,
            attempts: 0,
        }
    }

    /// The broadcast timeout in unix nanoseconds; 0 when unset.
    pub fn timeout_nanos(&self) -> i64 {
        self.timeout.map(|t| t.unix_timestamp_nanos() as i64).unwrap_or(0)
    }
}

/// Send-stream wrapper: whether the record has a live broadcast out.
///
/// Invariant: `sent` implies `tx_hash` and `timeout` are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxToSend {
    pub info: TxRecord,
    pub sent: bool,
    pub attempts: u32,
}

impl TxToSend {
    pub fn unsent(info: TxRecord) -> Self {
        let attempts = info.attempts;
        Self {
            info,
            sent: false,
            attempts,
        }
    }

    pub fn sent(info: TxRecord) -> Self {
        debug_assert!(info.tx_hash.is_some() && info.timeout.is_some());
        let attempts = info.attempts;
        Self {
            info,
            sent: true,
            attempts,
        }
    }
}
