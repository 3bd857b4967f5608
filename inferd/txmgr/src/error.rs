// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Broadcast error taxonomy.
//!
//! Critical failures mean the transaction can never succeed as signed and
//! must surface to the caller; everything else is retried through the
//! streams.

use std::time::Duration;

use thiserror::Error;

use inferd_chain_rpc::{BroadcastResponse, ChainRpcError};
use inferd_queue::QueueError;

#[derive(Debug, Error)]
pub enum TxError {
    /// The transaction is permanently unacceptable; retrying cannot help.
    #[error("critical broadcast failure: {0}")]
    Critical(String),
    /// The node could not take the transaction right now.
    #[error("transient broadcast failure: {0}")]
    Transient(String),
    /// The chain has stopped producing blocks; only retry-class submissions
    /// can proceed (by queueing).
    #[error("chain is halted")]
    ChainHalted,
    /// A sync submission was broadcast but not seen on-chain within the
    /// wait. The outcome is unknown: the transaction may still be included
    /// until its timeout passes.
    #[error("transaction {tx_hash} not observed within {wait:?}; outcome unknown")]
    ConfirmationTimeout { tx_hash: String, wait: Duration },
    #[error("message encoding failed: {0}")]
    Encode(String),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// CheckTx log fragments that mark a transaction as permanently rejected.
///
/// Matched on the raw log because the node reports these under various
/// codespaces; the messages are stable across SDK versions.
const CRITICAL_LOG_PATTERNS: &[&str] = &[
    "tx too large",
    "malformed",
    "unknown account",
    "invalid address",
    "decoding bech32 failed",
    "signature verification failed",
    "unable to decode",
    "invalid pubkey",
];

pub fn is_critical_log(log: &str) -> bool {
    let log = log.to_lowercase();
    CRITICAL_LOG_PATTERNS.iter().any(|p| log.contains(p))
}

/// Classify a completed sync broadcast. `Ok` when the mempool accepted it.
pub fn check_broadcast(res: BroadcastResponse) -> Result<BroadcastResponse, TxError> {
    if res.is_ok() {
        Ok(res)
    } else if is_critical_log(&res.raw_log) {
        Err(TxError::Critical(format!(
            "code {}: {}",
            res.code, res.raw_log
        )))
    } else {
        Err(TxError::Transient(format!(
            "code {}: {}",
            res.code, res.raw_log
        )))
    }
}

/// Classify a failed broadcast RPC. Transport problems are transient; the
/// node rejecting the query outright is critical.
pub fn classify_rpc_error(e: ChainRpcError) -> TxError {
    match e {
        ChainRpcError::Transport(e) => TxError::Transient(e.to_string()),
        ChainRpcError::TxNotFound(h) => TxError::Transient(format!("tx not found: {h}")),
        ChainRpcError::Query { path, message } => {
            if is_critical_log(&message) {
                TxError::Critical(format!("{path}: {message}"))
            } else {
                TxError::Transient(format!("{path}: {message}"))
            }
        }
        ChainRpcError::Codec(e) => TxError::Critical(format!("response decoding failed: {e}")),
    }
}

impl TxError {
    pub fn is_critical(&self) -> bool {
        matches!(self, TxError::Critical(_) | TxError::Encode(_))
    }
}
