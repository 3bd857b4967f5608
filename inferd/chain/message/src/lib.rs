// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! On-chain messages the sidecar produces, the protobuf transaction envelope
//! they travel in, and the agent signature scheme tying the two inference
//! hops together.

pub mod agent;
pub mod msgs;
pub mod tx;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use msgs::Msg;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("unknown message type URL: {0}")]
    UnknownTypeUrl(String),
    #[error("message cannot be decoded: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// JSON envelope of a message: its type URL plus the base64 of its protobuf
/// encoding. This is the at-rest format on the durable streams, from which
/// the original message can be re-hydrated through the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgEnvelope {
    pub type_url: String,
    /// Base64 of the protobuf encoded message.
    pub value: String,
}

impl MsgEnvelope {
    pub fn raw(&self) -> Result<Vec<u8>, MessageError> {
        inferd_crypto::from_b64(&self.value).map_err(|e| MessageError::Base64(e.to_string()))
    }
}
