// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The message set the sidecar is allowed to submit, and the registry that
//! re-hydrates them from their type URL and encoded bytes.

use prost::Message as _;

use crate::{MessageError, MsgEnvelope};

/// Start of an inference: submitted by the transfer agent when it hands the
/// request over to the executor.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MsgStartInference {
    #[prost(string, tag = "1")]
    pub creator: String,
    #[prost(string, tag = "2")]
    pub inference_id: String,
    #[prost(string, tag = "3")]
    pub prompt_hash: String,
    #[prost(string, tag = "4")]
    pub prompt_payload: String,
    #[prost(string, tag = "5")]
    pub requested_by: String,
    #[prost(string, tag = "6")]
    pub assigned_to: String,
    #[prost(string, tag = "7")]
    pub model: String,
    #[prost(uint64, tag = "8")]
    pub max_tokens: u64,
    #[prost(uint64, tag = "9")]
    pub prompt_token_count: u64,
    #[prost(int64, tag = "10")]
    pub request_timestamp: i64,
    #[prost(string, tag = "11")]
    pub original_prompt: String,
    #[prost(string, tag = "12")]
    pub transfer_signature: String,
}

/// End of an inference: submitted by the executor with the response artifacts
/// and both agent signatures.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MsgFinishInference {
    #[prost(string, tag = "1")]
    pub creator: String,
    #[prost(string, tag = "2")]
    pub inference_id: String,
    #[prost(string, tag = "3")]
    pub response_hash: String,
    #[prost(string, tag = "4")]
    pub response_payload: String,
    #[prost(uint64, tag = "5")]
    pub prompt_token_count: u64,
    #[prost(uint64, tag = "6")]
    pub completion_token_count: u64,
    #[prost(string, tag = "7")]
    pub executed_by: String,
    #[prost(string, tag = "8")]
    pub transferred_by: String,
    #[prost(string, tag = "9")]
    pub transfer_signature: String,
    #[prost(string, tag = "10")]
    pub executor_signature: String,
    #[prost(int64, tag = "11")]
    pub request_timestamp: i64,
    #[prost(string, tag = "12")]
    pub requested_by: String,
    #[prost(string, tag = "13")]
    pub original_prompt: String,
    #[prost(string, tag = "14")]
    pub model: String,
}

/// Registration of a new, not yet funded participant.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MsgSubmitNewParticipant {
    #[prost(string, tag = "1")]
    pub creator: String,
    #[prost(string, tag = "2")]
    pub url: String,
    #[prost(string, repeated, tag = "3")]
    pub models: Vec<String>,
    #[prost(string, tag = "4")]
    pub worker_public_key: String,
}

/// A batch of proof-of-compute nonces generated during a PoC stage.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MsgSubmitPocBatch {
    #[prost(string, tag = "1")]
    pub creator: String,
    #[prost(int64, tag = "2")]
    pub poc_stage_start_block_height: i64,
    #[prost(string, tag = "3")]
    pub batch_id: String,
    #[prost(int64, repeated, tag = "4")]
    pub nonces: Vec<i64>,
    #[prost(double, repeated, tag = "5")]
    pub dist: Vec<f64>,
}

/// Validation verdict over another participant's PoC batches.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MsgSubmitPocValidation {
    #[prost(string, tag = "1")]
    pub creator: String,
    #[prost(string, tag = "2")]
    pub participant_address: String,
    #[prost(int64, tag = "3")]
    pub poc_stage_start_block_height: i64,
    #[prost(bool, tag = "4")]
    pub accepted: bool,
}

/// Claim of rewards earned in a settled epoch.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MsgClaimRewards {
    #[prost(string, tag = "1")]
    pub creator: String,
    #[prost(int64, tag = "2")]
    pub seed: i64,
    #[prost(uint64, tag = "3")]
    pub epoch_index: u64,
}

/// Assignment of participants to a training run.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MsgSubmitTrainingAssignment {
    #[prost(string, tag = "1")]
    pub creator: String,
    #[prost(uint64, tag = "2")]
    pub run_id: u64,
    #[prost(string, repeated, tag = "3")]
    pub assignees: Vec<String>,
}

/// Receipt of a token transfer observed on the origin chain bridge contract.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MsgBridgeReceipt {
    #[prost(string, tag = "1")]
    pub creator: String,
    #[prost(string, tag = "2")]
    pub origin_chain: String,
    #[prost(string, tag = "3")]
    pub contract_address: String,
    #[prost(string, tag = "4")]
    pub owner_address: String,
    #[prost(string, tag = "5")]
    pub amount: String,
    #[prost(string, tag = "6")]
    pub block_number: String,
    #[prost(string, tag = "7")]
    pub receipt_id: String,
}

/// Type URL the authz grants for transfer-agent signing are keyed by.
pub const START_INFERENCE_TYPE_URL: &str = "/inference.v1.MsgStartInference";

macro_rules! for_each_msg {
    ($macro:ident) => {
        $macro! {
            StartInference(MsgStartInference, "/inference.v1.MsgStartInference"),
            FinishInference(MsgFinishInference, "/inference.v1.MsgFinishInference"),
            SubmitNewParticipant(MsgSubmitNewParticipant, "/inference.v1.MsgSubmitNewParticipant"),
            SubmitPocBatch(MsgSubmitPocBatch, "/inference.v1.MsgSubmitPocBatch"),
            SubmitPocValidation(MsgSubmitPocValidation, "/inference.v1.MsgSubmitPocValidation"),
            ClaimRewards(MsgClaimRewards, "/inference.v1.MsgClaimRewards"),
            SubmitTrainingAssignment(
                MsgSubmitTrainingAssignment,
                "/inference.v1.MsgSubmitTrainingAssignment"
            ),
            BridgeReceipt(MsgBridgeReceipt, "/inference.v1.MsgBridgeReceipt"),
        }
    };
}

macro_rules! declare_msg_enum {
    ($($variant:ident($msg:ty, $url:literal)),* $(,)?) => {
        /// Sum of every message the transaction manager knows how to carry.
        ///
        /// The manager never looks inside; it only needs the type URL, the
        /// creator (to decide whether an authz envelope is required) and the
        /// protobuf bytes.
        #[derive(Clone, PartialEq, Debug)]
        pub enum Msg {
            $($variant($msg),)*
        }

        impl Msg {
            pub fn type_url(&self) -> &'static str {
                match self {
                    $(Msg::$variant(_) => $url,)*
                }
            }

            pub fn creator(&self) -> &str {
                match self {
                    $(Msg::$variant(m) => &m.creator,)*
                }
            }

            /// Protobuf encoding of the inner message, without the type tag.
            pub fn to_raw(&self) -> Vec<u8> {
                match self {
                    $(Msg::$variant(m) => m.encode_to_vec(),)*
                }
            }

            /// Re-hydrate a message from its type URL and protobuf bytes.
            ///
            /// Unknown type URLs and undecodable payloads are rejected; the
            /// consumers treat both as poison.
            pub fn from_raw(type_url: &str, raw: &[u8]) -> Result<Self, MessageError> {
                match type_url {
                    $($url => Ok(Msg::$variant(<$msg>::decode(raw)?)),)*
                    other => Err(MessageError::UnknownTypeUrl(other.to_string())),
                }
            }
        }

        $(
            impl From<$msg> for Msg {
                fn from(m: $msg) -> Self {
                    Msg::$variant(m)
                }
            }
        )*
    };
}

for_each_msg!(declare_msg_enum);

impl Msg {
    /// The JSON envelope stored on the durable streams.
    pub fn to_envelope(&self) -> MsgEnvelope {
        MsgEnvelope {
            type_url: self.type_url().to_string(),
            value: inferd_crypto::to_b64(&self.to_raw()),
        }
    }

    pub fn from_envelope(envelope: &MsgEnvelope) -> Result<Self, MessageError> {
        Self::from_raw(&envelope.type_url, &envelope.raw()?)
    }
}
