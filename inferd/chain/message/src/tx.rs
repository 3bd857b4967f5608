// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The subset of the Cosmos SDK transaction protos the sidecar needs to
//! compose and sign unordered transactions, declared with `prost` directly.
//!
//! Transactions are signed in `SIGN_MODE_DIRECT` with no sequence number:
//! replay protection comes from `unordered = true` plus the timeout
//! timestamp, which is why the signer never tracks per-account sequences.

use cosmrs::AccountId;
use prost::Message as _;

use inferd_crypto::{sha256, PublicKey, SecretKey};

use crate::{MessageError, Msg};

pub const DEFAULT_GAS_LIMIT: u64 = 1_000_000_000;

pub const SECP256K1_PUBKEY_TYPE_URL: &str = "/cosmos.crypto.secp256k1.PubKey";
pub const MSG_EXEC_TYPE_URL: &str = "/cosmos.authz.v1beta1.MsgExec";

const SIGN_MODE_DIRECT: i32 = 1;

/// `google.protobuf.Any`
#[derive(Clone, PartialEq, prost::Message)]
pub struct RawAny {
    #[prost(string, tag = "1")]
    pub type_url: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// `google.protobuf.Timestamp`
#[derive(Clone, PartialEq, prost::Message)]
pub struct Timestamp {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

impl Timestamp {
    pub fn from_unix_nanos(ns: i64) -> Self {
        Self {
            seconds: ns.div_euclid(1_000_000_000),
            nanos: ns.rem_euclid(1_000_000_000) as i32,
        }
    }
}

/// `cosmos.tx.v1beta1.TxBody`
#[derive(Clone, PartialEq, prost::Message)]
pub struct TxBody {
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<RawAny>,
    #[prost(string, tag = "2")]
    pub memo: String,
    #[prost(uint64, tag = "3")]
    pub timeout_height: u64,
    #[prost(bool, tag = "4")]
    pub unordered: bool,
    #[prost(message, optional, tag = "5")]
    pub timeout_timestamp: Option<Timestamp>,
}

/// `cosmos.tx.v1beta1.AuthInfo`
#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthInfo {
    #[prost(message, repeated, tag = "1")]
    pub signer_infos: Vec<SignerInfo>,
    #[prost(message, optional, tag = "2")]
    pub fee: Option<Fee>,
}

/// `cosmos.tx.v1beta1.SignerInfo`
#[derive(Clone, PartialEq, prost::Message)]
pub struct SignerInfo {
    #[prost(message, optional, tag = "1")]
    pub public_key: Option<RawAny>,
    #[prost(message, optional, tag = "2")]
    pub mode_info: Option<ModeInfo>,
    #[prost(uint64, tag = "3")]
    pub sequence: u64,
}

/// `cosmos.tx.v1beta1.ModeInfo`
#[derive(Clone, PartialEq, prost::Message)]
pub struct ModeInfo {
    #[prost(oneof = "mode_info::Sum", tags = "1")]
    pub sum: Option<mode_info::Sum>,
}

pub mod mode_info {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Sum {
        #[prost(message, tag = "1")]
        Single(super::Single),
    }
}

/// `cosmos.tx.v1beta1.ModeInfo.Single`
#[derive(Clone, PartialEq, prost::Message)]
pub struct Single {
    #[prost(int32, tag = "1")]
    pub mode: i32,
}

/// `cosmos.base.v1beta1.Coin`
#[derive(Clone, PartialEq, prost::Message)]
pub struct Coin {
    #[prost(string, tag = "1")]
    pub denom: String,
    #[prost(string, tag = "2")]
    pub amount: String,
}

/// `cosmos.tx.v1beta1.Fee`
#[derive(Clone, PartialEq, prost::Message)]
pub struct Fee {
    #[prost(message, repeated, tag = "1")]
    pub amount: Vec<Coin>,
    #[prost(uint64, tag = "2")]
    pub gas_limit: u64,
    #[prost(string, tag = "3")]
    pub payer: String,
    #[prost(string, tag = "4")]
    pub granter: String,
}

/// `cosmos.tx.v1beta1.SignDoc`
#[derive(Clone, PartialEq, prost::Message)]
pub struct SignDoc {
    #[prost(bytes = "vec", tag = "1")]
    pub body_bytes: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub auth_info_bytes: Vec<u8>,
    #[prost(string, tag = "3")]
    pub chain_id: String,
    #[prost(uint64, tag = "4")]
    pub account_number: u64,
}

/// `cosmos.tx.v1beta1.TxRaw`
#[derive(Clone, PartialEq, prost::Message)]
pub struct TxRaw {
    #[prost(bytes = "vec", tag = "1")]
    pub body_bytes: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub auth_info_bytes: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub signatures: Vec<Vec<u8>>,
}

/// `cosmos.crypto.secp256k1.PubKey`
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtoPubKey {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
}

/// `cosmos.authz.v1beta1.MsgExec`
#[derive(Clone, PartialEq, prost::Message)]
pub struct MsgExec {
    #[prost(string, tag = "1")]
    pub grantee: String,
    #[prost(message, repeated, tag = "2")]
    pub msgs: Vec<RawAny>,
}

/// Derive the bech32 account address of a public key.
pub fn derive_address(pk: &PublicKey, prefix: &str) -> Result<AccountId, MessageError> {
    cosmrs::crypto::PublicKey::from(*pk)
        .account_id(prefix)
        .map_err(|e| MessageError::InvalidAddress(e.to_string()))
}

/// Signs transactions with the node's key.
///
/// The account number is not known at construction; the transaction manager
/// looks it up once and passes it in with every call.
pub struct TxSigner {
    secret: SecretKey,
    address: AccountId,
    public_key_proto: Vec<u8>,
    chain_id: String,
}

impl TxSigner {
    pub fn new(secret: SecretKey, prefix: &str, chain_id: String) -> Result<Self, MessageError> {
        let address = derive_address(&secret.public_key(), prefix)?;
        let public_key_proto = ProtoPubKey {
            key: inferd_crypto::serialize_public_key(&secret.public_key()),
        }
        .encode_to_vec();
        Ok(Self {
            secret,
            address,
            public_key_proto,
            chain_id,
        })
    }

    pub fn address(&self) -> &AccountId {
        &self.address
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Build and sign an unordered transaction carrying a single message.
    ///
    /// When the message creator is not the signing account, the message is
    /// wrapped in an authz exec envelope so the grantee (this node) can act
    /// on the creator's behalf.
    pub fn sign_unordered(
        &self,
        msg: &Msg,
        account_number: u64,
        timeout_timestamp_ns: i64,
    ) -> anyhow::Result<Vec<u8>> {
        let mut any = RawAny {
            type_url: msg.type_url().to_string(),
            value: msg.to_raw(),
        };

        if msg.creator() != self.address.to_string() {
            let exec = MsgExec {
                grantee: self.address.to_string(),
                msgs: vec![any],
            };
            any = RawAny {
                type_url: MSG_EXEC_TYPE_URL.to_string(),
                value: exec.encode_to_vec(),
            };
        }

        let body_bytes = TxBody {
            messages: vec![any],
            memo: String::new(),
            timeout_height: 0,
            unordered: true,
            timeout_timestamp: Some(Timestamp::from_unix_nanos(timeout_timestamp_ns)),
        }
        .encode_to_vec();

        let auth_info_bytes = AuthInfo {
            signer_infos: vec![SignerInfo {
                public_key: Some(RawAny {
                    type_url: SECP256K1_PUBKEY_TYPE_URL.to_string(),
                    value: self.public_key_proto.clone(),
                }),
                mode_info: Some(ModeInfo {
                    sum: Some(mode_info::Sum::Single(Single {
                        mode: SIGN_MODE_DIRECT,
                    })),
                }),
                // Unordered transactions carry no sequence.
                sequence: 0,
            }],
            fee: Some(Fee {
                amount: Vec::new(),
                gas_limit: DEFAULT_GAS_LIMIT,
                payer: String::new(),
                granter: String::new(),
            }),
        }
        .encode_to_vec();

        let sign_doc = SignDoc {
            body_bytes: body_bytes.clone(),
            auth_info_bytes: auth_info_bytes.clone(),
            chain_id: self.chain_id.clone(),
            account_number,
        }
        .encode_to_vec();

        let signature = self.secret.sign(&sha256(&sign_doc))?;

        Ok(TxRaw {
            body_bytes,
            auth_info_bytes,
            signatures: vec![signature.to_vec()],
        }
        .encode_to_vec())
    }

    /// Public key of the signing account.
    pub fn public_key(&self) -> inferd_crypto::PublicKey {
        self.secret.public_key()
    }
}
