// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The protocol headers both hops travel under.

use axum::http::HeaderMap;

use crate::error::ApiError;

pub const AUTHORIZATION: &str = "authorization";
pub const TIMESTAMP: &str = "x-timestamp";
pub const REQUESTER_ADDRESS: &str = "x-requester-address";
pub const SEED: &str = "x-seed";
pub const INFERENCE_ID: &str = "x-inference-id";
pub const TRANSFER_ADDRESS: &str = "x-transfer-address";
pub const TA_SIGNATURE: &str = "x-ta-signature";

/// Parsed protocol headers of an inference request.
#[derive(Debug, Clone)]
pub struct InferenceHeaders {
    /// The developer's signature over the request body; doubles as the
    /// inference id and the anti-replay token.
    pub auth_key: String,
    /// Unix nanoseconds the developer stamped the request with.
    pub timestamp: i64,
    pub requester_address: String,
    pub seed: Option<i32>,
    pub inference_id: Option<String>,
    pub transfer_address: Option<String>,
    pub ta_signature: Option<String>,
}

impl InferenceHeaders {
    pub fn parse(headers: &HeaderMap) -> Result<Self, ApiError> {
        let auth_key = required(headers, AUTHORIZATION)?;
        let auth_key = auth_key
            .strip_prefix("Bearer ")
            .unwrap_or(&auth_key)
            .to_string();

        let timestamp = required(headers, TIMESTAMP)?
            .parse::<i64>()
            .map_err(|_| ApiError::bad_request("X-Timestamp must be unix nanoseconds"))?;

        let seed = optional(headers, SEED)?
            .map(|s| {
                s.parse::<i32>()
                    .map_err(|_| ApiError::bad_request("X-Seed must be a 32 bit integer"))
            })
            .transpose()?;

        Ok(Self {
            auth_key,
            timestamp,
            requester_address: required(headers, REQUESTER_ADDRESS)?,
            seed,
            inference_id: optional(headers, INFERENCE_ID)?,
            transfer_address: optional(headers, TRANSFER_ADDRESS)?,
            ta_signature: optional(headers, TA_SIGNATURE)?,
        })
    }

    /// Second hop iff the transfer agent has already assigned id and seed.
    pub fn is_executor_request(&self) -> bool {
        self.inference_id.is_some() && self.seed.is_some()
    }
}

fn required(headers: &HeaderMap, name: &str) -> Result<String, ApiError> {
    optional(headers, name)?
        .ok_or_else(|| ApiError::bad_request(format!("missing required header {name}")))
}

fn optional(headers: &HeaderMap, name: &str) -> Result<Option<String>, ApiError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|s| Some(s.to_string()))
            .map_err(|_| ApiError::bad_request(format!("header {name} is not valid UTF-8"))),
    }
}

/// Check a request timestamp against chain time: a bounded distance into
/// the past and the future. Equality at either bound is accepted.
pub fn validate_timestamp(
    timestamp_ns: i64,
    chain_time_ns: i64,
    expiration_secs: i64,
    advance_secs: i64,
) -> Result<(), ApiError> {
    if timestamp_ns < chain_time_ns.saturating_sub(expiration_secs.saturating_mul(1_000_000_000)) {
        return Err(ApiError::unauthorized("request timestamp expired"));
    }
    if timestamp_ns > chain_time_ns.saturating_add(advance_secs.saturating_mul(1_000_000_000)) {
        return Err(ApiError::unauthorized(
            "request timestamp too far in the future",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderMap;

    use crate::headers::{validate_timestamp, InferenceHeaders};

    fn base_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "c2lnbmF0dXJl".parse().unwrap());
        headers.insert("x-timestamp", "1700000000000000000".parse().unwrap());
        headers.insert(
            "x-requester-address",
            "infer1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5lzv7xu".parse().unwrap(),
        );
        headers
    }

    #[test]
    fn transfer_request_headers() {
        let parsed = InferenceHeaders::parse(&base_headers()).unwrap();
        assert_eq!(parsed.auth_key, "c2lnbmF0dXJl");
        assert_eq!(parsed.timestamp, 1_700_000_000_000_000_000);
        assert!(!parsed.is_executor_request());
    }

    #[test]
    fn bearer_prefix_is_stripped() {
        let mut headers = base_headers();
        headers.insert("authorization", "Bearer c2ln".parse().unwrap());
        let parsed = InferenceHeaders::parse(&headers).unwrap();
        assert_eq!(parsed.auth_key, "c2ln");
    }

    #[test]
    fn executor_request_needs_id_and_seed() {
        let mut headers = base_headers();
        headers.insert("x-inference-id", "abc".parse().unwrap());
        let parsed = InferenceHeaders::parse(&headers).unwrap();
        assert!(!parsed.is_executor_request());

        headers.insert("x-seed", "-5".parse().unwrap());
        let parsed = InferenceHeaders::parse(&headers).unwrap();
        assert!(parsed.is_executor_request());
        assert_eq!(parsed.seed, Some(-5));
    }

    #[test]
    fn missing_and_malformed_headers() {
        let mut headers = base_headers();
        headers.remove("x-timestamp");
        assert!(InferenceHeaders::parse(&headers).is_err());

        let mut headers = base_headers();
        headers.insert("x-timestamp", "yesterday".parse().unwrap());
        assert!(InferenceHeaders::parse(&headers).is_err());
    }

    #[test]
    fn timestamp_window() {
        let now = 1_000_000_000_000; // chain time, ns
        let exp = 30;
        let adv = 10;

        // Exactly at the expiration bound is still valid.
        validate_timestamp(now - 30_000_000_000, now, exp, adv).unwrap();
        validate_timestamp(now - 30_000_000_001, now, exp, adv).unwrap_err();

        validate_timestamp(now + 10_000_000_000, now, exp, adv).unwrap();
        validate_timestamp(now + 10_000_000_001, now, exp, adv).unwrap_err();
    }
}
