// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Signature scheme linking the two inference hops.
//!
//! Every signature covers the tuple `(payload, timestamp, transfer address,
//! executor address)` hashed with the chain's standard signing hash; the
//! transfer-side tuple leaves the executor address empty because it is not
//! known yet when the developer signs. Signatures are 64 byte compact r‖s,
//! base64 encoded, and verification accepts any key from the caller's
//! grantee set: the developer's own key plus any address the developer has
//! authorized to sign on their behalf.

use inferd_crypto::{sha256, PublicKey, SecretKey, COMPACT_SIG_LEN};

use crate::MessageError;

fn signable(payload: &[u8], timestamp: i64, transfer_address: &str, executor_address: &str) -> [u8; 32] {
    let mut data = Vec::with_capacity(
        payload.len() + 20 + transfer_address.len() + executor_address.len(),
    );
    data.extend_from_slice(payload);
    data.extend_from_slice(timestamp.to_string().as_bytes());
    data.extend_from_slice(transfer_address.as_bytes());
    data.extend_from_slice(executor_address.as_bytes());
    sha256(&data)
}

/// Digest signed by the developer when addressing a transfer agent.
pub fn transfer_digest(payload: &[u8], timestamp: i64, transfer_address: &str) -> [u8; 32] {
    signable(payload, timestamp, transfer_address, "")
}

/// Digest signed by the transfer agent and the executor once the executor is
/// chosen.
pub fn executor_digest(
    payload: &[u8],
    timestamp: i64,
    transfer_address: &str,
    executor_address: &str,
) -> [u8; 32] {
    signable(payload, timestamp, transfer_address, executor_address)
}

/// Sign a digest, returning the base64 compact signature.
pub fn sign(sk: &SecretKey, digest: &[u8; 32]) -> anyhow::Result<String> {
    Ok(inferd_crypto::to_b64(&sk.sign(digest)?))
}

/// Verify a base64 compact signature against a set of acceptable keys.
///
/// Succeeds if any key in the set verifies; the set is expected to be the
/// granter's key plus its authz grantees.
pub fn verify_any(
    keys: &[PublicKey],
    digest: &[u8; 32],
    signature: &str,
) -> Result<(), MessageError> {
    let sig = inferd_crypto::from_b64(signature)
        .map_err(|e| MessageError::Base64(e.to_string()))?;
    if sig.len() != COMPACT_SIG_LEN {
        return Err(MessageError::InvalidSignature(format!(
            "signature must be {} bytes, got {}",
            COMPACT_SIG_LEN,
            sig.len()
        )));
    }
    for key in keys {
        if inferd_crypto::verify_signature(key, digest, &sig).is_ok() {
            return Ok(());
        }
    }
    Err(MessageError::InvalidSignature(
        "signature did not verify against any granted key".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use inferd_crypto::SecretKey;
    use quickcheck_macros::quickcheck;

    use crate::agent::{executor_digest, sign, transfer_digest, verify_any};

    #[quickcheck]
    fn sign_and_verify_transfer(payload: Vec<u8>, timestamp: i64) {
        let dev = SecretKey::random(&mut rand::thread_rng());
        let digest = transfer_digest(&payload, timestamp, "infer1transfer");
        let sig = sign(&dev, &digest).unwrap();

        verify_any(&[dev.public_key()], &digest, &sig).unwrap();
    }

    #[quickcheck]
    fn grantee_set_verification(payload: Vec<u8>, timestamp: i64) {
        let dev = SecretKey::random(&mut rand::thread_rng());
        let grantee = SecretKey::random(&mut rand::thread_rng());
        let stranger = SecretKey::random(&mut rand::thread_rng());

        let digest = executor_digest(&payload, timestamp, "infer1transfer", "infer1executor");
        let sig = sign(&grantee, &digest).unwrap();

        // Any key of the set may have produced the signature.
        verify_any(&[dev.public_key(), grantee.public_key()], &digest, &sig).unwrap();
        // A key outside the set must not.
        verify_any(&[dev.public_key(), stranger.public_key()], &digest, &sig).unwrap_err();
    }

    #[test]
    fn transfer_and_executor_tuples_differ() {
        let payload = b"{\"model\":\"m\"}";
        let t = transfer_digest(payload, 1, "infer1transfer");
        let e = executor_digest(payload, 1, "infer1transfer", "infer1executor");
        assert_ne!(t, e);

        // Empty executor address collapses to the transfer tuple.
        assert_eq!(t, executor_digest(payload, 1, "infer1transfer", ""));
    }

    #[test]
    fn malformed_signature_is_rejected() {
        let dev = SecretKey::random(&mut rand::thread_rng());
        let digest = transfer_digest(b"x", 1, "infer1transfer");

        verify_any(&[dev.public_key()], &digest, "!!!not-base64!!!").unwrap_err();
        verify_any(
            &[dev.public_key()],
            &digest,
            &inferd_crypto::to_b64(&[0u8; 12]),
        )
        .unwrap_err();
    }
}
