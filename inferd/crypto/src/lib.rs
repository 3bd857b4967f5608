// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use base64::engine::GeneralPurpose;
use base64::engine::{DecodePaddingMode, GeneralPurposeConfig};
use base64::{alphabet, Engine};
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub use k256::ecdsa::VerifyingKey as PublicKey;

/// Length of a compact (r‖s) signature in bytes.
pub const COMPACT_SIG_LEN: usize = 64;

/// A [`GeneralPurpose`] engine using the [`alphabet::STANDARD`] base64 alphabet
/// padding bytes when writing but requireing no padding when reading.
const B64_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Encode bytes in the format signatures travel in headers and messages.
pub fn to_b64(bz: &[u8]) -> String {
    B64_ENGINE.encode(bz)
}

/// Decode bytes from Base64.
pub fn from_b64(b64: &str) -> anyhow::Result<Vec<u8>> {
    Ok(B64_ENGINE.decode(b64)?)
}

/// SHA-256 digest, the chain's standard signing hash.
pub fn sha256(bz: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bz);
    hasher.finalize().into()
}

/// Wrapper around a [`k256::ecdsa::SigningKey`] that implements [`Zeroize`].
#[derive(Debug, Clone)]
pub struct SecretKey(k256::ecdsa::SigningKey);

impl SecretKey {
    /// Sign a 32 byte digest, returning the 64 byte compact r‖s signature.
    pub fn sign(&self, digest: &[u8; 32]) -> anyhow::Result<[u8; COMPACT_SIG_LEN]> {
        let sig: k256::ecdsa::Signature = self.0.sign_prehash(digest)?;
        let sig = sig.normalize_s().unwrap_or(sig);
        Ok(sig.to_bytes().into())
    }

    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(k256::ecdsa::SigningKey::random(rng))
    }

    pub fn public_key(&self) -> PublicKey {
        *self.0.verifying_key()
    }

    pub fn serialize(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.0.to_bytes().into())
    }
}

impl Zeroize for SecretKey {
    fn zeroize(&mut self) {
        // The signing key drops its scalar when replaced.
        self.0 = k256::ecdsa::SigningKey::from_bytes(&[1u8; 32].into()).expect("1 is a valid key");
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.zeroize()
    }
}

impl ZeroizeOnDrop for SecretKey {}

impl TryFrom<Vec<u8>> for SecretKey {
    type Error = k256::ecdsa::Error;

    fn try_from(mut value: Vec<u8>) -> Result<Self, Self::Error> {
        let sk = k256::ecdsa::SigningKey::from_slice(&value)?;
        value.zeroize();
        Ok(Self(sk))
    }
}

impl From<k256::ecdsa::SigningKey> for SecretKey {
    fn from(value: k256::ecdsa::SigningKey) -> Self {
        Self(value)
    }
}

impl From<&SecretKey> for PublicKey {
    fn from(value: &SecretKey) -> Self {
        value.public_key()
    }
}

/// Verify a compact r‖s signature over a 32 byte digest against a public key.
///
/// Accepts both low-s and high-s encodings.
pub fn verify_signature(pk: &PublicKey, digest: &[u8; 32], sig: &[u8]) -> anyhow::Result<()> {
    let sig = k256::ecdsa::Signature::from_slice(sig)?;
    let sig = sig.normalize_s().unwrap_or(sig);
    pk.verify_prehash(digest, &sig)?;
    Ok(())
}

/// Serialize a public key in compressed SEC1 format (33 bytes).
pub fn serialize_public_key(pk: &PublicKey) -> Vec<u8> {
    pk.to_encoded_point(true).as_bytes().to_vec()
}

/// Parse a public key from SEC1 bytes, compressed or not.
pub fn parse_public_key(bz: &[u8]) -> anyhow::Result<PublicKey> {
    Ok(PublicKey::from_sec1_bytes(bz)?)
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;

    use crate::{
        from_b64, parse_public_key, serialize_public_key, sha256, to_b64, verify_signature,
        SecretKey, COMPACT_SIG_LEN,
    };

    #[quickcheck]
    fn b64_roundtrip(bz: Vec<u8>) -> bool {
        from_b64(&to_b64(&bz)).unwrap() == bz
    }

    #[quickcheck]
    fn sign_and_verify(payload: Vec<u8>) -> Result<(), String> {
        let sk = SecretKey::random(&mut rand::thread_rng());
        let digest = sha256(&payload);

        let sig = sk.sign(&digest).map_err(|e| e.to_string())?;
        assert_eq!(sig.len(), COMPACT_SIG_LEN);

        verify_signature(&sk.public_key(), &digest, &sig).map_err(|e| e.to_string())
    }

    #[quickcheck]
    fn sign_and_tamper(payload: Vec<u8>) -> Result<(), String> {
        let sk = SecretKey::random(&mut rand::thread_rng());
        let other = SecretKey::random(&mut rand::thread_rng());
        let digest = sha256(&payload);

        let sig = sk.sign(&digest).map_err(|e| e.to_string())?;

        if verify_signature(&other.public_key(), &digest, &sig).is_ok() {
            return Err("verifying with a different key should fail".into());
        }
        Ok(())
    }

    #[test]
    fn public_key_roundtrip() {
        let sk = SecretKey::random(&mut rand::thread_rng());
        let pk = sk.public_key();
        let bz = serialize_public_key(&pk);
        assert_eq!(bz.len(), 33);
        assert_eq!(parse_public_key(&bz).unwrap(), pk);
    }
}
