//! Enclave public keys and address derivation.
//!
//! Keys travel as 64-byte uncompressed secp256k1 points without the SEC1
//! `0x04` prefix. The owning address is `last20(keccak256(pubkey))`.

use crate::error::{CryptoError, Result};
use crate::hash::keccak256;
use crate::signature::RecoverableSignature;
use k256::ecdsa::{SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use kalypso_types::{Address, H256};
use std::fmt;

pub const PUBKEY_LEN: usize = 64;

/// Check length, non-zero content and that the point lies on the curve.
pub fn validate_pubkey(pubkey: &[u8]) -> Result<VerifyingKey> {
    if pubkey.len() != PUBKEY_LEN {
        return Err(CryptoError::InvalidPublicKey(format!(
            "expected {} bytes, got {}",
            PUBKEY_LEN,
            pubkey.len()
        )));
    }
    if pubkey.iter().all(|b| *b == 0) {
        return Err(CryptoError::InvalidPublicKey("zero key".to_string()));
    }
    let mut sec1 = Vec::with_capacity(PUBKEY_LEN + 1);
    sec1.push(0x04);
    sec1.extend_from_slice(pubkey);
    VerifyingKey::from_sec1_bytes(&sec1)
        .map_err(|_| CryptoError::InvalidPublicKey("not a curve point".to_string()))
}

pub fn pubkey_to_address(pubkey: &[u8]) -> Result<Address> {
    validate_pubkey(pubkey)?;
    Ok(Address::from_digest(keccak256(pubkey).as_bytes()))
}

pub(crate) fn encode_verifying_key(key: &VerifyingKey) -> Vec<u8> {
    let point = key.as_affine().to_encoded_point(false);
    point.as_bytes()[1..].to_vec()
}

/// secp256k1 keypair held by an enclave.
#[derive(Clone)]
pub struct EnclaveKeypair {
    signing: SigningKey,
}

impl EnclaveKeypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_secret(secret: &[u8; 32]) -> Result<Self> {
        let signing = SigningKey::from_slice(secret).map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self { signing })
    }

    /// Uncompressed public key, 64 bytes.
    pub fn public_key(&self) -> Vec<u8> {
        encode_verifying_key(self.signing.verifying_key())
    }

    pub fn address(&self) -> Address {
        Address::from_digest(keccak256(&self.public_key()).as_bytes())
    }

    pub fn sign_digest(&self, digest: &H256) -> Result<RecoverableSignature> {
        let (signature, recovery_id) = self
            .signing
            .sign_prehash_recoverable(digest.as_bytes())
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&signature.to_bytes());
        bytes[64] = recovery_id.to_byte();
        Ok(RecoverableSignature::from_bytes(bytes))
    }
}

impl fmt::Debug for EnclaveKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnclaveKeypair({})", self.address())
    }
}
