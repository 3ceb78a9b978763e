use crate::error::{CryptoError, Result};
use crate::hash::keccak256;
use crate::keys::encode_verifying_key;
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use kalypso_types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SIGNATURE_LEN: usize = 65;

/// `r ‖ s ‖ v` secp256k1 signature. `v` is accepted as 0/1 or 27/28.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverableSignature(Vec<u8>);

impl RecoverableSignature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_LEN]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SIGNATURE_LEN {
            return Err(CryptoError::MalformedSignature(format!(
                "expected {} bytes, got {}",
                SIGNATURE_LEN,
                bytes.len()
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Recover the signer's 64-byte public key for `digest`.
    pub fn recover_pubkey(&self, digest: &H256) -> Result<Vec<u8>> {
        if self.0.len() != SIGNATURE_LEN {
            return Err(CryptoError::MalformedSignature("bad length".to_string()));
        }
        let signature = Signature::from_slice(&self.0[..64])
            .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
        let v = match self.0[64] {
            27 | 28 => self.0[64] - 27,
            v => v,
        };
        let recovery_id = RecoveryId::from_byte(v)
            .ok_or_else(|| CryptoError::MalformedSignature(format!("recovery id {}", v)))?;
        let key = VerifyingKey::recover_from_prehash(digest.as_bytes(), &signature, recovery_id)
            .map_err(|_| CryptoError::RecoveryFailed)?;
        Ok(encode_verifying_key(&key))
    }
}

impl fmt::Debug for RecoverableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "RecoverableSignature({}...)", &hex[..hex.len().min(8)])
    }
}

pub fn recover_signer(digest: &H256, signature: &RecoverableSignature) -> Result<Address> {
    let pubkey = signature.recover_pubkey(digest)?;
    Ok(Address::from_digest(keccak256(&pubkey).as_bytes()))
}
