use crate::error::{AttestationError, Result};
use kalypso_crypto::{keccak256_concat, pubkey_to_address};
use kalypso_types::{Address, ImageId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of each platform configuration register (SHA-384 output).
pub const PCR_LEN: usize = 48;

/// The PCR triple identifying an enclave image.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Measurements {
    pub pcr0: Vec<u8>,
    pub pcr1: Vec<u8>,
    pub pcr2: Vec<u8>,
}

impl Measurements {
    pub fn new(pcr0: Vec<u8>, pcr1: Vec<u8>, pcr2: Vec<u8>) -> Result<Self> {
        let m = Self { pcr0, pcr1, pcr2 };
        m.validate()?;
        Ok(m)
    }

    /// Deterministic measurements derived from a label, for mock enclaves.
    pub fn from_label(label: &str) -> Self {
        let expand = |register: u8| {
            let seed = keccak256_concat(&[label.as_bytes(), [register].as_slice()]);
            let tail = keccak256_concat(&[seed.as_bytes().as_slice()]);
            let mut out = seed.as_bytes().to_vec();
            out.extend_from_slice(&tail.as_bytes()[..PCR_LEN - 32]);
            out
        };
        Self {
            pcr0: expand(0),
            pcr1: expand(1),
            pcr2: expand(2),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (index, pcr) in [&self.pcr0, &self.pcr1, &self.pcr2].iter().enumerate() {
            if pcr.len() != PCR_LEN {
                return Err(AttestationError::InvalidMeasurements(format!(
                    "pcr{} has {} bytes, expected {}",
                    index,
                    pcr.len(),
                    PCR_LEN
                )));
            }
        }
        Ok(())
    }

    /// `keccak256(pcr0 ‖ pcr1 ‖ pcr2)`
    pub fn image_id(&self) -> ImageId {
        keccak256_concat(&[
            self.pcr0.as_slice(),
            self.pcr1.as_slice(),
            self.pcr2.as_slice(),
        ])
    }
}

impl fmt::Debug for Measurements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Measurements(image={})", self.image_id())
    }
}

/// Attestation document binding an enclave public key to its measurements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationDocument {
    pub enclave_pubkey: Vec<u8>,
    pub measurements: Measurements,
    pub timestamp_ms: u64,
}

impl AttestationDocument {
    pub fn new(enclave_pubkey: Vec<u8>, measurements: Measurements, timestamp_ms: u64) -> Self {
        Self {
            enclave_pubkey,
            measurements,
            timestamp_ms,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| AttestationError::MalformedDocument(e.to_string()))
    }

    /// Enclave key and its address, without checking image trust.
    pub fn pubkey_and_address(&self) -> Result<(Vec<u8>, Address)> {
        let address = pubkey_to_address(&self.enclave_pubkey)?;
        Ok((self.enclave_pubkey.clone(), address))
    }
}

/// Result of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedEnclave {
    pub image_id: ImageId,
    pub public_key: Vec<u8>,
    pub address: Address,
}
