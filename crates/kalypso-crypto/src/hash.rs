use kalypso_types::H256;
use sha3::{Digest, Keccak256};

pub fn keccak256(data: &[u8]) -> H256 {
    let digest = Keccak256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    H256::from_bytes(out)
}

pub fn keccak256_concat(parts: &[&[u8]]) -> H256 {
    let mut hasher = Keccak::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// Incremental keccak-256 with helpers for the packed integer encodings
/// used in submission digests.
pub struct Keccak(Keccak256);

impl Default for Keccak {
    fn default() -> Self {
        Self::new()
    }
}

impl Keccak {
    pub fn new() -> Self {
        Self(Keccak256::new())
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.0.update(data);
        self
    }

    pub fn update_u32(&mut self, value: u32) -> &mut Self {
        self.update(&value.to_be_bytes())
    }

    pub fn update_u64(&mut self, value: u64) -> &mut Self {
        self.update(&value.to_be_bytes())
    }

    pub fn update_u128(&mut self, value: u128) -> &mut Self {
        self.update(&value.to_be_bytes())
    }

    pub fn finalize(self) -> H256 {
        let digest = self.0.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        H256::from_bytes(out)
    }
}
