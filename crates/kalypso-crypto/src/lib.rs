pub mod error;
pub mod hash;
pub mod keys;
pub mod signature;

pub use error::{CryptoError, Result};
pub use hash::{keccak256, keccak256_concat, Keccak};
pub use keys::{pubkey_to_address, validate_pubkey, EnclaveKeypair, PUBKEY_LEN};
pub use signature::{recover_signer, RecoverableSignature, SIGNATURE_LEN};
