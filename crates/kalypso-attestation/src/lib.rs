//! Enclave attestation trust model.
//!
//! [`AttestationTrust`] knows which enclave images are trusted and which
//! enclave keys have been verified against them. [`EntityKeyRegistry`]
//! groups images into families and binds verified keys to
//! `(owner, slot)` pairs on behalf of the marketplace.

pub mod error;
pub mod registry;
pub mod trust;
pub mod types;

pub use error::{AttestationError, Result};
pub use registry::{bridge_family, ivs_family, prover_family, EntityKeyRegistry, KeySlot};
pub use trust::{AttestationTrust, DocumentAuthenticator, MockAuthenticator};
pub use types::{AttestationDocument, Measurements, VerifiedEnclave, PCR_LEN};
