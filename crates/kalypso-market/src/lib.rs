//! Proof marketplace.
//!
//! - [`ProverRegistry`]: prover compute accounting and market membership
//! - [`ProofMarketplace`]: the bid → task → settlement state machine
//! - [`ProofVerifier`]: the per-market proof checking capability

pub mod error;
pub mod marketplace;
pub mod metrics;
pub mod prover_registry;
pub mod types;
pub mod verifier;

pub use error::{MarketError, Result};
pub use marketplace::{invalid_inputs_digest, ivs_key_slot, MarketplaceConfig, ProofMarketplace};
pub use metrics::MarketMetrics;
pub use prover_registry::{
    ProverAccount, ProverInfoPerMarket, ProverMarketState, ProverRegistry, ProverRegistryConfig,
};
pub use types::{Bid, BidState, MarketInfo, MarketParams, SecretType, TaskInfo};
pub use verifier::{MockVerifier, ProofVerifier, VerifierMode};
