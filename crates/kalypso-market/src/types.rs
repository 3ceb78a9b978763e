use crate::verifier::ProofVerifier;
use kalypso_attestation::Measurements;
use kalypso_types::{Address, FamilyId, ImageId, MarketId, TokenAmount};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A request for a proof. Block heights bound its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub market_id: MarketId,
    pub reward: TokenAmount,
    /// Last block at which the bid can be assigned.
    pub expiry: u64,
    /// Blocks a prover gets after assignment.
    pub time_for_proof_generation: u64,
    /// Last block by which a proof must land.
    pub deadline: u64,
    pub refund_address: Address,
    pub prover_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecretType {
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BidState {
    Created,
    /// Created but past expiry without assignment.
    Unassigned,
    Assigned,
    Completed,
    DeadlineCrossed,
    InvalidInputs,
    Cancelled,
}

impl BidState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BidState::Completed
                | BidState::DeadlineCrossed
                | BidState::InvalidInputs
                | BidState::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub requester: Address,
    pub prover: Address,
    pub fee_paid: TokenAmount,
    pub deadline: u64,
}

pub struct MarketParams {
    pub verifier: Arc<dyn ProofVerifier>,
    pub prover_image: Measurements,
    pub ivs_image: Measurements,
    /// Stake locked per assigned task and forfeited on a missed deadline.
    pub slashing_penalty: TokenAmount,
    pub metadata: Vec<u8>,
}

impl fmt::Debug for MarketParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketParams")
            .field("prover_image", &self.prover_image.image_id())
            .field("ivs_image", &self.ivs_image.image_id())
            .field("slashing_penalty", &self.slashing_penalty)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketInfo {
    pub market_id: MarketId,
    pub creator: Address,
    pub prover_image_id: ImageId,
    pub ivs_image_id: ImageId,
    pub prover_family: FamilyId,
    pub ivs_family: FamilyId,
    pub slashing_penalty: TokenAmount,
    pub metadata: Vec<u8>,
}
