use crate::types::BidState;
use kalypso_attestation::AttestationError;
use kalypso_crypto::CryptoError;
use kalypso_ledger::LedgerError;
use kalypso_staking::StakingError;
use kalypso_types::{AccessError, Address, BidId, ErrorKind, MarketId, TokenAmount};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarketError {
    #[error("Market {0} not found")]
    MarketNotFound(MarketId),

    #[error("Bid {0} not found")]
    BidNotFound(BidId),

    #[error("OnlyMarketCreator: {caller} did not create market {market_id}")]
    OnlyMarketCreator { market_id: MarketId, caller: Address },

    #[error("Only the requester of bid {bid_id} may do this, not {caller}")]
    OnlyRequester { bid_id: BidId, caller: Address },

    #[error("Zero address not allowed")]
    ZeroAddress,

    #[error("Bid reward must be non-zero")]
    ZeroReward,

    #[error("Bid prover data is empty")]
    EmptyProverData,

    #[error("Invalid bid: {0}")]
    InvalidBid(String),

    #[error("Inputs rejected by the market verifier")]
    InputsRejected,

    #[error("Bid {bid_id} is {state:?}")]
    InvalidBidState { bid_id: BidId, state: BidState },

    #[error("Prover {0} is not registered")]
    ProverNotRegistered(Address),

    #[error("Prover {0} is already registered")]
    ProverAlreadyRegistered(Address),

    #[error("Prover {prover} is not active in market {market_id}")]
    ProverNotActive { prover: Address, market_id: MarketId },

    #[error("Prover {prover} already joined market {market_id}")]
    ProverAlreadyInMarket { prover: Address, market_id: MarketId },

    #[error("InvalidProverStatePerMarket: prover {prover} market {market_id}")]
    InvalidProverStatePerMarket { prover: Address, market_id: MarketId },

    #[error("CannotLeaveMarketWithActiveRequest: prover {prover} has {active} requests in market {market_id}")]
    CannotLeaveMarketWithActiveRequest {
        prover: Address,
        market_id: MarketId,
        active: u64,
    },

    #[error("Prover {prover} is still in {markets} markets")]
    CannotDeregisterWithActiveMarkets { prover: Address, markets: u64 },

    #[error("Invalid compute: {0}")]
    InvalidCompute(String),

    #[error("Utilization {0} out of range")]
    InvalidUtilization(u128),

    #[error("No compute reduction requested by {0}")]
    ReductionNotRequested(Address),

    #[error("Compute reduction available from block {ready_at} (now {now})")]
    ReductionTooEarly { ready_at: u64, now: u64 },

    #[error("Reward {reward} is below the proof generation cost {cost}")]
    RewardBelowProofCost { reward: TokenAmount, cost: TokenAmount },

    #[error("Task deadline {task_deadline} exceeds bid deadline {bid_deadline}")]
    DeadlineTooShort { task_deadline: u64, bid_deadline: u64 },

    #[error("Bid {bid_id} expired at block {expiry}")]
    BidExpired { bid_id: BidId, expiry: u64 },

    #[error("Task {bid_id} deadline {deadline} has passed")]
    DeadlinePassed { bid_id: BidId, deadline: u64 },

    #[error("Task {bid_id} deadline {deadline} not reached")]
    DeadlineNotReached { bid_id: BidId, deadline: u64 },

    #[error("InsufficientGeneratorComputeAvailable: prover {prover} needs {required}, has {available}")]
    InsufficientGeneratorComputeAvailable {
        prover: Address,
        required: u128,
        available: u128,
    },

    #[error("MaxParallelRequestsPerMarketExceeded: prover {prover} market {market_id} limit {limit}")]
    MaxParallelRequestsPerMarketExceeded {
        prover: Address,
        market_id: MarketId,
        limit: u64,
    },

    #[error("InvalidProof: bid {bid_id}")]
    InvalidProof { bid_id: BidId },

    #[error("Arithmetic overflow")]
    Overflow,

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Attestation(#[from] AttestationError),

    #[error(transparent)]
    Staking(#[from] StakingError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl MarketError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MarketError::Access(e) => e.kind(),
            MarketError::Attestation(e) => e.kind(),
            MarketError::Staking(e) => e.kind(),
            MarketError::Ledger(e) => e.kind(),
            MarketError::Crypto(e) => e.kind(),
            MarketError::OnlyMarketCreator { .. } | MarketError::OnlyRequester { .. } => {
                ErrorKind::Authorization
            }
            MarketError::InsufficientGeneratorComputeAvailable { .. }
            | MarketError::MaxParallelRequestsPerMarketExceeded { .. } => ErrorKind::Capacity,
            MarketError::InvalidProof { .. } => ErrorKind::Proof,
            MarketError::Overflow => ErrorKind::Internal,
            _ => ErrorKind::Validation,
        }
    }
}

pub type Result<T> = std::result::Result<T, MarketError>;
