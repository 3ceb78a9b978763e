use kalypso_attestation::AttestationError;
use kalypso_crypto::CryptoError;
use kalypso_ledger::LedgerError;
use kalypso_types::{AccessError, Address, BidId, ErrorKind, TokenAmount};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StakingError {
    #[error("InsufficientStakeToLock: pool {pool} prover {prover} requires {required}, has {available}")]
    InsufficientStakeToLock {
        pool: String,
        prover: Address,
        required: TokenAmount,
        available: TokenAmount,
    },

    #[error("Insufficient free stake for {prover} in token {token}: requested {requested}, free {available}")]
    InsufficientStake {
        prover: Address,
        token: Address,
        requested: TokenAmount,
        available: TokenAmount,
    },

    #[error("Token {0} is not a supported stake token")]
    UnsupportedToken(Address),

    #[error("Amount must be non-zero")]
    ZeroAmount,

    #[error("Zero address not allowed")]
    ZeroAddress,

    #[error("Invalid weight {0}")]
    InvalidWeight(u128),

    #[error("Stake already locked for bid {0}")]
    LockAlreadyExists(BidId),

    #[error("No stake locked for bid {0}")]
    NoLockForBid(BidId),

    #[error("Lock for bid {bid_id} belongs to {expected}, not {actual}")]
    LockProverMismatch {
        bid_id: BidId,
        expected: Address,
        actual: Address,
    },

    #[error("Withdrawal not claimable before {claimable_at} (now {now})")]
    WithdrawalNotReady { claimable_at: u64, now: u64 },

    #[error("No pending withdrawal for {0}")]
    NoWithdrawalPending(Address),

    #[error("No claimable rewards for {0}")]
    NoRewards(Address),

    #[error("Unknown staking pool {0}")]
    UnknownPool(String),

    #[error("Staking pool {0} already registered")]
    DuplicatePool(String),

    #[error("Part index {idx} out of range for {num_of_txs} parts")]
    InvalidPartIndex { idx: u32, num_of_txs: u32 },

    #[error("Batch expects {expected} parts, submission says {actual}")]
    NumOfTxsMismatch { expected: u32, actual: u32 },

    #[error("Capture timestamp {capture_timestamp} is ahead of block time {now}")]
    FutureCaptureTimestamp { capture_timestamp: u64, now: u64 },

    #[error("Capture timestamp {capture_timestamp} does not advance past {latest}")]
    StaleCaptureTimestamp { capture_timestamp: u64, latest: u64 },

    #[error("Cooldown not elapsed: capture timestamp {capture_timestamp} before {earliest}")]
    CooldownNotElapsed { capture_timestamp: u64, earliest: u64 },

    #[error("Part {idx} of batch {capture_timestamp} already submitted")]
    DuplicatePart { capture_timestamp: u64, idx: u32 },

    #[error("Batch transmitter is {expected}, submission from {actual}")]
    TransmitterMismatch { expected: Address, actual: Address },

    #[error("Invalid entry {index}: {reason}")]
    InvalidEntry { index: usize, reason: String },

    #[error("Bid {0} is not slashable")]
    NotSlashable(BidId),

    #[error("Lock for bid {0} is awaiting an external slash result")]
    AwaitingExternalSlash(BidId),

    #[error("Snapshot stake {snapshot} for {prover} token {token} is below locked {locked}")]
    SnapshotBelowLockedStake {
        prover: Address,
        token: Address,
        locked: TokenAmount,
        snapshot: TokenAmount,
    },

    #[error("Arithmetic overflow")]
    Overflow,

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Attestation(#[from] AttestationError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl StakingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StakingError::Access(e) => e.kind(),
            StakingError::Attestation(e) => e.kind(),
            StakingError::Ledger(e) => e.kind(),
            StakingError::Crypto(e) => e.kind(),
            StakingError::InsufficientStakeToLock { .. }
            | StakingError::InsufficientStake { .. }
            | StakingError::WithdrawalNotReady { .. } => ErrorKind::Capacity,
            StakingError::StaleCaptureTimestamp { .. }
            | StakingError::CooldownNotElapsed { .. }
            | StakingError::DuplicatePart { .. }
            | StakingError::NotSlashable(_)
            | StakingError::AwaitingExternalSlash(_)
            | StakingError::SnapshotBelowLockedStake { .. } => ErrorKind::Replay,
            StakingError::TransmitterMismatch { .. } => ErrorKind::Authorization,
            StakingError::Overflow => ErrorKind::Internal,
            StakingError::UnsupportedToken(_)
            | StakingError::ZeroAmount
            | StakingError::ZeroAddress
            | StakingError::InvalidWeight(_)
            | StakingError::LockAlreadyExists(_)
            | StakingError::NoLockForBid(_)
            | StakingError::LockProverMismatch { .. }
            | StakingError::NoWithdrawalPending(_)
            | StakingError::NoRewards(_)
            | StakingError::UnknownPool(_)
            | StakingError::DuplicatePool(_)
            | StakingError::InvalidPartIndex { .. }
            | StakingError::NumOfTxsMismatch { .. }
            | StakingError::FutureCaptureTimestamp { .. }
            | StakingError::InvalidEntry { .. } => ErrorKind::Validation,
        }
    }
}

pub type Result<T> = std::result::Result<T, StakingError>;
