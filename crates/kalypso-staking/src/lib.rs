//! Collateral custody for provers.
//!
//! Pools implement [`StakingPool`]; the [`StakingManager`] is the only
//! caller allowed to lock, unlock or slash them and splits each request
//! across the enabled pools by weight.

pub mod error;
pub mod manager;
pub mod native;
pub mod pool;
pub mod symbiotic;

pub use error::{Result, StakingError};
pub use manager::{PoolConfig, StakingManager};
pub use native::{NativeStaking, NativeStakingConfig, StakeBalance, WithdrawalRequest};
pub use pool::{LockLeg, LockRequest, SlashedTask, StakeEntry, StakingPool};
pub use symbiotic::{
    BatchKind, BatchStatus, ConfirmedTimestamp, SlashResult, SlashResultSubmission,
    SnapshotSubmission, SymbioticConfig, SymbioticStaking, VaultSnapshot,
};
