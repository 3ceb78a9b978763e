pub mod access;
pub mod address;
pub mod amount;
pub mod error;
pub mod events;

pub use access::{AccessControl, Role};
pub use address::{Address, H256};
pub use amount::{mul_div, TokenAmount, WEIGHT_SCALE};
pub use error::{AccessError, ErrorKind};
pub use events::{EventBus, MarketEvent};
#[cfg(any(test, feature = "test-utils"))]
pub use events::drain;

use serde::{Deserialize, Serialize};

pub type BidId = u64;
pub type MarketId = u64;
pub type ImageId = H256;
pub type FamilyId = H256;

/// Block context a transition is applied under.
///
/// Deadlines and expiries are block numbers, cooldowns and attestation
/// freshness are timestamps in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockInfo {
    pub number: u64,
    pub timestamp: u64,
}

impl BlockInfo {
    pub fn new(number: u64, timestamp: u64) -> Self {
        Self { number, timestamp }
    }

    /// Advance by `blocks` blocks at `secs_per_block`.
    pub fn advance(&self, blocks: u64, secs_per_block: u64) -> Self {
        Self {
            number: self.number + blocks,
            timestamp: self.timestamp + blocks * secs_per_block,
        }
    }
}
