//! Token balances for every account the marketplace touches.
//!
//! Bid rewards sit in the marketplace's escrow account, staked collateral in
//! each pool's account, and payouts move between them through
//! [`TokenLedger::transfer`].

pub mod error;
pub mod ledger;
pub mod storage;

pub use error::{LedgerError, Result};
pub use ledger::TokenLedger;
pub use storage::{LedgerStorage, MemoryStorage, TransferRecord};
