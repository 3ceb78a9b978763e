use crate::access::Role;
use crate::address::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification every crate error maps onto, so callers can
/// branch on the outcome without matching concrete variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Missing role or capability. Never retried automatically.
    Authorization,
    /// Malformed or inconsistent input.
    Validation,
    /// Compute, parallelism or stake insufficient right now.
    Capacity,
    /// Duplicate, stale or throttled submission.
    Replay,
    /// Proof or signature rejected.
    Proof,
    /// Storage or arithmetic failure inside the ledger.
    Internal,
}

impl ErrorKind {
    /// Capacity failures are routine and may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Capacity)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("Account {account} is missing role {role:?}")]
    MissingRole { role: Role, account: Address },

    #[error("Zero address cannot hold roles")]
    ZeroAddress,
}

impl AccessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AccessError::MissingRole { .. } => ErrorKind::Authorization,
            AccessError::ZeroAddress => ErrorKind::Validation,
        }
    }
}
