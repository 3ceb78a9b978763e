use kalypso_types::{Address, ErrorKind, TokenAmount};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Insufficient balance of token {token} for {account}: has {available}, needs {needed}")]
    InsufficientBalance {
        token: Address,
        account: Address,
        available: TokenAmount,
        needed: TokenAmount,
    },

    #[error("Balance overflow for {account}")]
    Overflow { account: Address },

    #[error("Cannot transfer to the same account {0}")]
    SelfTransfer(Address),

    #[error("Zero address is not a valid account")]
    ZeroAddress,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InsufficientBalance { .. } => ErrorKind::Capacity,
            LedgerError::SelfTransfer(_) | LedgerError::ZeroAddress => ErrorKind::Validation,
            LedgerError::Overflow { .. } | LedgerError::Storage(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
