use kalypso_types::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid secret key")]
    InvalidSecretKey,

    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    #[error("Signature recovery failed")]
    RecoveryFailed,

    #[error("Signing failed: {0}")]
    SigningFailed(String),
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CryptoError::InvalidPublicKey(_) | CryptoError::InvalidSecretKey => {
                ErrorKind::Validation
            }
            CryptoError::MalformedSignature(_) | CryptoError::RecoveryFailed => ErrorKind::Proof,
            CryptoError::SigningFailed(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, CryptoError>;
