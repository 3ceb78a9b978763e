use kalypso_crypto::CryptoError;
use kalypso_types::{AccessError, Address, ErrorKind, FamilyId, ImageId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttestationError {
    #[error("Image {0} is not whitelisted")]
    ImageNotWhitelisted(ImageId),

    #[error("Invalid enclave key: {0}")]
    InvalidEnclaveKey(String),

    #[error("Invalid measurements: {0}")]
    InvalidMeasurements(String),

    #[error("Malformed attestation document: {0}")]
    MalformedDocument(String),

    #[error("Attestation authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Attestation too old: age {age_ms}ms exceeds {max_age_ms}ms")]
    AttestationTooOld { age_ms: u64, max_age_ms: u64 },

    #[error("Attestation timestamp {timestamp_ms} is ahead of block time {now_ms}")]
    AttestationFromFuture { timestamp_ms: u64, now_ms: u64 },

    #[error("Attested key does not match the submitted public key")]
    AttestationKeyMismatch,

    #[error("Image {image_id} already in family {family_id}")]
    ImageAlreadyInFamily {
        image_id: ImageId,
        family_id: FamilyId,
    },

    #[error("AttestationAutherImageNotInFamily: image {image_id} not in family {family_id}")]
    ImageNotInFamily {
        image_id: ImageId,
        family_id: FamilyId,
    },

    #[error("CannotRemoveDefaultImageFromMarket: image {image_id} is the default of family {family_id}")]
    CannotRemoveDefaultImageFromMarket {
        image_id: ImageId,
        family_id: FamilyId,
    },

    #[error("AttestationAutherKeyNotVerified: enclave {0} has no verified key")]
    KeyNotVerified(Address),

    #[error("No key registered for owner {owner} slot {slot}")]
    KeyNotFound { owner: Address, slot: u64 },

    #[error("Zero address is not a valid key owner")]
    ZeroAddress,

    #[error(transparent)]
    Access(#[from] AccessError),
}

impl AttestationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AttestationError::Access(e) => e.kind(),
            AttestationError::AttestationTooOld { .. } => ErrorKind::Replay,
            AttestationError::AuthenticationFailed(_)
            | AttestationError::ImageNotInFamily { .. }
            | AttestationError::KeyNotVerified(_)
            | AttestationError::ImageNotWhitelisted(_) => ErrorKind::Authorization,
            AttestationError::InvalidEnclaveKey(_)
            | AttestationError::InvalidMeasurements(_)
            | AttestationError::MalformedDocument(_)
            | AttestationError::AttestationFromFuture { .. }
            | AttestationError::AttestationKeyMismatch
            | AttestationError::ImageAlreadyInFamily { .. }
            | AttestationError::CannotRemoveDefaultImageFromMarket { .. }
            | AttestationError::KeyNotFound { .. }
            | AttestationError::ZeroAddress => ErrorKind::Validation,
        }
    }
}

impl From<CryptoError> for AttestationError {
    fn from(e: CryptoError) -> Self {
        AttestationError::InvalidEnclaveKey(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AttestationError>;
