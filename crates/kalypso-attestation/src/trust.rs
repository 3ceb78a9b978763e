use crate::error::{AttestationError, Result};
use crate::types::{AttestationDocument, Measurements, VerifiedEnclave};
use kalypso_crypto::{pubkey_to_address, validate_pubkey};
use kalypso_types::{AccessControl, Address, BlockInfo, EventBus, ImageId, MarketEvent, Role};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Checks that a document was produced by genuine enclave hardware.
///
/// Production deployments verify the vendor certificate chain here. The
/// image allow-list, key format and freshness checks live in
/// [`AttestationTrust`] and apply regardless of the authenticator.
pub trait DocumentAuthenticator: Send + Sync {
    fn authenticate(&self, doc: &AttestationDocument) -> Result<()>;
}

/// Accepts every structurally valid document.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockAuthenticator;

impl DocumentAuthenticator for MockAuthenticator {
    fn authenticate(&self, doc: &AttestationDocument) -> Result<()> {
        doc.measurements.validate()
    }
}

#[derive(Debug, Clone)]
struct VerifiedKey {
    image_id: ImageId,
    public_key: Vec<u8>,
}

/// Image allow-list and the set of enclave keys trusted under it.
///
/// Every mutation requires [`Role::KeyRegister`]; the direct key paths
/// also accept [`Role::Admin`].
pub struct AttestationTrust {
    images: RwLock<HashMap<ImageId, Measurements>>,
    verified_keys: RwLock<HashMap<Address, VerifiedKey>>,
    authenticator: Arc<dyn DocumentAuthenticator>,
    max_age_ms: u64,
    access: Arc<AccessControl>,
    events: Arc<EventBus>,
}

impl AttestationTrust {
    pub fn new(
        authenticator: Arc<dyn DocumentAuthenticator>,
        max_age_ms: u64,
        access: Arc<AccessControl>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            images: RwLock::new(HashMap::new()),
            verified_keys: RwLock::new(HashMap::new()),
            authenticator,
            max_age_ms,
            access,
            events,
        }
    }

    /// Returns the image id and whether it was newly added.
    pub async fn whitelist_image(&self, caller: Address, measurements: Measurements) -> Result<(ImageId, bool)> {
        self.access.ensure(Role::KeyRegister, caller).await?;
        measurements.validate()?;
        let image_id = measurements.image_id();
        let mut images = self.images.write().await;
        if images.contains_key(&image_id) {
            debug!(image_id = %image_id, "Image already whitelisted");
            return Ok((image_id, false));
        }
        images.insert(image_id, measurements);
        info!(image_id = %image_id, "🛡️ Enclave image whitelisted");
        self.events.emit(MarketEvent::ImageWhitelisted { image_id });
        Ok((image_id, true))
    }

    pub async fn revoke_image(&self, caller: Address, image_id: ImageId) -> Result<()> {
        self.access.ensure(Role::KeyRegister, caller).await?;
        let mut images = self.images.write().await;
        if images.remove(&image_id).is_none() {
            return Err(AttestationError::ImageNotWhitelisted(image_id));
        }
        info!(image_id = %image_id, "🚫 Enclave image revoked");
        self.events.emit(MarketEvent::ImageRevoked { image_id });
        Ok(())
    }

    pub async fn is_whitelisted(&self, image_id: &ImageId) -> bool {
        self.images.read().await.contains_key(image_id)
    }

    pub async fn measurements_of(&self, image_id: &ImageId) -> Option<Measurements> {
        self.images.read().await.get(image_id).cloned()
    }

    /// Verify a document without recording anything.
    pub async fn verify(&self, doc: &AttestationDocument, block: BlockInfo) -> Result<VerifiedEnclave> {
        self.authenticator.authenticate(doc)?;
        self.check_freshness(doc, block)?;

        let image_id = doc.measurements.image_id();
        if !self.is_whitelisted(&image_id).await {
            warn!(image_id = %image_id, "❌ Attestation for unknown image");
            return Err(AttestationError::ImageNotWhitelisted(image_id));
        }

        let address = pubkey_to_address(&doc.enclave_pubkey)?;
        Ok(VerifiedEnclave {
            image_id,
            public_key: doc.enclave_pubkey.clone(),
            address,
        })
    }

    /// Verify a document and trust its key from now on.
    pub async fn verify_enclave_key(
        &self,
        caller: Address,
        doc: &AttestationDocument,
        block: BlockInfo,
    ) -> Result<VerifiedEnclave> {
        self.access.ensure(Role::KeyRegister, caller).await?;
        let verified = self.verify(doc, block).await?;
        self.record_key(&verified).await;
        Ok(verified)
    }

    /// Trust a key for a whitelisted image without a fresh attestation.
    pub async fn whitelist_enclave_key(
        &self,
        caller: Address,
        pubkey: &[u8],
        image_id: ImageId,
    ) -> Result<Address> {
        self.access
            .ensure_any(&[Role::Admin, Role::KeyRegister], caller)
            .await?;
        if !self.is_whitelisted(&image_id).await {
            return Err(AttestationError::ImageNotWhitelisted(image_id));
        }
        validate_pubkey(pubkey)?;
        let address = pubkey_to_address(pubkey)?;
        self.record_key(&VerifiedEnclave {
            image_id,
            public_key: pubkey.to_vec(),
            address,
        })
        .await;
        Ok(address)
    }

    pub async fn revoke_enclave_key(&self, caller: Address, enclave: Address) -> Result<()> {
        self.access
            .ensure_any(&[Role::Admin, Role::KeyRegister], caller)
            .await?;
        let mut keys = self.verified_keys.write().await;
        if keys.remove(&enclave).is_none() {
            return Err(AttestationError::KeyNotVerified(enclave));
        }
        info!(enclave = %enclave, "🔓 Enclave key revoked");
        self.events.emit(MarketEvent::EnclaveKeyRevoked { enclave });
        Ok(())
    }

    /// Image a key was verified under, if that image is still trusted.
    pub async fn verified_image(&self, enclave: &Address) -> Option<ImageId> {
        let image_id = self.verified_keys.read().await.get(enclave)?.image_id;
        if self.is_whitelisted(&image_id).await {
            Some(image_id)
        } else {
            None
        }
    }

    pub async fn verified_pubkey(&self, enclave: &Address) -> Option<Vec<u8>> {
        self.verified_keys
            .read()
            .await
            .get(enclave)
            .map(|k| k.public_key.clone())
    }

    async fn record_key(&self, verified: &VerifiedEnclave) {
        let mut keys = self.verified_keys.write().await;
        keys.insert(
            verified.address,
            VerifiedKey {
                image_id: verified.image_id,
                public_key: verified.public_key.clone(),
            },
        );
        info!(
            enclave = %verified.address,
            image_id = %verified.image_id,
            "🔐 Enclave key verified"
        );
        self.events.emit(MarketEvent::EnclaveKeyVerified {
            enclave: verified.address,
            image_id: verified.image_id,
        });
    }

    fn check_freshness(&self, doc: &AttestationDocument, block: BlockInfo) -> Result<()> {
        let now_ms = block.timestamp.saturating_mul(1000);
        if doc.timestamp_ms > now_ms {
            return Err(AttestationError::AttestationFromFuture {
                timestamp_ms: doc.timestamp_ms,
                now_ms,
            });
        }
        let age_ms = now_ms - doc.timestamp_ms;
        if age_ms > self.max_age_ms {
            return Err(AttestationError::AttestationTooOld {
                age_ms,
                max_age_ms: self.max_age_ms,
            });
        }
        Ok(())
    }
}
