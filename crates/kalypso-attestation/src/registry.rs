//! Per-(owner, slot) enclave key registry with image families.
//!
//! A slot is the market id for prover and IVS keys. Families collect the
//! images trusted for one role in one market; each market family carries a
//! protected default image that can never be removed.

use crate::error::{AttestationError, Result};
use crate::trust::AttestationTrust;
use crate::types::{AttestationDocument, Measurements};
use kalypso_crypto::{keccak256_concat, pubkey_to_address};
use kalypso_types::{
    AccessControl, Address, BlockInfo, EventBus, FamilyId, ImageId, MarketEvent, MarketId, Role,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub fn prover_family(market_id: MarketId) -> FamilyId {
    keccak256_concat(&[b"gen".as_slice(), market_id.to_be_bytes().as_slice()])
}

pub fn ivs_family(market_id: MarketId) -> FamilyId {
    keccak256_concat(&[b"ivs".as_slice(), market_id.to_be_bytes().as_slice()])
}

/// Family id for a named set of bridge (transmitter) enclaves.
pub fn bridge_family(name: &str) -> FamilyId {
    keccak256_concat(&[b"bridge".as_slice(), name.as_bytes()])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySlot {
    pub pubkey: Vec<u8>,
    pub enclave: Address,
    pub image_id: ImageId,
}

#[derive(Default)]
struct RegistryState {
    families: HashMap<FamilyId, HashSet<ImageId>>,
    defaults: HashMap<FamilyId, ImageId>,
    keys: HashMap<(Address, u64), KeySlot>,
}

pub struct EntityKeyRegistry {
    trust: Arc<AttestationTrust>,
    access: Arc<AccessControl>,
    events: Arc<EventBus>,
    state: RwLock<RegistryState>,
}

impl EntityKeyRegistry {
    pub fn new(trust: Arc<AttestationTrust>, access: Arc<AccessControl>, events: Arc<EventBus>) -> Self {
        Self {
            trust,
            access,
            events,
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn trust(&self) -> &Arc<AttestationTrust> {
        &self.trust
    }

    /// Whitelist the image and add it to `family_id`.
    pub async fn whitelist_image_using_pcrs(
        &self,
        caller: Address,
        family_id: FamilyId,
        measurements: Measurements,
    ) -> Result<ImageId> {
        self.access.ensure(Role::KeyRegister, caller).await?;
        measurements.validate()?;
        let image_id = measurements.image_id();

        let mut state = self.state.write().await;
        if state
            .families
            .get(&family_id)
            .map(|f| f.contains(&image_id))
            .unwrap_or(false)
        {
            return Err(AttestationError::ImageAlreadyInFamily {
                image_id,
                family_id,
            });
        }
        self.trust.whitelist_image(caller, measurements).await?;
        state.families.entry(family_id).or_default().insert(image_id);

        info!(image_id = %image_id, family_id = %family_id, "➕ Image added to family");
        self.events.emit(MarketEvent::ImageAddedToFamily {
            image_id,
            family_id,
        });
        Ok(image_id)
    }

    /// Mark a family member as the family's default. Defaults are permanent.
    pub async fn protect_default_image(
        &self,
        caller: Address,
        family_id: FamilyId,
        image_id: ImageId,
    ) -> Result<()> {
        self.access.ensure(Role::KeyRegister, caller).await?;
        let mut state = self.state.write().await;
        if !state
            .families
            .get(&family_id)
            .map(|f| f.contains(&image_id))
            .unwrap_or(false)
        {
            return Err(AttestationError::ImageNotInFamily {
                image_id,
                family_id,
            });
        }
        state.defaults.insert(family_id, image_id);
        debug!(image_id = %image_id, family_id = %family_id, "Default image protected");
        Ok(())
    }

    pub async fn remove_image_from_family(
        &self,
        caller: Address,
        family_id: FamilyId,
        measurements: &Measurements,
    ) -> Result<ImageId> {
        let image_id = measurements.image_id();
        {
            let state = self.state.read().await;
            if state.defaults.get(&family_id) == Some(&image_id) {
                return Err(AttestationError::CannotRemoveDefaultImageFromMarket {
                    image_id,
                    family_id,
                });
            }
        }
        self.access.ensure(Role::KeyRegister, caller).await?;

        let mut state = self.state.write().await;
        let removed = state
            .families
            .get_mut(&family_id)
            .map(|f| f.remove(&image_id))
            .unwrap_or(false);
        if !removed {
            return Err(AttestationError::ImageNotInFamily {
                image_id,
                family_id,
            });
        }

        info!(image_id = %image_id, family_id = %family_id, "➖ Image removed from family");
        self.events.emit(MarketEvent::ImageRemovedFromFamily {
            image_id,
            family_id,
        });
        Ok(image_id)
    }

    pub async fn is_image_in_family(&self, image_id: &ImageId, family_id: &FamilyId) -> bool {
        let state = self.state.read().await;
        state
            .families
            .get(family_id)
            .map(|f| f.contains(image_id))
            .unwrap_or(false)
    }

    pub async fn default_image(&self, family_id: &FamilyId) -> Option<ImageId> {
        self.state.read().await.defaults.get(family_id).copied()
    }

    pub async fn family_images(&self, family_id: &FamilyId) -> Vec<ImageId> {
        let state = self.state.read().await;
        let mut images: Vec<ImageId> = state
            .families
            .get(family_id)
            .map(|f| f.iter().copied().collect())
            .unwrap_or_default();
        images.sort();
        images
    }

    /// Bind `raw_pubkey` to `(owner, slot)` after verifying the attestation
    /// for it against `family_id`. Overwrites an existing slot.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_pubkey(
        &self,
        caller: Address,
        owner: Address,
        slot: u64,
        raw_pubkey: &[u8],
        attestation: &AttestationDocument,
        family_id: FamilyId,
        block: BlockInfo,
    ) -> Result<Address> {
        self.access.ensure(Role::KeyRegister, caller).await?;
        if owner.is_zero() {
            return Err(AttestationError::ZeroAddress);
        }
        let enclave = pubkey_to_address(raw_pubkey)?;
        if attestation.enclave_pubkey != raw_pubkey {
            return Err(AttestationError::AttestationKeyMismatch);
        }

        let verified = self.trust.verify(attestation, block).await?;
        if !self.is_image_in_family(&verified.image_id, &family_id).await {
            return Err(AttestationError::ImageNotInFamily {
                image_id: verified.image_id,
                family_id,
            });
        }
        self.trust.verify_enclave_key(caller, attestation, block).await?;

        let mut state = self.state.write().await;
        let previous = state.keys.insert(
            (owner, slot),
            KeySlot {
                pubkey: raw_pubkey.to_vec(),
                enclave,
                image_id: verified.image_id,
            },
        );
        let replaced = previous.is_some();
        if let Some(old) = previous.filter(|old| old.enclave != enclave) {
            self.release_enclave(caller, &state, old.enclave).await?;
        }

        info!(
            owner = %owner,
            slot,
            enclave = %enclave,
            image_id = %verified.image_id,
            replaced,
            "🔑 Enclave key updated"
        );
        self.events.emit(MarketEvent::KeyUpdated {
            owner,
            slot,
            enclave,
        });
        Ok(enclave)
    }

    /// Unbind `(owner, slot)`. The enclave stops being trusted unless
    /// another slot still binds it.
    pub async fn remove_pubkey(&self, caller: Address, owner: Address, slot: u64) -> Result<()> {
        self.access.ensure(Role::KeyRegister, caller).await?;
        let mut state = self.state.write().await;
        let removed = state
            .keys
            .remove(&(owner, slot))
            .ok_or(AttestationError::KeyNotFound { owner, slot })?;
        self.release_enclave(caller, &state, removed.enclave).await?;
        info!(owner = %owner, slot, enclave = %removed.enclave, "🗑️ Enclave key removed");
        self.events.emit(MarketEvent::KeyRemoved { owner, slot });
        Ok(())
    }

    async fn release_enclave(&self, caller: Address, state: &RegistryState, enclave: Address) -> Result<()> {
        if state.keys.values().any(|k| k.enclave == enclave) {
            debug!(enclave = %enclave, "Enclave still bound to another slot");
            return Ok(());
        }
        match self.trust.revoke_enclave_key(caller, enclave).await {
            Ok(()) | Err(AttestationError::KeyNotVerified(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn key_slot(&self, owner: &Address, slot: u64) -> Option<KeySlot> {
        self.state.read().await.keys.get(&(*owner, slot)).cloned()
    }

    pub async fn pubkey_of(&self, owner: &Address, slot: u64) -> Option<Vec<u8>> {
        self.key_slot(owner, slot).await.map(|k| k.pubkey)
    }

    pub async fn enclave_address_of(&self, owner: &Address, slot: u64) -> Option<Address> {
        self.key_slot(owner, slot).await.map(|k| k.enclave)
    }

    /// Trust a bridge enclave key directly. The image must already belong
    /// to `family_id`.
    pub async fn whitelist_bridge_key(
        &self,
        caller: Address,
        family_id: FamilyId,
        pubkey: &[u8],
        image_id: ImageId,
    ) -> Result<Address> {
        self.access
            .ensure_any(&[Role::Admin, Role::KeyRegister], caller)
            .await?;
        if !self.is_image_in_family(&image_id, &family_id).await {
            return Err(AttestationError::ImageNotInFamily {
                image_id,
                family_id,
            });
        }
        self.trust.whitelist_enclave_key(caller, pubkey, image_id).await
    }

    pub async fn revoke_enclave_key(&self, caller: Address, enclave: Address) -> Result<()> {
        self.access
            .ensure_any(&[Role::Admin, Role::KeyRegister], caller)
            .await?;
        self.trust.revoke_enclave_key(caller, enclave).await
    }

    pub async fn allow_only_verified(&self, enclave: &Address) -> Result<ImageId> {
        self.trust
            .verified_image(enclave)
            .await
            .ok_or(AttestationError::KeyNotVerified(*enclave))
    }

    /// Passes only for a verified key whose image is a member of `family_id`.
    pub async fn allow_only_verified_family(
        &self,
        family_id: &FamilyId,
        enclave: &Address,
    ) -> Result<()> {
        let image_id = self.allow_only_verified(enclave).await?;
        if !self.is_image_in_family(&image_id, family_id).await {
            return Err(AttestationError::ImageNotInFamily {
                image_id,
                family_id: *family_id,
            });
        }
        Ok(())
    }

    pub fn get_pubkey_and_address_from_attestation(
        &self,
        attestation: &AttestationDocument,
    ) -> Result<(Vec<u8>, Address)> {
        attestation.pubkey_and_address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::MockAuthenticator;
    use kalypso_crypto::EnclaveKeypair;
    use kalypso_types::ErrorKind;

    struct Fixture {
        registry: EntityKeyRegistry,
        registrar: Address,
    }

    async fn fixture() -> Fixture {
        let admin = Address::repeat_byte(0xad);
        let registrar = Address::repeat_byte(0x5e);
        let access = Arc::new(AccessControl::new(admin));
        access
            .grant_role(admin, Role::KeyRegister, registrar)
            .await
            .unwrap();
        let events = Arc::new(EventBus::new());
        let trust = Arc::new(AttestationTrust::new(
            Arc::new(MockAuthenticator),
            300_000,
            access.clone(),
            events.clone(),
        ));
        Fixture {
            registry: EntityKeyRegistry::new(trust, access, events),
            registrar,
        }
    }

    fn block() -> BlockInfo {
        BlockInfo::new(1, 10_000)
    }

    #[tokio::test]
    async fn test_family_membership() {
        let f = fixture().await;
        let family = prover_family(1);
        let image = Measurements::from_label("prover-1");

        let id = f
            .registry
            .whitelist_image_using_pcrs(f.registrar, family, image.clone())
            .await
            .unwrap();
        assert!(f.registry.is_image_in_family(&id, &family).await);
        assert!(f.registry.trust().is_whitelisted(&id).await);

        let dup = f
            .registry
            .whitelist_image_using_pcrs(f.registrar, family, image.clone())
            .await
            .unwrap_err();
        assert!(matches!(dup, AttestationError::ImageAlreadyInFamily { .. }));

        // same image in another family is fine
        f.registry
            .whitelist_image_using_pcrs(f.registrar, ivs_family(1), image.clone())
            .await
            .unwrap();

        f.registry
            .remove_image_from_family(f.registrar, family, &image)
            .await
            .unwrap();
        let missing = f
            .registry
            .remove_image_from_family(f.registrar, family, &image)
            .await
            .unwrap_err();
        assert!(matches!(missing, AttestationError::ImageNotInFamily { .. }));
    }

    #[tokio::test]
    async fn test_default_image_protected_for_everyone() {
        let f = fixture().await;
        let family = ivs_family(4);
        let image = Measurements::from_label("ivs-default");
        let id = f
            .registry
            .whitelist_image_using_pcrs(f.registrar, family, image.clone())
            .await
            .unwrap();
        f.registry
            .protect_default_image(f.registrar, family, id)
            .await
            .unwrap();

        for caller in [f.registrar, Address::ZERO, Address::repeat_byte(0x77)] {
            let err = f
                .registry
                .remove_image_from_family(caller, family, &image)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                AttestationError::CannotRemoveDefaultImageFromMarket { .. }
            ));
        }
        assert!(f.registry.is_image_in_family(&id, &family).await);
    }

    #[tokio::test]
    async fn test_update_and_remove_pubkey() {
        let f = fixture().await;
        let family = prover_family(7);
        let image = Measurements::from_label("prover-7");
        f.registry
            .whitelist_image_using_pcrs(f.registrar, family, image.clone())
            .await
            .unwrap();

        let owner = Address::repeat_byte(0x01);
        let kp = EnclaveKeypair::generate();
        let doc = AttestationDocument::new(kp.public_key(), image, 9_900_000);
        let enclave = f
            .registry
            .update_pubkey(f.registrar, owner, 7, &kp.public_key(), &doc, family, block())
            .await
            .unwrap();
        assert_eq!(enclave, kp.address());
        assert_eq!(f.registry.pubkey_of(&owner, 7).await, Some(kp.public_key()));
        f.registry
            .allow_only_verified_family(&family, &enclave)
            .await
            .unwrap();

        let outsider = Address::repeat_byte(0x99);
        let err = f.registry.remove_pubkey(outsider, owner, 7).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        assert!(f.registry.pubkey_of(&owner, 7).await.is_some());

        f.registry.remove_pubkey(f.registrar, owner, 7).await.unwrap();
        assert!(f.registry.pubkey_of(&owner, 7).await.is_none());
        assert!(matches!(
            f.registry.allow_only_verified_family(&family, &enclave).await,
            Err(AttestationError::KeyNotVerified(_))
        ));
        assert!(matches!(
            f.registry.remove_pubkey(f.registrar, owner, 7).await,
            Err(AttestationError::KeyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_shared_enclave_survives_until_last_slot_removed() {
        let f = fixture().await;
        let image = Measurements::from_label("ivs-shared");
        for market in [5, 6] {
            f.registry
                .whitelist_image_using_pcrs(f.registrar, ivs_family(market), image.clone())
                .await
                .unwrap();
        }
        let owner = Address::repeat_byte(0x03);
        let kp = EnclaveKeypair::generate();
        let doc = AttestationDocument::new(kp.public_key(), image.clone(), 9_900_000);
        for market in [5, 6] {
            f.registry
                .update_pubkey(f.registrar, owner, market, &kp.public_key(), &doc, ivs_family(market), block())
                .await
                .unwrap();
        }

        f.registry.remove_pubkey(f.registrar, owner, 5).await.unwrap();
        f.registry
            .allow_only_verified_family(&ivs_family(6), &kp.address())
            .await
            .unwrap();

        f.registry.remove_pubkey(f.registrar, owner, 6).await.unwrap();
        assert!(f
            .registry
            .allow_only_verified_family(&ivs_family(6), &kp.address())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_replaced_key_loses_trust() {
        let f = fixture().await;
        let family = prover_family(8);
        let image = Measurements::from_label("prover-8");
        f.registry
            .whitelist_image_using_pcrs(f.registrar, family, image.clone())
            .await
            .unwrap();
        let owner = Address::repeat_byte(0x04);
        let old = EnclaveKeypair::generate();
        let new = EnclaveKeypair::generate();
        for kp in [&old, &new] {
            let doc = AttestationDocument::new(kp.public_key(), image.clone(), 9_900_000);
            f.registry
                .update_pubkey(f.registrar, owner, 8, &kp.public_key(), &doc, family, block())
                .await
                .unwrap();
        }
        assert!(f.registry.allow_only_verified(&old.address()).await.is_err());
        f.registry
            .allow_only_verified_family(&family, &new.address())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_pubkey_rejections() {
        let f = fixture().await;
        let family = prover_family(2);
        let member = Measurements::from_label("member");
        let stranger = Measurements::from_label("stranger");
        f.registry
            .whitelist_image_using_pcrs(f.registrar, family, member.clone())
            .await
            .unwrap();
        f.registry
            .whitelist_image_using_pcrs(f.registrar, ivs_family(2), stranger.clone())
            .await
            .unwrap();

        let owner = Address::repeat_byte(0x02);
        let kp = EnclaveKeypair::generate();
        let other = EnclaveKeypair::generate();

        let wrong_family = AttestationDocument::new(kp.public_key(), stranger, 9_900_000);
        assert!(matches!(
            f.registry
                .update_pubkey(f.registrar, owner, 2, &kp.public_key(), &wrong_family, family, block())
                .await,
            Err(AttestationError::ImageNotInFamily { .. })
        ));

        let doc = AttestationDocument::new(kp.public_key(), member.clone(), 9_900_000);
        assert!(matches!(
            f.registry
                .update_pubkey(f.registrar, owner, 2, &other.public_key(), &doc, family, block())
                .await,
            Err(AttestationError::AttestationKeyMismatch)
        ));

        let bad = AttestationDocument::new(vec![1u8; 63], member, 9_900_000);
        assert!(matches!(
            f.registry
                .update_pubkey(f.registrar, owner, 2, &[1u8; 63], &bad, family, block())
                .await,
            Err(AttestationError::InvalidEnclaveKey(_))
        ));
        assert!(f.registry.pubkey_of(&owner, 2).await.is_none());
    }

    #[tokio::test]
    async fn test_verified_key_outside_family() {
        let f = fixture().await;
        let bridge = bridge_family("symbiotic");
        let other_family = prover_family(3);
        let image = f
            .registry
            .whitelist_image_using_pcrs(f.registrar, bridge, Measurements::from_label("bridge"))
            .await
            .unwrap();
        let kp = EnclaveKeypair::generate();
        let enclave = f
            .registry
            .whitelist_bridge_key(f.registrar, bridge, &kp.public_key(), image)
            .await
            .unwrap();

        f.registry
            .allow_only_verified_family(&bridge, &enclave)
            .await
            .unwrap();
        assert!(matches!(
            f.registry
                .allow_only_verified_family(&other_family, &enclave)
                .await,
            Err(AttestationError::ImageNotInFamily { .. })
        ));
        assert!(matches!(
            f.registry
                .allow_only_verified(&Address::repeat_byte(0x42))
                .await,
            Err(AttestationError::KeyNotVerified(_))
        ));
    }

    #[test]
    fn test_family_ids_are_distinct() {
        assert_ne!(prover_family(1), ivs_family(1));
        assert_ne!(prover_family(1), prover_family(2));
    }
}
