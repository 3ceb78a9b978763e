#![allow(dead_code)]

use kalypso_attestation::{
    bridge_family, AttestationDocument, AttestationTrust, EntityKeyRegistry, Measurements,
    MockAuthenticator,
};
use kalypso_crypto::EnclaveKeypair;
use kalypso_ledger::{MemoryStorage, TokenLedger};
use kalypso_market::{
    Bid, MarketMetrics, MarketParams, MarketplaceConfig, MockVerifier, ProofMarketplace,
    ProverRegistry, ProverRegistryConfig, Result, SecretType,
};
use kalypso_staking::{
    BatchStatus, NativeStaking, NativeStakingConfig, SlashResult, SlashResultSubmission,
    SnapshotSubmission, StakingManager, StakingPool, SymbioticConfig, SymbioticStaking,
    VaultSnapshot,
};
use kalypso_types::{
    AccessControl, Address, BidId, BlockInfo, EventBus, MarketId, Role, TokenAmount, WEIGHT_SCALE,
};
use std::sync::Arc;

pub const ADMIN: u8 = 0xad;
pub const MARKETPLACE: u8 = 0x4d;
pub const MANAGER: u8 = 0x3a;
pub const REGISTRAR: u8 = 0x9e;
pub const MATCHER: u8 = 0xe0;
pub const CREATOR: u8 = 0xcc;
pub const REQUESTER: u8 = 0x22;
pub const REFUND: u8 = 0x23;
pub const PROVER: u8 = 0x01;
pub const PROVER_REWARD: u8 = 0x02;
pub const IVS_OPERATOR: u8 = 0x1f;
pub const TREASURY: u8 = 0x7e;
pub const USDC: u8 = 0xc0;
pub const POND: u8 = 0xd0;
pub const NATIVE_POOL: u8 = 0xf1;
pub const SYMBIOTIC_POOL: u8 = 0xf2;
pub const TRANSMITTER: u8 = 0x7a;
pub const VAULT: u8 = 0xa0;

pub const CREATION_COST: u128 = 100;
pub const SLASHING_PENALTY: u128 = 100;
pub const PROOF_COST: u128 = 50;
pub const REWARD: u128 = 200;
pub const PROOF_TIME: u64 = 20;

/// Seconds; every block shares it so attestations stay fresh.
pub const BLOCK_TIME: u64 = 10_000;
pub const ATTESTATION_TIME_MS: u64 = 9_900_000;

pub fn addr(b: u8) -> Address {
    Address::repeat_byte(b)
}

pub fn amt(v: u128) -> TokenAmount {
    TokenAmount::from_base_units(v)
}

pub fn block(number: u64) -> BlockInfo {
    BlockInfo::new(number, BLOCK_TIME)
}

pub fn prover_image() -> Measurements {
    Measurements::from_label("prover-image")
}

pub fn ivs_image() -> Measurements {
    Measurements::from_label("ivs-image")
}

pub fn attestation(kp: &EnclaveKeypair, measurements: Measurements) -> AttestationDocument {
    AttestationDocument::new(kp.public_key(), measurements, ATTESTATION_TIME_MS)
}

pub fn bid(market_id: MarketId, reward: u128, created_at: u64) -> Bid {
    Bid {
        market_id,
        reward: amt(reward),
        expiry: created_at + 50,
        time_for_proof_generation: PROOF_TIME,
        deadline: created_at + 200,
        refund_address: addr(REFUND),
        prover_data: b"public inputs".to_vec(),
    }
}

pub struct Fixture {
    pub access: Arc<AccessControl>,
    pub ledger: Arc<TokenLedger>,
    pub events: Arc<EventBus>,
    pub keys: Arc<EntityKeyRegistry>,
    pub native: Arc<NativeStaking>,
    pub symbiotic: Arc<SymbioticStaking>,
    pub bridge: EnclaveKeypair,
    pub manager: Arc<StakingManager>,
    pub provers: Arc<ProverRegistry>,
    pub marketplace: Arc<ProofMarketplace>,
    pub metrics: Arc<MarketMetrics>,
    pub verifier: Arc<MockVerifier>,
    pub market_id: MarketId,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_verifier(MockVerifier::accepting()).await
    }

    pub async fn with_verifier(verifier: MockVerifier) -> Self {
        let admin = addr(ADMIN);
        let access = Arc::new(AccessControl::new(admin));
        access.grant_role(admin, Role::Updater, admin).await.unwrap();
        for role in [Role::Marketplace, Role::KeyRegister] {
            access.grant_role(admin, role, addr(MARKETPLACE)).await.unwrap();
        }
        access.grant_role(admin, Role::KeyRegister, addr(REGISTRAR)).await.unwrap();
        access.grant_role(admin, Role::StakingManager, addr(MANAGER)).await.unwrap();
        access.grant_role(admin, Role::MatchingEngine, addr(MATCHER)).await.unwrap();

        let events = Arc::new(EventBus::new());
        let ledger = Arc::new(TokenLedger::new(Arc::new(MemoryStorage::new())));
        ledger.mint(addr(USDC), addr(REQUESTER), amt(1_000_000)).await.unwrap();
        ledger.mint(addr(USDC), addr(CREATOR), amt(10_000)).await.unwrap();
        ledger.mint(addr(POND), addr(PROVER), amt(100_000)).await.unwrap();

        let trust = Arc::new(AttestationTrust::new(Arc::new(MockAuthenticator), 300_000, access.clone(), events.clone()));
        let keys = Arc::new(EntityKeyRegistry::new(trust, access.clone(), events.clone()));

        let native = Arc::new(NativeStaking::new(
            NativeStakingConfig {
                pool_address: addr(NATIVE_POOL),
                payment_token: addr(USDC),
                withdrawal_duration: 100,
            },
            access.clone(),
            ledger.clone(),
            events.clone(),
        ));
        native.set_token_weight(admin, addr(POND), WEIGHT_SCALE).await.unwrap();

        let family = bridge_family("market-test");
        let symbiotic = Arc::new(SymbioticStaking::new(
            SymbioticConfig {
                pool_address: addr(SYMBIOTIC_POOL),
                payment_token: addr(USDC),
                submission_cooldown: 0,
                base_transmitter_commission_rate: WEIGHT_SCALE / 10,
                bridge_family: family,
            },
            access.clone(),
            ledger.clone(),
            keys.clone(),
            events.clone(),
        ));
        symbiotic.set_token_weight(admin, addr(POND), WEIGHT_SCALE).await.unwrap();
        let bridge = EnclaveKeypair::generate();
        let bridge_image = keys
            .whitelist_image_using_pcrs(addr(REGISTRAR), family, Measurements::from_label("bridge"))
            .await
            .unwrap();
        keys.whitelist_bridge_key(admin, family, &bridge.public_key(), bridge_image)
            .await
            .unwrap();

        let manager = Arc::new(StakingManager::new(addr(MANAGER), addr(USDC), access.clone(), ledger.clone()));
        manager.add_pool(admin, native.clone(), 1).await.unwrap();

        let provers = Arc::new(ProverRegistry::new(
            ProverRegistryConfig {
                address: addr(REGISTRAR),
                parallel_requests_upper_limit: 100,
                reduction_block_gap: 10,
            },
            access.clone(),
            keys.clone(),
            events.clone(),
        ));

        let mut marketplace = ProofMarketplace::new(
            MarketplaceConfig {
                address: addr(MARKETPLACE),
                payment_token: addr(USDC),
                treasury: addr(TREASURY),
                market_creation_cost: amt(CREATION_COST),
                cost_per_input_byte: amt(1),
                staking_fee_share: WEIGHT_SCALE / 10,
            },
            access.clone(),
            ledger.clone(),
            keys.clone(),
            provers.clone(),
            manager.clone(),
            events.clone(),
        );
        let metrics = Arc::new(MarketMetrics::new().unwrap());
        marketplace.set_metrics(metrics.clone());
        let marketplace = Arc::new(marketplace);

        let verifier = Arc::new(verifier);
        let market_id = marketplace
            .create_marketplace(
                addr(CREATOR),
                MarketParams {
                    verifier: verifier.clone(),
                    prover_image: prover_image(),
                    ivs_image: ivs_image(),
                    slashing_penalty: amt(SLASHING_PENALTY),
                    metadata: b"test market".to_vec(),
                },
            )
            .await
            .unwrap();

        Self {
            access,
            ledger,
            events,
            keys,
            native,
            symbiotic,
            bridge,
            manager,
            provers,
            marketplace,
            metrics,
            verifier,
            market_id,
        }
    }

    /// The fixture with the vault pool registered next to native, both
    /// weighted equally.
    pub async fn dual_pool() -> Self {
        let f = Self::new().await;
        f.manager
            .add_pool(addr(ADMIN), f.symbiotic.clone(), 1)
            .await
            .unwrap();
        f
    }

    /// Confirm a single-part snapshot giving the prover `amount` in one vault.
    pub async fn confirm_vault(&self, capture_timestamp: u64, amount: u128) -> BatchStatus {
        let part = SnapshotSubmission::signed(
            &self.bridge,
            0,
            1,
            capture_timestamp,
            vec![VaultSnapshot {
                prover: addr(PROVER),
                vault: addr(VAULT),
                stake_token: addr(POND),
                stake_amount: amt(amount),
            }],
        )
        .unwrap();
        self.symbiotic
            .submit_vault_snapshot(addr(TRANSMITTER), &part, block(1))
            .await
            .unwrap()
    }

    pub async fn submit_vault_slash(
        &self,
        capture_timestamp: u64,
        bid_id: BidId,
        amount: u128,
        at: u64,
    ) -> kalypso_staking::Result<BatchStatus> {
        let entry = SlashResult {
            bid_id,
            prover: addr(PROVER),
            reward_address: addr(TREASURY),
            amount_to_slash: amt(amount),
        };
        let part = SlashResultSubmission::signed(&self.bridge, 0, 1, capture_timestamp, at, vec![entry]).unwrap();
        self.symbiotic
            .submit_slash_result(addr(TRANSMITTER), &part, block(at))
            .await
    }

    /// Register, stake and join the fixture market. Returns the prover's
    /// enclave key.
    pub async fn onboard_prover(&self, declared_compute: u128, compute_per_request: u128, stake: u128) -> EnclaveKeypair {
        self.provers
            .register(addr(PROVER), addr(PROVER_REWARD), declared_compute, b"prover".to_vec())
            .await
            .unwrap();
        if stake > 0 {
            self.native
                .stake(addr(PROVER), addr(PROVER), addr(POND), amt(stake))
                .await
                .unwrap();
        }
        let enclave = EnclaveKeypair::generate();
        self.marketplace
            .join_marketplace(
                addr(PROVER),
                self.market_id,
                compute_per_request,
                amt(PROOF_COST),
                &enclave.public_key(),
                &attestation(&enclave, prover_image()),
                block(1),
            )
            .await
            .unwrap();
        enclave
    }

    pub async fn default_prover(&self) -> EnclaveKeypair {
        self.onboard_prover(1_000, 100, 10_000).await
    }

    pub async fn register_ivs(&self) -> EnclaveKeypair {
        let enclave = EnclaveKeypair::generate();
        self.marketplace
            .register_ivs_key(
                addr(IVS_OPERATOR),
                self.market_id,
                &enclave.public_key(),
                &attestation(&enclave, ivs_image()),
                block(1),
            )
            .await
            .unwrap();
        enclave
    }

    pub async fn create_bid(&self, reward: u128, at: u64) -> Result<BidId> {
        self.marketplace
            .create_bid(addr(REQUESTER), bid(self.market_id, reward, at), SecretType::Public, &[], &[], block(at))
            .await
    }

    pub async fn assign(&self, bid_id: BidId, at: u64) -> Result<kalypso_market::TaskInfo> {
        self.marketplace
            .assign_task(addr(MATCHER), bid_id, addr(PROVER), Vec::new(), block(at))
            .await
    }

    pub async fn usdc(&self, account: u8) -> TokenAmount {
        self.ledger.balance_of(addr(USDC), addr(account)).await.unwrap()
    }

    pub async fn pond(&self, account: u8) -> TokenAmount {
        self.ledger.balance_of(addr(POND), addr(account)).await.unwrap()
    }

    pub async fn available_stake(&self) -> TokenAmount {
        self.manager.available_stake(&addr(PROVER)).await.unwrap()
    }

    pub async fn compute_consumed(&self) -> u128 {
        self.provers.account(&addr(PROVER)).await.unwrap().compute_consumed
    }

    pub async fn active_requests(&self) -> u64 {
        self.provers
            .market_info(&addr(PROVER), self.market_id)
            .await
            .map(|info| info.active_requests)
            .unwrap_or_default()
    }

    pub async fn native_rewards(&self) -> TokenAmount {
        self.native.pending_rewards(&addr(PROVER)).await
    }

    pub async fn stake_entries(&self) -> Vec<kalypso_staking::StakeEntry> {
        self.native.stake_entries(&addr(PROVER)).await
    }
}
