#![allow(dead_code)]

use kalypso_attestation::{AttestationTrust, EntityKeyRegistry, Measurements, MockAuthenticator};
use kalypso_crypto::EnclaveKeypair;
use kalypso_ledger::{MemoryStorage, TokenLedger};
use async_trait::async_trait;
use kalypso_staking::{
    BatchStatus, LockRequest, NativeStaking, NativeStakingConfig, Result, SlashResult,
    SlashResultSubmission, SlashedTask, SnapshotSubmission, StakeEntry, StakingError,
    StakingManager, StakingPool, SymbioticConfig, SymbioticStaking, VaultSnapshot,
};
use kalypso_attestation::bridge_family;
use kalypso_types::{AccessControl, Address, BidId, BlockInfo, EventBus, Role, TokenAmount, WEIGHT_SCALE};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const ADMIN: u8 = 0xad;
pub const MARKET: u8 = 0x4d;
pub const MANAGER: u8 = 0x3a;
pub const PROVER: u8 = 0x01;
pub const POND: u8 = 0xd0;
pub const USDC: u8 = 0xc0;
pub const NATIVE_POOL: u8 = 0xf1;
pub const SYMBIOTIC_POOL: u8 = 0xf2;
pub const TRANSMITTER: u8 = 0x7a;
pub const TREASURY: u8 = 0x7e;

pub fn addr(b: u8) -> Address {
    Address::repeat_byte(b)
}

pub fn amt(v: u128) -> TokenAmount {
    TokenAmount::from_base_units(v)
}

pub fn block() -> BlockInfo {
    BlockInfo::new(50, 100_000)
}

pub fn vault(prover: u8, vault: u8, amount: u128) -> VaultSnapshot {
    VaultSnapshot {
        prover: addr(prover),
        vault: addr(vault),
        stake_token: addr(POND),
        stake_amount: amt(amount),
    }
}

pub struct Fixture {
    pub access: Arc<AccessControl>,
    pub ledger: Arc<TokenLedger>,
    pub events: Arc<EventBus>,
    pub registry: Arc<EntityKeyRegistry>,
    pub native: Arc<NativeStaking>,
    pub symbiotic: Arc<SymbioticStaking>,
    pub manager: Arc<StakingManager>,
    pub bridge: EnclaveKeypair,
}

impl Fixture {
    pub async fn new() -> Self {
        let admin = addr(ADMIN);
        let access = Arc::new(AccessControl::new(admin));
        for role in [Role::Updater, Role::KeyRegister] {
            access.grant_role(admin, role, admin).await.unwrap();
        }
        access
            .grant_role(admin, Role::StakingManager, addr(MANAGER))
            .await
            .unwrap();
        access
            .grant_role(admin, Role::Marketplace, addr(MARKET))
            .await
            .unwrap();

        let events = Arc::new(EventBus::new());
        let ledger = Arc::new(TokenLedger::new(Arc::new(MemoryStorage::new())));
        ledger.mint(addr(POND), addr(PROVER), amt(1_000)).await.unwrap();

        let trust = Arc::new(AttestationTrust::new(
            Arc::new(MockAuthenticator),
            300_000,
            access.clone(),
            events.clone(),
        ));
        let registry = Arc::new(EntityKeyRegistry::new(trust, access.clone(), events.clone()));

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
        native
            .set_token_weight(admin, addr(POND), WEIGHT_SCALE)
            .await
            .unwrap();

        let family = bridge_family("symbiotic-test");
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
            registry.clone(),
            events.clone(),
        ));
        symbiotic
            .set_token_weight(admin, addr(POND), WEIGHT_SCALE)
            .await
            .unwrap();

        let bridge = EnclaveKeypair::generate();
        let image_id = registry
            .whitelist_image_using_pcrs(admin, family, Measurements::from_label("bridge"))
            .await
            .unwrap();
        registry
            .whitelist_bridge_key(admin, family, &bridge.public_key(), image_id)
            .await
            .unwrap();

        let manager = Arc::new(StakingManager::new(
            addr(MANAGER),
            addr(USDC),
            access.clone(),
            ledger.clone(),
        ));
        manager.add_pool(admin, native.clone(), 1).await.unwrap();
        manager.add_pool(admin, symbiotic.clone(), 1).await.unwrap();

        Self {
            access,
            ledger,
            events,
            registry,
            native,
            symbiotic,
            manager,
            bridge,
        }
    }

    /// Leave only the symbiotic pool enabled in the manager.
    pub async fn symbiotic_only(&self) {
        self.manager
            .set_pool_config(addr(ADMIN), "native", 1, false)
            .await
            .unwrap();
    }

    pub fn snapshot_part(
        &self,
        idx: u32,
        num_of_txs: u32,
        capture_timestamp: u64,
        entries: Vec<VaultSnapshot>,
    ) -> SnapshotSubmission {
        SnapshotSubmission::signed(&self.bridge, idx, num_of_txs, capture_timestamp, entries).unwrap()
    }

    pub async fn submit(&self, part: &SnapshotSubmission) -> Result<BatchStatus> {
        self.symbiotic
            .submit_vault_snapshot(addr(TRANSMITTER), part, block())
            .await
    }

    /// Deliver a complete single-part snapshot.
    pub async fn confirm_snapshot(&self, capture_timestamp: u64, entries: Vec<VaultSnapshot>) -> Result<BatchStatus> {
        let part = self.snapshot_part(0, 1, capture_timestamp, entries);
        self.submit(&part).await
    }

    pub async fn submit_slash(&self, capture_timestamp: u64, entries: Vec<SlashResult>) -> Result<BatchStatus> {
        let part =
            SlashResultSubmission::signed(&self.bridge, 0, 1, capture_timestamp, 45, entries).unwrap();
        self.symbiotic
            .submit_slash_result(addr(TRANSMITTER), &part, block())
            .await
    }
}

/// Pool with unlimited stake whose failures are switched on by the test.
#[derive(Default)]
pub struct ScriptedPool {
    pub locks: Mutex<HashSet<BidId>>,
    pub fail_check: AtomicBool,
    pub fail_slash: AtomicBool,
    pub fail_completion: AtomicBool,
    pub slashed: Mutex<Vec<SlashedTask>>,
}

pub const SCRIPTED_POOL: u8 = 0xf3;

impl ScriptedPool {
    pub fn set(flag: &AtomicBool, on: bool) {
        flag.store(on, Ordering::SeqCst);
    }

    fn holds(&self, bid_id: BidId) -> bool {
        self.locks.lock().unwrap().contains(&bid_id)
    }
}

#[async_trait]
impl StakingPool for ScriptedPool {
    fn name(&self) -> &str {
        "scripted"
    }

    fn address(&self) -> Address {
        addr(SCRIPTED_POOL)
    }

    async fn available_stake(&self, _prover: &Address) -> Result<TokenAmount> {
        Ok(amt(1_000_000))
    }

    async fn lock(&self, _caller: Address, request: &LockRequest) -> Result<TokenAmount> {
        self.locks.lock().unwrap().insert(request.bid_id);
        Ok(request.amount)
    }

    async fn unlock(&self, _caller: Address, bid_id: BidId, _prover: Address) -> Result<()> {
        if self.locks.lock().unwrap().remove(&bid_id) {
            Ok(())
        } else {
            Err(StakingError::NoLockForBid(bid_id))
        }
    }

    async fn check_lock(&self, bid_id: BidId, _prover: Address) -> Result<()> {
        if self.fail_check.load(Ordering::SeqCst) || !self.holds(bid_id) {
            return Err(StakingError::NoLockForBid(bid_id));
        }
        Ok(())
    }

    async fn slash(&self, _caller: Address, task: &SlashedTask) -> Result<TokenAmount> {
        if self.fail_slash.load(Ordering::SeqCst) {
            return Err(StakingError::Overflow);
        }
        self.locks.lock().unwrap().remove(&task.bid_id);
        self.slashed.lock().unwrap().push(task.clone());
        Ok(task.amount)
    }

    async fn on_task_completion(
        &self,
        _caller: Address,
        bid_id: BidId,
        _prover: Address,
        _fee: TokenAmount,
    ) -> Result<()> {
        if self.fail_completion.load(Ordering::SeqCst) {
            return Err(StakingError::Overflow);
        }
        self.locks.lock().unwrap().remove(&bid_id);
        Ok(())
    }

    async fn stake_entries(&self, _prover: &Address) -> Vec<StakeEntry> {
        Vec::new()
    }

    async fn claim_rewards(&self, account: Address) -> Result<TokenAmount> {
        Err(StakingError::NoRewards(account))
    }
}

impl Fixture {
    /// Replace the symbiotic pool with a [`ScriptedPool`] behind native.
    pub async fn with_scripted_pool(&self) -> Arc<ScriptedPool> {
        self.manager
            .set_pool_config(addr(ADMIN), "symbiotic", 1, false)
            .await
            .unwrap();
        let pool = Arc::new(ScriptedPool::default());
        self.manager
            .add_pool(addr(ADMIN), pool.clone(), 1)
            .await
            .unwrap();
        pool
    }
}
