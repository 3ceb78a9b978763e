//! Stake held in external vaults and reported through a bridge enclave.
//!
//! Balances are never deposited here. A bridge relays signed vault
//! snapshots in fragments; once every part of a batch has arrived the
//! batch becomes the confirmed view that locks are checked against.
//! Readers only ever see confirmed state.

mod messages;
mod reconciler;

pub use messages::{
    ConfirmedTimestamp, SlashResult, SlashResultSubmission, SnapshotSubmission, VaultSnapshot,
};
pub use reconciler::{BatchKind, BatchStatus};

use crate::error::{Result, StakingError};
use crate::pool::{
    lock_order, normalized_free, plan_lock, slash_split, LockLeg, LockRequest, SlashedTask,
    StakeEntry, StakingPool,
};
use async_trait::async_trait;
use kalypso_attestation::{bridge_family, EntityKeyRegistry};
use kalypso_crypto::{recover_signer, RecoverableSignature};
use kalypso_ledger::TokenLedger;
use kalypso_types::{
    AccessControl, Address, BidId, BlockInfo, EventBus, FamilyId, MarketEvent, MarketId, Role,
    TokenAmount, H256, WEIGHT_SCALE,
};
use reconciler::{Admission, BatchTracker, PartHeader};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const POOL_NAME: &str = "symbiotic";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbioticConfig {
    /// Ledger account receiving the fee share for later distribution.
    pub pool_address: Address,
    pub payment_token: Address,
    /// Minimum seconds between consecutive confirmed capture timestamps.
    pub submission_cooldown: u64,
    /// Share of accrued fees paid to the transmitter, scaled by 1e18.
    pub base_transmitter_commission_rate: u128,
    /// Image family whose enclaves may sign bridge batches.
    pub bridge_family: FamilyId,
}

impl Default for SymbioticConfig {
    fn default() -> Self {
        Self {
            pool_address: Address::ZERO,
            payment_token: Address::ZERO,
            submission_cooldown: 3_600,
            base_transmitter_commission_rate: WEIGHT_SCALE / 10,
            bridge_family: bridge_family("symbiotic"),
        }
    }
}

/// (prover, vault, token)
type VaultKey = (Address, Address, Address);

#[derive(Debug, Clone)]
struct SymbioticLock {
    prover: Address,
    market_id: MarketId,
    legs: Vec<LockLeg>,
    capture_timestamp: u64,
    pending_slash: bool,
}

struct PlannedSlash {
    entry: SlashResult,
    lock: SymbioticLock,
    split: Vec<(Address, TokenAmount)>,
}

struct SymbioticState {
    weights: BTreeMap<Address, u128>,
    submission_cooldown: u64,
    commission_rate: u128,
    snapshots: BatchTracker,
    slashes: BatchTracker,
    /// Entries of the snapshot batch being collected.
    working: BTreeMap<VaultKey, TokenAmount>,
    confirmed: BTreeMap<VaultKey, TokenAmount>,
    operator_stakes: HashMap<(Address, Address), TokenAmount>,
    locked: HashMap<(Address, Address), TokenAmount>,
    locks: HashMap<BidId, SymbioticLock>,
    confirmed_timestamps: Vec<ConfirmedTimestamp>,
    accrued_fees: BTreeMap<Address, TokenAmount>,
    rewards: HashMap<Address, TokenAmount>,
    slash_history: Vec<SlashedTask>,
    slashed_in_batch: u32,
}

impl SymbioticState {
    fn free_of(&self, prover: &Address) -> impl Fn(&Address) -> TokenAmount + '_ {
        let prover = *prover;
        move |token: &Address| {
            let total = self
                .operator_stakes
                .get(&(prover, *token))
                .copied()
                .unwrap_or_default();
            let locked = self.locked.get(&(prover, *token)).copied().unwrap_or_default();
            total.saturating_sub(locked)
        }
    }

    fn latest_capture_timestamp(&self) -> u64 {
        self.snapshots.last_confirmed().unwrap_or_default()
    }

    /// A lock the manager may still release or slash.
    fn live_lock(&self, bid_id: BidId, prover: Address) -> Result<&SymbioticLock> {
        match self.locks.get(&bid_id) {
            None => Err(StakingError::NoLockForBid(bid_id)),
            Some(lock) if lock.prover != prover => Err(StakingError::LockProverMismatch {
                bid_id,
                expected: lock.prover,
                actual: prover,
            }),
            Some(lock) if lock.pending_slash => Err(StakingError::AwaitingExternalSlash(bid_id)),
            Some(lock) => Ok(lock),
        }
    }

    fn release_legs(&mut self, prover: Address, legs: &[LockLeg]) {
        for leg in legs {
            if let Some(locked) = self.locked.get_mut(&(prover, leg.token)) {
                *locked = locked.saturating_sub(leg.raw);
                if locked.is_zero() {
                    self.locked.remove(&(prover, leg.token));
                }
            }
        }
    }
}

fn operator_totals(
    entries: &BTreeMap<VaultKey, TokenAmount>,
) -> Result<HashMap<(Address, Address), TokenAmount>> {
    let mut totals: HashMap<(Address, Address), TokenAmount> = HashMap::new();
    for ((prover, _, token), amount) in entries {
        let total = totals.entry((*prover, *token)).or_default();
        *total = total.checked_add(*amount).ok_or(StakingError::Overflow)?;
    }
    Ok(totals)
}

pub struct SymbioticStaking {
    config: SymbioticConfig,
    access: Arc<AccessControl>,
    ledger: Arc<TokenLedger>,
    registry: Arc<EntityKeyRegistry>,
    events: Arc<EventBus>,
    state: RwLock<SymbioticState>,
}

impl SymbioticStaking {
    pub fn new(
        config: SymbioticConfig,
        access: Arc<AccessControl>,
        ledger: Arc<TokenLedger>,
        registry: Arc<EntityKeyRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        let state = SymbioticState {
            weights: BTreeMap::new(),
            submission_cooldown: config.submission_cooldown,
            commission_rate: config.base_transmitter_commission_rate,
            snapshots: BatchTracker::new(BatchKind::VaultSnapshot),
            slashes: BatchTracker::new(BatchKind::SlashResult),
            working: BTreeMap::new(),
            confirmed: BTreeMap::new(),
            operator_stakes: HashMap::new(),
            locked: HashMap::new(),
            locks: HashMap::new(),
            confirmed_timestamps: Vec::new(),
            accrued_fees: BTreeMap::new(),
            rewards: HashMap::new(),
            slash_history: Vec::new(),
            slashed_in_batch: 0,
        };
        Self {
            config,
            access,
            ledger,
            registry,
            events,
            state: RwLock::new(state),
        }
    }

    pub fn bridge_family(&self) -> FamilyId {
        self.config.bridge_family
    }

    pub async fn set_token_weight(&self, caller: Address, token: Address, weight: u128) -> Result<()> {
        self.access.ensure(Role::Updater, caller).await?;
        if token.is_zero() {
            return Err(StakingError::ZeroAddress);
        }
        self.state.write().await.weights.insert(token, weight);
        info!(pool = POOL_NAME, token = %token, weight, "⚖️ Stake token weight set");
        Ok(())
    }

    pub async fn token_weight(&self, token: &Address) -> Option<u128> {
        self.state.read().await.weights.get(token).copied()
    }

    pub async fn set_submission_cooldown(&self, caller: Address, cooldown: u64) -> Result<()> {
        self.access.ensure(Role::Updater, caller).await?;
        self.state.write().await.submission_cooldown = cooldown;
        info!(pool = POOL_NAME, cooldown, "⏱️ Submission cooldown updated");
        Ok(())
    }

    pub async fn submission_cooldown(&self) -> u64 {
        self.state.read().await.submission_cooldown
    }

    pub async fn set_base_transmitter_commission_rate(&self, caller: Address, rate: u128) -> Result<()> {
        self.access.ensure(Role::Updater, caller).await?;
        if rate > WEIGHT_SCALE {
            return Err(StakingError::InvalidWeight(rate));
        }
        self.state.write().await.commission_rate = rate;
        info!(pool = POOL_NAME, rate, "⚖️ Transmitter commission updated");
        Ok(())
    }

    /// The signer must hold a verified key whose image is in the bridge family.
    async fn authorize_signer(&self, digest: &H256, signature: &RecoverableSignature) -> Result<Address> {
        let signer = recover_signer(digest, signature)?;
        if let Err(e) = self
            .registry
            .allow_only_verified_family(&self.config.bridge_family, &signer)
            .await
        {
            warn!(pool = POOL_NAME, signer = %signer, error = %e, "🚫 Bridge signature rejected");
            return Err(e.into());
        }
        Ok(signer)
    }

    fn validate_snapshot_entries(
        weights: &BTreeMap<Address, u128>,
        entries: &[VaultSnapshot],
    ) -> Result<Vec<(VaultKey, TokenAmount)>> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let reason = if entry.prover.is_zero() {
                Some("zero prover")
            } else if entry.vault.is_zero() {
                Some("zero vault")
            } else if !weights.contains_key(&entry.stake_token) {
                Some("unsupported stake token")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(StakingError::InvalidEntry {
                    index,
                    reason: reason.to_string(),
                });
            }
            let key = (entry.prover, entry.vault, entry.stake_token);
            if !seen.insert(key) {
                return Err(StakingError::InvalidEntry {
                    index,
                    reason: "duplicate vault entry".to_string(),
                });
            }
            out.push((key, entry.stake_amount));
        }
        Ok(out)
    }

    fn emit_abandoned(&self, kind: BatchKind, admission: Admission, superseded_by: u64) {
        if let Admission::Supersede { abandoned } = admission {
            warn!(
                pool = POOL_NAME,
                kind = %kind,
                capture_timestamp = abandoned,
                superseded_by,
                "🗑️ Incomplete batch abandoned"
            );
            self.events.emit(MarketEvent::BatchAbandoned {
                kind: kind.as_str().to_string(),
                capture_timestamp: abandoned,
                superseded_by,
            });
        }
    }

    /// Apply one part of a vault snapshot batch submitted by `transmitter`.
    ///
    /// A rejected part leaves every piece of state as it was. The part that
    /// completes a batch replaces the confirmed view wholesale, records a
    /// [`ConfirmedTimestamp`] and distributes fees accrued since the
    /// previous confirmation.
    pub async fn submit_vault_snapshot(
        &self,
        transmitter: Address,
        submission: &SnapshotSubmission,
        block: BlockInfo,
    ) -> Result<BatchStatus> {
        let signer = self
            .authorize_signer(&submission.digest(), &submission.signature)
            .await?;
        let header = PartHeader {
            idx: submission.idx,
            num_of_txs: submission.num_of_txs,
            capture_timestamp: submission.capture_timestamp,
        };

        let mut state = self.state.write().await;
        let cooldown = state.submission_cooldown;
        let admission = match state.snapshots.admit(header, transmitter, block, cooldown) {
            Ok(admission) => admission,
            Err(e) => {
                warn!(
                    pool = POOL_NAME,
                    kind = %state.snapshots.kind(),
                    capture_timestamp = header.capture_timestamp,
                    idx = header.idx,
                    error = %e,
                    "🚫 Batch part rejected"
                );
                return Err(e);
            }
        };
        let part = Self::validate_snapshot_entries(&state.weights, &submission.entries)?;

        let mut next = if admission.starts_batch() {
            BTreeMap::new()
        } else {
            state.working.clone()
        };
        for (key, amount) in part {
            next.insert(key, amount);
        }

        let confirmation = if state.snapshots.completes(header, admission) {
            let totals = operator_totals(&next)?;
            for ((prover, token), locked) in &state.locked {
                let snapshot = totals.get(&(*prover, *token)).copied().unwrap_or_default();
                if snapshot < *locked {
                    return Err(StakingError::SnapshotBelowLockedStake {
                        prover: *prover,
                        token: *token,
                        locked: *locked,
                        snapshot,
                    });
                }
            }
            let mut payouts = Vec::with_capacity(state.accrued_fees.len());
            for (prover, fee) in &state.accrued_fees {
                let commission = fee
                    .apply_rate(state.commission_rate)
                    .ok_or(StakingError::Overflow)?;
                payouts.push((*prover, commission, fee.saturating_sub(commission)));
            }
            Some((totals, payouts))
        } else {
            None
        };

        self.emit_abandoned(state.snapshots.kind(), admission, header.capture_timestamp);
        state.snapshots.record(header, admission, transmitter);
        state.working = next;
        debug!(
            pool = POOL_NAME,
            capture_timestamp = header.capture_timestamp,
            idx = header.idx,
            num_of_txs = header.num_of_txs,
            signer = %signer,
            entries = submission.entries.len(),
            "📥 Snapshot part accepted"
        );
        self.events.emit(MarketEvent::SnapshotPartAccepted {
            kind: state.snapshots.kind().as_str().to_string(),
            capture_timestamp: header.capture_timestamp,
            idx: header.idx,
            num_of_txs: header.num_of_txs,
            transmitter,
        });

        if let Some((totals, payouts)) = confirmation {
            let working = std::mem::take(&mut state.working);
            state.confirmed = working;
            state.operator_stakes = totals;
            state.snapshots.confirm(header.capture_timestamp);
            let commission_rate = state.commission_rate;
            state.confirmed_timestamps.push(ConfirmedTimestamp {
                capture_timestamp: header.capture_timestamp,
                block_number: block.number,
                transmitter,
                transmitter_commission_rate: commission_rate,
            });
            state.accrued_fees.clear();
            for (prover, commission, remainder) in payouts {
                for (account, amount) in [(transmitter, commission), (prover, remainder)] {
                    if !amount.is_zero() {
                        let reward = state.rewards.entry(account).or_default();
                        *reward = reward.saturating_add(amount);
                    }
                }
            }

            info!(
                pool = POOL_NAME,
                capture_timestamp = header.capture_timestamp,
                block_number = block.number,
                transmitter = %transmitter,
                vaults = state.confirmed.len(),
                "✅ Vault snapshot confirmed"
            );
            self.events.emit(MarketEvent::SnapshotConfirmed {
                capture_timestamp: header.capture_timestamp,
                block_number: block.number,
                transmitter,
                commission_rate,
            });
        }
        Ok(state.snapshots.status().clone())
    }

    /// Apply one part of a slash result batch. Entries take effect as soon
    /// as their part is accepted. Only locks the marketplace already slashed
    /// for a missed deadline can be consumed; live task locks are not
    /// slashable from the bridge.
    pub async fn submit_slash_result(
        &self,
        transmitter: Address,
        submission: &SlashResultSubmission,
        block: BlockInfo,
    ) -> Result<BatchStatus> {
        let signer = self
            .authorize_signer(&submission.digest(), &submission.signature)
            .await?;
        let header = PartHeader {
            idx: submission.idx,
            num_of_txs: submission.num_of_txs,
            capture_timestamp: submission.capture_timestamp,
        };

        let mut state = self.state.write().await;
        let admission = match state.slashes.admit(header, transmitter, block, 0) {
            Ok(admission) => admission,
            Err(e) => {
                warn!(
                    pool = POOL_NAME,
                    kind = %state.slashes.kind(),
                    capture_timestamp = header.capture_timestamp,
                    idx = header.idx,
                    error = %e,
                    "🚫 Batch part rejected"
                );
                return Err(e);
            }
        };

        let mut seen = HashSet::new();
        let mut planned = Vec::with_capacity(submission.entries.len());
        for (index, entry) in submission.entries.iter().enumerate() {
            if entry.prover.is_zero() || entry.reward_address.is_zero() {
                return Err(StakingError::InvalidEntry {
                    index,
                    reason: "zero address".to_string(),
                });
            }
            if !seen.insert(entry.bid_id) {
                return Err(StakingError::InvalidEntry {
                    index,
                    reason: "duplicate bid".to_string(),
                });
            }
            let lock = match state.locks.get(&entry.bid_id) {
                Some(lock) if lock.prover == entry.prover && lock.pending_slash => lock.clone(),
                _ => {
                    debug!(pool = POOL_NAME, bid_id = entry.bid_id, index, "Slash result for a lock not awaiting one");
                    return Err(StakingError::NotSlashable(entry.bid_id));
                }
            };
            let split = slash_split(&lock.legs, entry.amount_to_slash, |t| {
                state.weights.get(t).copied().unwrap_or_default()
            })?;
            planned.push(PlannedSlash {
                entry: entry.clone(),
                lock,
                split,
            });
        }

        self.emit_abandoned(state.slashes.kind(), admission, header.capture_timestamp);
        if admission.starts_batch() {
            state.slashed_in_batch = 0;
        }
        let complete = state.slashes.record(header, admission, transmitter);

        for PlannedSlash { entry, lock, split } in planned {
            state.locks.remove(&entry.bid_id);
            state.release_legs(entry.prover, &lock.legs);
            let mut slashed = TokenAmount::ZERO;
            for (token, raw) in &split {
                if let Some(stake) = state.operator_stakes.get_mut(&(entry.prover, *token)) {
                    *stake = stake.saturating_sub(*raw);
                }
                let weight = state.weights.get(token).copied().unwrap_or_default();
                slashed = slashed.saturating_add(raw.apply_rate(weight).unwrap_or_default());
            }
            let slashed = slashed.min(entry.amount_to_slash);
            state.slash_history.push(SlashedTask {
                bid_id: entry.bid_id,
                prover: entry.prover,
                market_id: lock.market_id,
                reward_address: entry.reward_address,
                amount: slashed,
            });
            state.slashed_in_batch = state.slashed_in_batch.saturating_add(1);

            info!(
                pool = POOL_NAME,
                bid_id = entry.bid_id,
                prover = %entry.prover,
                market_id = lock.market_id,
                recipient = %entry.reward_address,
                amount = %slashed,
                lock_capture_timestamp = lock.capture_timestamp,
                "⚔️ Vault stake slashed"
            );
            self.events.emit(MarketEvent::StakeSlashed {
                pool: POOL_NAME.to_string(),
                bid_id: entry.bid_id,
                prover: entry.prover,
                recipient: entry.reward_address,
                amount: slashed,
            });
        }

        debug!(
            pool = POOL_NAME,
            capture_timestamp = header.capture_timestamp,
            idx = header.idx,
            num_of_txs = header.num_of_txs,
            last_block_number = submission.last_block_number,
            signer = %signer,
            "📥 Slash result part accepted"
        );
        self.events.emit(MarketEvent::SnapshotPartAccepted {
            kind: state.slashes.kind().as_str().to_string(),
            capture_timestamp: header.capture_timestamp,
            idx: header.idx,
            num_of_txs: header.num_of_txs,
            transmitter,
        });

        if complete {
            state.slashes.confirm(header.capture_timestamp);
            info!(
                pool = POOL_NAME,
                capture_timestamp = header.capture_timestamp,
                transmitter = %transmitter,
                slashed = state.slashed_in_batch,
                "✅ Slash result batch confirmed"
            );
            self.events.emit(MarketEvent::SlashBatchConfirmed {
                capture_timestamp: header.capture_timestamp,
                transmitter,
                slashed: state.slashed_in_batch,
            });
        }
        Ok(state.slashes.status().clone())
    }

    pub async fn confirmed_timestamps(&self) -> Vec<ConfirmedTimestamp> {
        self.state.read().await.confirmed_timestamps.clone()
    }

    pub async fn latest_confirmed(&self) -> Option<ConfirmedTimestamp> {
        self.state.read().await.confirmed_timestamps.last().cloned()
    }

    pub async fn batch_status(&self, kind: BatchKind) -> BatchStatus {
        let state = self.state.read().await;
        match kind {
            BatchKind::VaultSnapshot => state.snapshots.status().clone(),
            BatchKind::SlashResult => state.slashes.status().clone(),
        }
    }

    /// Confirmed stake of one vault.
    pub async fn vault_stake(&self, prover: &Address, vault: &Address, token: &Address) -> TokenAmount {
        self.state
            .read()
            .await
            .confirmed
            .get(&(*prover, *vault, *token))
            .copied()
            .unwrap_or_default()
    }

    /// Confirmed stake of `prover` in `token` across vaults, net of slashes.
    pub async fn operator_stake(&self, prover: &Address, token: &Address) -> TokenAmount {
        self.state
            .read()
            .await
            .operator_stakes
            .get(&(*prover, *token))
            .copied()
            .unwrap_or_default()
    }

    pub async fn locked_stake(&self, prover: &Address, token: &Address) -> TokenAmount {
        self.state
            .read()
            .await
            .locked
            .get(&(*prover, *token))
            .copied()
            .unwrap_or_default()
    }

    pub async fn is_pending_slash(&self, bid_id: BidId) -> bool {
        self.state
            .read()
            .await
            .locks
            .get(&bid_id)
            .map(|l| l.pending_slash)
            .unwrap_or(false)
    }

    pub async fn slash_history(&self) -> Vec<SlashedTask> {
        self.state.read().await.slash_history.clone()
    }

    pub async fn accrued_fees(&self, prover: &Address) -> TokenAmount {
        self.state
            .read()
            .await
            .accrued_fees
            .get(prover)
            .copied()
            .unwrap_or_default()
    }

    pub async fn pending_rewards(&self, account: &Address) -> TokenAmount {
        self.state
            .read()
            .await
            .rewards
            .get(account)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl StakingPool for SymbioticStaking {
    fn name(&self) -> &str {
        POOL_NAME
    }

    fn address(&self) -> Address {
        self.config.pool_address
    }

    async fn available_stake(&self, prover: &Address) -> Result<TokenAmount> {
        let state = self.state.read().await;
        let ordered = lock_order(state.weights.iter().map(|(t, w)| (*t, *w)));
        normalized_free(&ordered, state.free_of(prover))
    }

    async fn lock(&self, caller: Address, request: &LockRequest) -> Result<TokenAmount> {
        self.access.ensure(Role::StakingManager, caller).await?;
        let mut state = self.state.write().await;
        if state.locks.contains_key(&request.bid_id) {
            return Err(StakingError::LockAlreadyExists(request.bid_id));
        }
        let ordered = lock_order(state.weights.iter().map(|(t, w)| (*t, *w)));
        let legs = match plan_lock(&ordered, state.free_of(&request.prover), request.amount)? {
            Some(legs) => legs,
            None => {
                let available = normalized_free(&ordered, state.free_of(&request.prover))?;
                debug!(pool = POOL_NAME, prover = %request.prover, required = %request.amount, available = %available, "Lock rejected");
                return Err(StakingError::InsufficientStakeToLock {
                    pool: POOL_NAME.to_string(),
                    prover: request.prover,
                    required: request.amount,
                    available,
                });
            }
        };

        for leg in &legs {
            let locked = state.locked.entry((request.prover, leg.token)).or_default();
            *locked = locked.saturating_add(leg.raw);
        }
        let capture_timestamp = state.latest_capture_timestamp();
        state.locks.insert(
            request.bid_id,
            SymbioticLock {
                prover: request.prover,
                market_id: request.market_id,
                legs,
                capture_timestamp,
                pending_slash: false,
            },
        );

        info!(pool = POOL_NAME, bid_id = request.bid_id, prover = %request.prover, amount = %request.amount, capture_timestamp, "🔒 Vault stake locked");
        self.events.emit(MarketEvent::StakeLocked {
            pool: POOL_NAME.to_string(),
            bid_id: request.bid_id,
            prover: request.prover,
            amount: request.amount,
        });
        Ok(request.amount)
    }

    async fn unlock(&self, caller: Address, bid_id: BidId, prover: Address) -> Result<()> {
        self.access.ensure(Role::StakingManager, caller).await?;
        let mut state = self.state.write().await;
        let lock = state.live_lock(bid_id, prover)?.clone();
        state.locks.remove(&bid_id);
        state.release_legs(prover, &lock.legs);

        info!(pool = POOL_NAME, bid_id, prover = %prover, "🔓 Vault stake unlocked");
        self.events.emit(MarketEvent::StakeUnlocked {
            pool: POOL_NAME.to_string(),
            bid_id,
            prover,
        });
        Ok(())
    }

    async fn check_lock(&self, bid_id: BidId, prover: Address) -> Result<()> {
        let state = self.state.read().await;
        state.live_lock(bid_id, prover).map(|_| ())
    }

    /// Vault stake cannot be seized here. The lock is held until the bridge
    /// reports the outcome of the external slash.
    async fn slash(&self, caller: Address, task: &SlashedTask) -> Result<TokenAmount> {
        self.access.ensure(Role::StakingManager, caller).await?;
        let mut state = self.state.write().await;
        match state.live_lock(task.bid_id, task.prover) {
            Ok(_) => {}
            Err(StakingError::NoLockForBid(bid_id) | StakingError::AwaitingExternalSlash(bid_id)) => {
                return Err(StakingError::NotSlashable(bid_id))
            }
            Err(e) => return Err(e),
        }
        if let Some(lock) = state.locks.get_mut(&task.bid_id) {
            lock.pending_slash = true;
        }
        info!(
            pool = POOL_NAME,
            bid_id = task.bid_id,
            prover = %task.prover,
            market_id = task.market_id,
            "⏳ Vault lock awaiting external slash"
        );
        Ok(TokenAmount::ZERO)
    }

    async fn on_task_completion(
        &self,
        caller: Address,
        bid_id: BidId,
        prover: Address,
        fee: TokenAmount,
    ) -> Result<()> {
        self.access.ensure(Role::StakingManager, caller).await?;
        let mut state = self.state.write().await;
        let lock = state.live_lock(bid_id, prover)?.clone();
        state.locks.remove(&bid_id);
        state.release_legs(prover, &lock.legs);
        if !fee.is_zero() {
            let accrued = state.accrued_fees.entry(prover).or_default();
            *accrued = accrued.saturating_add(fee);
        }

        info!(pool = POOL_NAME, bid_id, prover = %prover, fee = %fee, "✅ Task completed, vault stake released");
        self.events.emit(MarketEvent::StakeUnlocked {
            pool: POOL_NAME.to_string(),
            bid_id,
            prover,
        });
        Ok(())
    }

    async fn stake_entries(&self, prover: &Address) -> Vec<StakeEntry> {
        let state = self.state.read().await;
        let mut tokens: Vec<Address> = state
            .operator_stakes
            .keys()
            .chain(state.locked.keys())
            .filter(|(p, _)| p == prover)
            .map(|(_, t)| *t)
            .collect();
        tokens.sort();
        tokens.dedup();
        tokens
            .into_iter()
            .map(|token| StakeEntry {
                token,
                total: state
                    .operator_stakes
                    .get(&(*prover, token))
                    .copied()
                    .unwrap_or_default(),
                locked: state.locked.get(&(*prover, token)).copied().unwrap_or_default(),
            })
            .collect()
    }

    async fn claim_rewards(&self, account: Address) -> Result<TokenAmount> {
        let mut state = self.state.write().await;
        let amount = state.rewards.get(&account).copied().unwrap_or_default();
        if amount.is_zero() {
            return Err(StakingError::NoRewards(account));
        }
        self.ledger
            .transfer(self.config.payment_token, self.config.pool_address, account, amount, "symbiotic rewards")
            .await?;
        state.rewards.remove(&account);
        info!(pool = POOL_NAME, account = %account, amount = %amount, "💰 Rewards claimed");
        self.events.emit(MarketEvent::RewardsClaimed {
            pool: POOL_NAME.to_string(),
            account,
            amount,
        });
        Ok(amount)
    }
}
