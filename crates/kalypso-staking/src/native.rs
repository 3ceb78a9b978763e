//! Natively custodied stake.
//!
//! Tokens are transferred into the pool's ledger account. Withdrawal is two
//! phase: a request reserves unlocked stake, and the claim pays it out once
//! `withdrawal_duration` seconds have passed.

use crate::error::{Result, StakingError};
use crate::pool::{
    lock_order, normalized_free, plan_lock, slash_split, LockLeg, LockRequest, SlashedTask,
    StakeEntry, StakingPool,
};
use async_trait::async_trait;
use kalypso_ledger::TokenLedger;
use kalypso_types::{
    AccessControl, Address, BidId, BlockInfo, EventBus, MarketEvent, MarketId, Role, TokenAmount,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const POOL_NAME: &str = "native";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeStakingConfig {
    /// Ledger account holding staked tokens and undistributed rewards.
    pub pool_address: Address,
    /// Token in which task fee rewards are paid.
    pub payment_token: Address,
    /// Seconds between a withdrawal request and its claim.
    pub withdrawal_duration: u64,
}

impl Default for NativeStakingConfig {
    fn default() -> Self {
        Self {
            pool_address: Address::ZERO,
            payment_token: Address::ZERO,
            withdrawal_duration: 2 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeBalance {
    pub total: TokenAmount,
    pub locked: TokenAmount,
    pub pending_withdrawal: TokenAmount,
}

impl StakeBalance {
    /// Stake that can back a new lock or withdrawal request.
    pub fn free(&self) -> TokenAmount {
        self.total
            .saturating_sub(self.locked)
            .saturating_sub(self.pending_withdrawal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub token: Address,
    pub amount: TokenAmount,
    pub claimable_at: u64,
}

#[derive(Debug, Clone)]
struct TaskLock {
    prover: Address,
    market_id: MarketId,
    legs: Vec<LockLeg>,
}

#[derive(Default)]
struct NativeState {
    weights: BTreeMap<Address, u128>,
    stakes: HashMap<(Address, Address), StakeBalance>,
    locks: HashMap<BidId, TaskLock>,
    withdrawals: HashMap<Address, Vec<WithdrawalRequest>>,
    rewards: HashMap<Address, TokenAmount>,
}

impl NativeState {
    fn free_of(&self, prover: &Address) -> impl Fn(&Address) -> TokenAmount + '_ {
        let prover = *prover;
        move |token: &Address| {
            self.stakes
                .get(&(prover, *token))
                .map(|s| s.free())
                .unwrap_or_default()
        }
    }
}

pub struct NativeStaking {
    config: NativeStakingConfig,
    access: Arc<AccessControl>,
    ledger: Arc<TokenLedger>,
    events: Arc<EventBus>,
    state: RwLock<NativeState>,
}

impl NativeStaking {
    pub fn new(
        config: NativeStakingConfig,
        access: Arc<AccessControl>,
        ledger: Arc<TokenLedger>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            access,
            ledger,
            events,
            state: RwLock::new(NativeState::default()),
        }
    }

    pub fn withdrawal_duration(&self) -> u64 {
        self.config.withdrawal_duration
    }

    /// Add a stake token or change its weight. Weight zero stops new locks
    /// from using the token.
    pub async fn set_token_weight(&self, caller: Address, token: Address, weight: u128) -> Result<()> {
        self.access.ensure(Role::Updater, caller).await?;
        if token.is_zero() {
            return Err(StakingError::ZeroAddress);
        }
        let mut state = self.state.write().await;
        state.weights.insert(token, weight);
        info!(pool = POOL_NAME, token = %token, weight, "⚖️ Stake token weight set");
        Ok(())
    }

    pub async fn token_weight(&self, token: &Address) -> Option<u128> {
        self.state.read().await.weights.get(token).copied()
    }

    /// Deposit `amount` of `token` from `depositor` as stake of `prover`.
    pub async fn stake(
        &self,
        depositor: Address,
        prover: Address,
        token: Address,
        amount: TokenAmount,
    ) -> Result<()> {
        if prover.is_zero() {
            return Err(StakingError::ZeroAddress);
        }
        if amount.is_zero() {
            return Err(StakingError::ZeroAmount);
        }
        let mut state = self.state.write().await;
        if !state.weights.contains_key(&token) {
            return Err(StakingError::UnsupportedToken(token));
        }
        let current = state.stakes.get(&(prover, token)).copied().unwrap_or_default();
        let total = current
            .total
            .checked_add(amount)
            .ok_or(StakingError::Overflow)?;

        self.ledger
            .transfer(token, depositor, self.config.pool_address, amount, "native stake")
            .await?;
        state.stakes.insert(
            (prover, token),
            StakeBalance {
                total,
                ..current
            },
        );

        info!(pool = POOL_NAME, prover = %prover, token = %token, amount = %amount, total = %total, "💰 Stake deposited");
        self.events.emit(MarketEvent::Staked {
            pool: POOL_NAME.to_string(),
            prover,
            token,
            amount,
        });
        Ok(())
    }

    pub async fn request_stake_withdrawal(
        &self,
        prover: Address,
        token: Address,
        amount: TokenAmount,
        block: BlockInfo,
    ) -> Result<WithdrawalRequest> {
        if amount.is_zero() {
            return Err(StakingError::ZeroAmount);
        }
        let mut state = self.state.write().await;
        let mut balance = state.stakes.get(&(prover, token)).copied().unwrap_or_default();
        let free = balance.free();
        if free < amount {
            return Err(StakingError::InsufficientStake {
                prover,
                token,
                requested: amount,
                available: free,
            });
        }
        balance.pending_withdrawal = balance.pending_withdrawal.saturating_add(amount);
        state.stakes.insert((prover, token), balance);

        let request = WithdrawalRequest {
            token,
            amount,
            claimable_at: block.timestamp.saturating_add(self.config.withdrawal_duration),
        };
        state
            .withdrawals
            .entry(prover)
            .or_default()
            .push(request.clone());

        info!(
            pool = POOL_NAME,
            prover = %prover,
            token = %token,
            amount = %amount,
            claimable_at = request.claimable_at,
            "⏳ Withdrawal requested"
        );
        self.events.emit(MarketEvent::WithdrawalRequested {
            prover,
            token,
            amount,
            claimable_at: request.claimable_at,
        });
        Ok(request)
    }

    /// Pay out every matured request of `prover`. Returns the total paid.
    pub async fn claim_withdrawal(&self, prover: Address, block: BlockInfo) -> Result<TokenAmount> {
        let mut state = self.state.write().await;
        let requests = state.withdrawals.get(&prover).cloned().unwrap_or_default();
        if requests.is_empty() {
            return Err(StakingError::NoWithdrawalPending(prover));
        }
        let (matured, waiting): (Vec<_>, Vec<_>) = requests
            .into_iter()
            .partition(|r| r.claimable_at <= block.timestamp);
        if matured.is_empty() {
            let claimable_at = waiting
                .iter()
                .map(|r| r.claimable_at)
                .min()
                .unwrap_or(block.timestamp);
            return Err(StakingError::WithdrawalNotReady {
                claimable_at,
                now: block.timestamp,
            });
        }

        let mut payouts: BTreeMap<Address, TokenAmount> = BTreeMap::new();
        for request in &matured {
            let entry = payouts.entry(request.token).or_default();
            *entry = entry.saturating_add(request.amount);
        }

        let mut paid = TokenAmount::ZERO;
        let mut updated = Vec::new();
        for (token, requested) in &payouts {
            let balance = state.stakes.get(&(prover, *token)).copied().unwrap_or_default();
            // never release stake that is still committed to a task
            let payable = (*requested).min(balance.total.saturating_sub(balance.locked));
            updated.push((
                *token,
                StakeBalance {
                    total: balance.total.saturating_sub(payable),
                    locked: balance.locked,
                    pending_withdrawal: balance.pending_withdrawal.saturating_sub(*requested),
                },
                payable,
            ));
            paid = paid.saturating_add(payable);
        }

        let transfers: Vec<(Address, TokenAmount)> =
            updated.iter().map(|(token, _, payable)| (*token, *payable)).collect();
        self.pay_out(&transfers, prover, "native withdrawal").await?;

        for (token, balance, payable) in updated {
            state.stakes.insert((prover, token), balance);
            info!(pool = POOL_NAME, prover = %prover, token = %token, amount = %payable, "💸 Withdrawal claimed");
            self.events.emit(MarketEvent::WithdrawalClaimed {
                prover,
                token,
                amount: payable,
            });
        }
        if waiting.is_empty() {
            state.withdrawals.remove(&prover);
        } else {
            state.withdrawals.insert(prover, waiting);
        }
        Ok(paid)
    }

    pub async fn pending_withdrawals(&self, prover: &Address) -> Vec<WithdrawalRequest> {
        self.state
            .read()
            .await
            .withdrawals
            .get(prover)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn stake_of(&self, prover: &Address, token: &Address) -> StakeBalance {
        self.state
            .read()
            .await
            .stakes
            .get(&(*prover, *token))
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

    /// Transfer every `(token, amount)` from the pool account to `to`,
    /// reverting the earlier legs if one fails.
    async fn pay_out(&self, transfers: &[(Address, TokenAmount)], to: Address, memo: &str) -> Result<()> {
        let pool = self.config.pool_address;
        for (i, (token, amount)) in transfers.iter().enumerate() {
            if let Err(e) = self.ledger.transfer(*token, pool, to, *amount, memo).await {
                for (done_token, done_amount) in &transfers[..i] {
                    if let Err(undo) = self
                        .ledger
                        .transfer(*done_token, to, pool, *done_amount, "revert")
                        .await
                    {
                        warn!(pool = POOL_NAME, error = %undo, "Payout revert failed");
                    }
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn owned_lock(state: &NativeState, bid_id: BidId, prover: Address) -> Result<&TaskLock> {
        match state.locks.get(&bid_id) {
            None => Err(StakingError::NoLockForBid(bid_id)),
            Some(lock) if lock.prover != prover => Err(StakingError::LockProverMismatch {
                bid_id,
                expected: lock.prover,
                actual: prover,
            }),
            Some(lock) => Ok(lock),
        }
    }

    fn take_lock(state: &mut NativeState, bid_id: BidId, prover: Address) -> Result<TaskLock> {
        Self::owned_lock(state, bid_id, prover)?;
        state
            .locks
            .remove(&bid_id)
            .ok_or(StakingError::NoLockForBid(bid_id))
    }

    fn release_legs(state: &mut NativeState, prover: Address, legs: &[LockLeg]) {
        for leg in legs {
            if let Some(balance) = state.stakes.get_mut(&(prover, leg.token)) {
                balance.locked = balance.locked.saturating_sub(leg.raw);
            }
        }
    }
}

#[async_trait]
impl StakingPool for NativeStaking {
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
        let plan = plan_lock(&ordered, state.free_of(&request.prover), request.amount)?;
        let legs = match plan {
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
            let balance = state.stakes.entry((request.prover, leg.token)).or_default();
            balance.locked = balance.locked.saturating_add(leg.raw);
        }
        state.locks.insert(
            request.bid_id,
            TaskLock {
                prover: request.prover,
                market_id: request.market_id,
                legs,
            },
        );

        info!(pool = POOL_NAME, bid_id = request.bid_id, prover = %request.prover, amount = %request.amount, "🔒 Stake locked");
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
        let lock = Self::take_lock(&mut state, bid_id, prover)?;
        Self::release_legs(&mut state, prover, &lock.legs);

        info!(pool = POOL_NAME, bid_id, prover = %prover, "🔓 Stake unlocked");
        self.events.emit(MarketEvent::StakeUnlocked {
            pool: POOL_NAME.to_string(),
            bid_id,
            prover,
        });
        Ok(())
    }

    async fn check_lock(&self, bid_id: BidId, prover: Address) -> Result<()> {
        let state = self.state.read().await;
        Self::owned_lock(&state, bid_id, prover).map(|_| ())
    }

    async fn slash(&self, caller: Address, task: &SlashedTask) -> Result<TokenAmount> {
        self.access.ensure(Role::StakingManager, caller).await?;
        if task.reward_address.is_zero() {
            return Err(StakingError::ZeroAddress);
        }
        let mut state = self.state.write().await;
        let lock = match Self::owned_lock(&state, task.bid_id, task.prover) {
            Ok(lock) => lock.clone(),
            Err(StakingError::NoLockForBid(bid_id)) => return Err(StakingError::NotSlashable(bid_id)),
            Err(e) => return Err(e),
        };

        let weights = state.weights.clone();
        let split = slash_split(&lock.legs, task.amount, |t| {
            weights.get(t).copied().unwrap_or_default()
        })?;

        self.pay_out(&split, task.reward_address, "native slash").await?;

        state.locks.remove(&task.bid_id);
        Self::release_legs(&mut state, task.prover, &lock.legs);
        let mut slashed = TokenAmount::ZERO;
        for (token, raw) in &split {
            if let Some(balance) = state.stakes.get_mut(&(task.prover, *token)) {
                balance.total = balance.total.saturating_sub(*raw);
                // a prover's pending withdrawal never exceeds what remains
                balance.pending_withdrawal = balance
                    .pending_withdrawal
                    .min(balance.total.saturating_sub(balance.locked));
            }
            let weight = weights.get(token).copied().unwrap_or_default();
            slashed = slashed.saturating_add(raw.apply_rate(weight).unwrap_or_default());
        }
        let slashed = slashed.min(task.amount);

        info!(
            pool = POOL_NAME,
            bid_id = task.bid_id,
            prover = %task.prover,
            market_id = lock.market_id,
            recipient = %task.reward_address,
            amount = %slashed,
            "⚔️ Stake slashed"
        );
        self.events.emit(MarketEvent::StakeSlashed {
            pool: POOL_NAME.to_string(),
            bid_id: task.bid_id,
            prover: task.prover,
            recipient: task.reward_address,
            amount: slashed,
        });
        Ok(slashed)
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
        let lock = Self::take_lock(&mut state, bid_id, prover)?;
        Self::release_legs(&mut state, prover, &lock.legs);
        if !fee.is_zero() {
            let reward = state.rewards.entry(prover).or_default();
            *reward = reward.saturating_add(fee);
        }

        info!(pool = POOL_NAME, bid_id, prover = %prover, fee = %fee, "✅ Task completed, stake released");
        self.events.emit(MarketEvent::StakeUnlocked {
            pool: POOL_NAME.to_string(),
            bid_id,
            prover,
        });
        Ok(())
    }

    async fn stake_entries(&self, prover: &Address) -> Vec<StakeEntry> {
        let state = self.state.read().await;
        let mut entries: Vec<StakeEntry> = state
            .stakes
            .iter()
            .filter(|((p, _), _)| p == prover)
            .map(|((_, token), balance)| StakeEntry {
                token: *token,
                total: balance.total,
                locked: balance.locked,
            })
            .collect();
        entries.sort_by_key(|e| e.token);
        entries
    }

    async fn claim_rewards(&self, account: Address) -> Result<TokenAmount> {
        let mut state = self.state.write().await;
        let amount = state.rewards.get(&account).copied().unwrap_or_default();
        if amount.is_zero() {
            return Err(StakingError::NoRewards(account));
        }
        self.ledger
            .transfer(self.config.payment_token, self.config.pool_address, account, amount, "native rewards")
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

#[cfg(test)]
mod tests {
    use super::*;
    use kalypso_ledger::MemoryStorage;
    use kalypso_types::{ErrorKind, WEIGHT_SCALE};

    const ADMIN: u8 = 0xad;
    const MANAGER: u8 = 0x3a;
    const PROVER: u8 = 0x01;
    const POND: u8 = 0xd0;
    const USDC: u8 = 0xc0;

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    fn amt(v: u128) -> TokenAmount {
        TokenAmount::from_base_units(v)
    }

    async fn pool() -> (NativeStaking, Arc<TokenLedger>) {
        let access = Arc::new(AccessControl::new(addr(ADMIN)));
        access
            .grant_role(addr(ADMIN), Role::Updater, addr(ADMIN))
            .await
            .unwrap();
        access
            .grant_role(addr(ADMIN), Role::StakingManager, addr(MANAGER))
            .await
            .unwrap();
        let ledger = Arc::new(TokenLedger::new(Arc::new(MemoryStorage::new())));
        ledger.mint(addr(POND), addr(PROVER), amt(1_000)).await.unwrap();
        ledger.mint(addr(USDC), addr(PROVER), amt(1_000)).await.unwrap();
        let pool = NativeStaking::new(
            NativeStakingConfig {
                pool_address: addr(0xf1),
                payment_token: addr(USDC),
                withdrawal_duration: 100,
            },
            access,
            ledger.clone(),
            Arc::new(EventBus::new()),
        );
        pool.set_token_weight(addr(ADMIN), addr(POND), WEIGHT_SCALE)
            .await
            .unwrap();
        (pool, ledger)
    }

    fn request(bid_id: BidId, amount: u128) -> LockRequest {
        LockRequest {
            bid_id,
            prover: addr(PROVER),
            market_id: 1,
            amount: amt(amount),
        }
    }

    #[tokio::test]
    async fn test_stake_lock_unlock() {
        let (pool, ledger) = pool().await;
        pool.stake(addr(PROVER), addr(PROVER), addr(POND), amt(300))
            .await
            .unwrap();
        assert_eq!(ledger.balance_of(addr(POND), addr(0xf1)).await.unwrap(), amt(300));
        assert_eq!(pool.available_stake(&addr(PROVER)).await.unwrap(), amt(300));

        pool.lock(addr(MANAGER), &request(1, 120)).await.unwrap();
        assert_eq!(pool.available_stake(&addr(PROVER)).await.unwrap(), amt(180));
        assert_eq!(pool.stake_of(&addr(PROVER), &addr(POND)).await.locked, amt(120));

        let err = pool.lock(addr(MANAGER), &request(1, 10)).await.unwrap_err();
        assert!(matches!(err, StakingError::LockAlreadyExists(1)));

        pool.unlock(addr(MANAGER), 1, addr(PROVER)).await.unwrap();
        assert_eq!(pool.available_stake(&addr(PROVER)).await.unwrap(), amt(300));
        assert!(matches!(
            pool.unlock(addr(MANAGER), 1, addr(PROVER)).await,
            Err(StakingError::NoLockForBid(1))
        ));
    }

    #[tokio::test]
    async fn test_lock_is_manager_only_and_all_or_nothing() {
        let (pool, _) = pool().await;
        pool.stake(addr(PROVER), addr(PROVER), addr(POND), amt(50))
            .await
            .unwrap();

        let err = pool.lock(addr(PROVER), &request(1, 10)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        let err = pool.lock(addr(MANAGER), &request(2, 51)).await.unwrap_err();
        assert!(matches!(err, StakingError::InsufficientStakeToLock { .. }));
        assert_eq!(pool.stake_of(&addr(PROVER), &addr(POND)).await.locked, TokenAmount::ZERO);
    }

    #[tokio::test]
    async fn test_unsupported_token_rejected() {
        let (pool, _) = pool().await;
        assert!(matches!(
            pool.stake(addr(PROVER), addr(PROVER), addr(USDC), amt(10)).await,
            Err(StakingError::UnsupportedToken(_))
        ));
    }

    #[tokio::test]
    async fn test_weighted_tokens() {
        let (pool, _) = pool().await;
        pool.set_token_weight(addr(ADMIN), addr(USDC), 2 * WEIGHT_SCALE)
            .await
            .unwrap();
        pool.stake(addr(PROVER), addr(PROVER), addr(POND), amt(100))
            .await
            .unwrap();
        pool.stake(addr(PROVER), addr(PROVER), addr(USDC), amt(100))
            .await
            .unwrap();
        assert_eq!(pool.available_stake(&addr(PROVER)).await.unwrap(), amt(300));

        // heavier token is drawn first
        pool.lock(addr(MANAGER), &request(5, 250)).await.unwrap();
        assert_eq!(pool.stake_of(&addr(PROVER), &addr(USDC)).await.locked, amt(100));
        assert_eq!(pool.stake_of(&addr(PROVER), &addr(POND)).await.locked, amt(50));
    }

    #[tokio::test]
    async fn test_slash_routes_to_recipient() {
        let (pool, ledger) = pool().await;
        let treasury = addr(0x7e);
        pool.stake(addr(PROVER), addr(PROVER), addr(POND), amt(200))
            .await
            .unwrap();
        pool.lock(addr(MANAGER), &request(9, 80)).await.unwrap();

        let task = SlashedTask {
            bid_id: 9,
            prover: addr(PROVER),
            market_id: 1,
            reward_address: treasury,
            amount: amt(30),
        };
        let slashed = pool.slash(addr(MANAGER), &task).await.unwrap();
        assert_eq!(slashed, amt(30));
        assert_eq!(ledger.balance_of(addr(POND), treasury).await.unwrap(), amt(30));

        let stake = pool.stake_of(&addr(PROVER), &addr(POND)).await;
        assert_eq!(stake.total, amt(170));
        assert_eq!(stake.locked, TokenAmount::ZERO);

        assert!(matches!(
            pool.slash(addr(MANAGER), &task).await,
            Err(StakingError::NotSlashable(9))
        ));
    }

    #[tokio::test]
    async fn test_withdrawal_cooldown() {
        let (pool, ledger) = pool().await;
        pool.stake(addr(PROVER), addr(PROVER), addr(POND), amt(100))
            .await
            .unwrap();
        pool.lock(addr(MANAGER), &request(1, 60)).await.unwrap();

        let start = BlockInfo::new(10, 1_000);
        let err = pool
            .request_stake_withdrawal(addr(PROVER), addr(POND), amt(41), start)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capacity);

        pool.request_stake_withdrawal(addr(PROVER), addr(POND), amt(40), start)
            .await
            .unwrap();
        // reserved stake is no longer lockable
        assert_eq!(pool.available_stake(&addr(PROVER)).await.unwrap(), TokenAmount::ZERO);

        let early = BlockInfo::new(11, 1_099);
        assert!(matches!(
            pool.claim_withdrawal(addr(PROVER), early).await,
            Err(StakingError::WithdrawalNotReady { claimable_at: 1_100, .. })
        ));

        let later = BlockInfo::new(20, 1_100);
        let paid = pool.claim_withdrawal(addr(PROVER), later).await.unwrap();
        assert_eq!(paid, amt(40));
        assert_eq!(ledger.balance_of(addr(POND), addr(PROVER)).await.unwrap(), amt(940));
        let stake = pool.stake_of(&addr(PROVER), &addr(POND)).await;
        assert_eq!(stake.total, amt(60));
        assert_eq!(stake.pending_withdrawal, TokenAmount::ZERO);
        assert!(matches!(
            pool.claim_withdrawal(addr(PROVER), later).await,
            Err(StakingError::NoWithdrawalPending(_))
        ));
    }

    #[tokio::test]
    async fn test_completion_credits_rewards() {
        let (pool, ledger) = pool().await;
        pool.stake(addr(PROVER), addr(PROVER), addr(POND), amt(100))
            .await
            .unwrap();
        pool.lock(addr(MANAGER), &request(3, 10)).await.unwrap();
        ledger.mint(addr(USDC), addr(0xf1), amt(7)).await.unwrap();

        pool.on_task_completion(addr(MANAGER), 3, addr(PROVER), amt(7))
            .await
            .unwrap();
        assert_eq!(pool.pending_rewards(&addr(PROVER)).await, amt(7));
        assert_eq!(pool.claim_rewards(addr(PROVER)).await.unwrap(), amt(7));
        assert_eq!(ledger.balance_of(addr(USDC), addr(PROVER)).await.unwrap(), amt(1_007));
        assert!(matches!(
            pool.claim_rewards(addr(PROVER)).await,
            Err(StakingError::NoRewards(_))
        ));
    }
}
