//! Routes lock requests across the registered pools.

use crate::error::{Result, StakingError};
use crate::pool::{LockRequest, SlashedTask, StakeEntry, StakingPool};
use kalypso_ledger::TokenLedger;
use kalypso_types::{AccessControl, Address, BidId, Role, TokenAmount};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub weight: u128,
    pub enabled: bool,
}

struct RegisteredPool {
    pool: Arc<dyn StakingPool>,
    config: PoolConfig,
}

/// Pool index and the normalized share locked there.
type LockShare = (usize, TokenAmount);

#[derive(Default)]
struct ManagerState {
    pools: Vec<RegisteredPool>,
    locks: HashMap<BidId, Vec<LockShare>>,
}

impl ManagerState {
    fn enabled(&self) -> Vec<usize> {
        self.pools
            .iter()
            .enumerate()
            .filter(|(_, p)| p.config.enabled && p.config.weight > 0)
            .map(|(i, _)| i)
            .collect()
    }

    /// Split `amount` across `indices` by pool weight; the last index takes
    /// the rounding remainder.
    fn split(&self, indices: &[usize], amount: TokenAmount) -> Result<Vec<LockShare>> {
        let total_weight: u128 = indices
            .iter()
            .map(|i| self.pools[*i].config.weight)
            .try_fold(0u128, |acc, w| acc.checked_add(w))
            .ok_or(StakingError::Overflow)?;
        let mut shares = Vec::with_capacity(indices.len());
        let mut assigned = TokenAmount::ZERO;
        for (n, i) in indices.iter().enumerate() {
            let share = if n + 1 == indices.len() {
                amount.saturating_sub(assigned)
            } else {
                amount
                    .proportion(self.pools[*i].config.weight, total_weight)
                    .ok_or(StakingError::Overflow)?
            };
            assigned = assigned.saturating_add(share);
            shares.push((*i, share));
        }
        Ok(shares)
    }
}

/// The only account allowed to lock, unlock or slash pool stake.
///
/// The manager's `address` must hold [`Role::StakingManager`]; its own entry
/// points accept calls only from [`Role::Marketplace`].
pub struct StakingManager {
    address: Address,
    payment_token: Address,
    access: Arc<AccessControl>,
    ledger: Arc<TokenLedger>,
    state: RwLock<ManagerState>,
}

impl StakingManager {
    pub fn new(
        address: Address,
        payment_token: Address,
        access: Arc<AccessControl>,
        ledger: Arc<TokenLedger>,
    ) -> Self {
        Self {
            address,
            payment_token,
            access,
            ledger,
            state: RwLock::new(ManagerState::default()),
        }
    }

    /// Ledger account receiving the staking share of task fees.
    pub fn address(&self) -> Address {
        self.address
    }

    pub async fn add_pool(&self, caller: Address, pool: Arc<dyn StakingPool>, weight: u128) -> Result<()> {
        self.access.ensure(Role::Updater, caller).await?;
        let mut state = self.state.write().await;
        if state.pools.iter().any(|p| p.pool.name() == pool.name()) {
            return Err(StakingError::DuplicatePool(pool.name().to_string()));
        }
        info!(pool = pool.name(), weight, "➕ Staking pool registered");
        state.pools.push(RegisteredPool {
            pool,
            config: PoolConfig {
                weight,
                enabled: true,
            },
        });
        Ok(())
    }

    pub async fn set_pool_config(
        &self,
        caller: Address,
        name: &str,
        weight: u128,
        enabled: bool,
    ) -> Result<()> {
        self.access.ensure(Role::Updater, caller).await?;
        let mut state = self.state.write().await;
        let entry = state
            .pools
            .iter_mut()
            .find(|p| p.pool.name() == name)
            .ok_or_else(|| StakingError::UnknownPool(name.to_string()))?;
        entry.config = PoolConfig { weight, enabled };
        info!(pool = name, weight, enabled, "⚙️ Staking pool updated");
        Ok(())
    }

    pub async fn pools(&self) -> Vec<(String, PoolConfig)> {
        let state = self.state.read().await;
        state
            .pools
            .iter()
            .map(|p| (p.pool.name().to_string(), p.config))
            .collect()
    }

    /// Unlocked, weight-normalized stake of `prover` summed over enabled pools.
    pub async fn available_stake(&self, prover: &Address) -> Result<TokenAmount> {
        let state = self.state.read().await;
        let mut total = TokenAmount::ZERO;
        for i in state.enabled() {
            let available = state.pools[i].pool.available_stake(prover).await?;
            total = total.checked_add(available).ok_or(StakingError::Overflow)?;
        }
        Ok(total)
    }

    /// Lock `request.amount` across the enabled pools, all or nothing.
    pub async fn lock_stake(&self, caller: Address, request: &LockRequest) -> Result<()> {
        self.access.ensure(Role::Marketplace, caller).await?;
        let mut state = self.state.write().await;
        if state.locks.contains_key(&request.bid_id) {
            return Err(StakingError::LockAlreadyExists(request.bid_id));
        }
        let enabled = state.enabled();

        let mut available = TokenAmount::ZERO;
        for i in &enabled {
            let free = state.pools[*i].pool.available_stake(&request.prover).await?;
            available = available.saturating_add(free);
        }
        if enabled.is_empty() || available < request.amount {
            debug!(bid_id = request.bid_id, prover = %request.prover, required = %request.amount, available = %available, "Insufficient stake across pools");
            return Err(StakingError::InsufficientStakeToLock {
                pool: "all".to_string(),
                prover: request.prover,
                required: request.amount,
                available,
            });
        }

        let shares = state.split(&enabled, request.amount)?;
        let mut locked: Vec<LockShare> = Vec::with_capacity(shares.len());
        for (i, share) in &shares {
            if share.is_zero() {
                continue;
            }
            let pool = &state.pools[*i].pool;
            let leg = LockRequest {
                amount: *share,
                ..request.clone()
            };
            if let Err(e) = pool.lock(self.address, &leg).await {
                for (done, _) in &locked {
                    let done_pool = &state.pools[*done].pool;
                    if let Err(undo) = done_pool.unlock(self.address, request.bid_id, request.prover).await {
                        warn!(pool = done_pool.name(), bid_id = request.bid_id, error = %undo, "Lock rollback failed");
                    }
                }
                debug!(pool = pool.name(), bid_id = request.bid_id, error = %e, "Lock rolled back");
                return Err(e);
            }
            locked.push((*i, *share));
        }

        info!(
            bid_id = request.bid_id,
            prover = %request.prover,
            market_id = request.market_id,
            amount = %request.amount,
            pools = locked.len(),
            "🔒 Stake locked for task"
        );
        state.locks.insert(request.bid_id, locked);
        Ok(())
    }

    /// Every pool backing `bid_id` must still hold its lock before any of
    /// them is touched.
    async fn check_pools(state: &ManagerState, shares: &[LockShare], bid_id: BidId, prover: Address) -> Result<()> {
        for (i, _) in shares {
            let pool = &state.pools[*i].pool;
            if let Err(e) = pool.check_lock(bid_id, prover).await {
                debug!(pool = pool.name(), bid_id, error = %e, "Pool cannot act on lock");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Put back the pools a failed call did not reach so a retry only
    /// touches those.
    fn keep_unfinished(state: &mut ManagerState, bid_id: BidId, unfinished: Vec<LockShare>) {
        if !unfinished.is_empty() {
            state.locks.insert(bid_id, unfinished);
        }
    }

    /// Release every pool lock held for the task. Nothing changes unless
    /// every pool still holds its lock.
    pub async fn unlock_stake(&self, caller: Address, bid_id: BidId, prover: Address) -> Result<()> {
        self.access.ensure(Role::Marketplace, caller).await?;
        let mut state = self.state.write().await;
        let shares = state
            .locks
            .get(&bid_id)
            .cloned()
            .ok_or(StakingError::NoLockForBid(bid_id))?;
        Self::check_pools(&state, &shares, bid_id, prover).await?;

        state.locks.remove(&bid_id);
        for (n, (i, _)) in shares.iter().enumerate() {
            let pool = state.pools[*i].pool.clone();
            if let Err(e) = pool.unlock(self.address, bid_id, prover).await {
                warn!(pool = pool.name(), bid_id, error = %e, "Unlock failed");
                Self::keep_unfinished(&mut state, bid_id, shares[n..].to_vec());
                return Err(e);
            }
        }
        info!(bid_id, prover = %prover, "🔓 Task stake released");
        Ok(())
    }

    /// Distribute `fee`, already held by [`StakingManager::address`], to the
    /// pools that backed the task and release their locks.
    ///
    /// Every pool lock is checked first. A fee share whose pool then fails
    /// to settle is moved back to the manager.
    pub async fn on_task_completion(
        &self,
        caller: Address,
        bid_id: BidId,
        prover: Address,
        fee: TokenAmount,
    ) -> Result<()> {
        self.access.ensure(Role::Marketplace, caller).await?;
        let mut state = self.state.write().await;
        let shares = state
            .locks
            .get(&bid_id)
            .cloned()
            .ok_or(StakingError::NoLockForBid(bid_id))?;
        Self::check_pools(&state, &shares, bid_id, prover).await?;
        let indices: Vec<usize> = shares.iter().map(|(i, _)| *i).collect();
        let fee_shares = state.split(&indices, fee)?;

        state.locks.remove(&bid_id);
        for (n, (i, part)) in fee_shares.iter().enumerate() {
            let pool = state.pools[*i].pool.clone();
            let settled = match self
                .ledger
                .transfer(self.payment_token, self.address, pool.address(), *part, "staking fee share")
                .await
            {
                Ok(()) => match pool.on_task_completion(self.address, bid_id, prover, *part).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        if let Err(undo) = self
                            .ledger
                            .transfer(self.payment_token, pool.address(), self.address, *part, "revert")
                            .await
                        {
                            warn!(pool = pool.name(), bid_id, error = %undo, "Fee share revert failed");
                        }
                        Err(e)
                    }
                },
                Err(e) => Err(e.into()),
            };
            if let Err(e) = settled {
                warn!(pool = pool.name(), bid_id, error = %e, "Pool settlement failed");
                Self::keep_unfinished(&mut state, bid_id, shares[n..].to_vec());
                return Err(e);
            }
        }
        info!(bid_id, prover = %prover, fee = %fee, "✅ Task fee distributed to pools");
        Ok(())
    }

    /// Slash the pools that hold a lock for the task. Each pool forfeits
    /// the same fraction of its share. Returns the total seized.
    ///
    /// Nothing is seized unless every pool can be slashed. If a pool fails
    /// midway, the pools not yet slashed stay on record for a retry.
    pub async fn on_slash(&self, caller: Address, task: &SlashedTask) -> Result<TokenAmount> {
        self.access.ensure(Role::Marketplace, caller).await?;
        if task.reward_address.is_zero() {
            return Err(StakingError::ZeroAddress);
        }
        let mut state = self.state.write().await;
        let shares = state
            .locks
            .get(&task.bid_id)
            .cloned()
            .ok_or(StakingError::NotSlashable(task.bid_id))?;
        match Self::check_pools(&state, &shares, task.bid_id, task.prover).await {
            Ok(()) => {}
            Err(StakingError::NoLockForBid(bid_id) | StakingError::AwaitingExternalSlash(bid_id)) => {
                return Err(StakingError::NotSlashable(bid_id))
            }
            Err(e) => return Err(e),
        }

        let locked_total: TokenAmount = shares.iter().map(|(_, s)| *s).sum();
        let mut legs = Vec::with_capacity(shares.len());
        for (i, share) in &shares {
            let amount = if task.amount >= locked_total {
                *share
            } else {
                share
                    .proportion(task.amount.to_base_units(), locked_total.to_base_units())
                    .ok_or(StakingError::Overflow)?
            };
            legs.push((*i, amount));
        }

        state.locks.remove(&task.bid_id);
        let mut seized = TokenAmount::ZERO;
        for (n, (i, amount)) in legs.iter().enumerate() {
            let pool = state.pools[*i].pool.clone();
            let leg = SlashedTask {
                amount: *amount,
                ..task.clone()
            };
            match pool.slash(self.address, &leg).await {
                Ok(taken) => seized = seized.saturating_add(taken),
                Err(e) => {
                    warn!(pool = pool.name(), bid_id = task.bid_id, seized = %seized, error = %e, "Pool slash failed");
                    Self::keep_unfinished(&mut state, task.bid_id, shares[n..].to_vec());
                    return Err(e);
                }
            }
        }
        info!(
            bid_id = task.bid_id,
            prover = %task.prover,
            market_id = task.market_id,
            recipient = %task.reward_address,
            seized = %seized,
            "⚔️ Task stake slashed"
        );
        Ok(seized)
    }

    /// Pools holding a lock for `bid_id` and their shares.
    pub async fn locked_pools(&self, bid_id: BidId) -> Vec<(String, TokenAmount)> {
        let state = self.state.read().await;
        state
            .locks
            .get(&bid_id)
            .map(|shares| {
                shares
                    .iter()
                    .map(|(i, s)| (state.pools[*i].pool.name().to_string(), *s))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Per-pool stake entries of `prover`.
    pub async fn stake_entries(&self, prover: &Address) -> Vec<(String, StakeEntry)> {
        let state = self.state.read().await;
        let mut out = Vec::new();
        for registered in &state.pools {
            for entry in registered.pool.stake_entries(prover).await {
                out.push((registered.pool.name().to_string(), entry));
            }
        }
        out
    }
}
