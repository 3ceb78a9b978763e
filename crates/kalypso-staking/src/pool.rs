use crate::error::{Result, StakingError};
use async_trait::async_trait;
use kalypso_types::{Address, BidId, MarketId, TokenAmount};
use serde::{Deserialize, Serialize};

/// Normalized stake to commit for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub bid_id: BidId,
    pub prover: Address,
    pub market_id: MarketId,
    pub amount: TokenAmount,
}

/// Slash instruction. `amount` is normalized and capped at what the pool
/// holds locked for the bid; the rest of the lock is released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashedTask {
    pub bid_id: BidId,
    pub prover: Address,
    pub market_id: MarketId,
    pub reward_address: Address,
    pub amount: TokenAmount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeEntry {
    pub token: Address,
    pub total: TokenAmount,
    pub locked: TokenAmount,
}

/// Raw token amount committed from one stake token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLeg {
    pub token: Address,
    pub raw: TokenAmount,
    pub normalized: TokenAmount,
}

#[async_trait]
pub trait StakingPool: Send + Sync {
    fn name(&self) -> &str;

    /// Ledger account holding this pool's tokens.
    fn address(&self) -> Address;

    /// Unlocked stake of `prover`, weight-normalized across tokens.
    async fn available_stake(&self, prover: &Address) -> Result<TokenAmount>;

    async fn lock(&self, caller: Address, request: &LockRequest) -> Result<TokenAmount>;

    async fn unlock(&self, caller: Address, bid_id: BidId, prover: Address) -> Result<()>;

    /// Passes when the pool holds a live lock for `bid_id` owned by
    /// `prover` that can still be released or slashed. Changes nothing.
    async fn check_lock(&self, bid_id: BidId, prover: Address) -> Result<()>;

    /// Returns the normalized amount forfeited.
    async fn slash(&self, caller: Address, task: &SlashedTask) -> Result<TokenAmount>;

    /// Release the lock and credit `fee`, already transferred to
    /// [`StakingPool::address`], to the pool's reward accounting.
    async fn on_task_completion(
        &self,
        caller: Address,
        bid_id: BidId,
        prover: Address,
        fee: TokenAmount,
    ) -> Result<()>;

    async fn stake_entries(&self, prover: &Address) -> Vec<StakeEntry>;

    async fn claim_rewards(&self, account: Address) -> Result<TokenAmount>;
}

/// Token weights ordered for lock planning: heaviest first, ties by address.
pub(crate) fn lock_order(weights: impl Iterator<Item = (Address, u128)>) -> Vec<(Address, u128)> {
    let mut ordered: Vec<(Address, u128)> = weights.filter(|(_, w)| *w > 0).collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ordered
}

pub(crate) fn normalized_free(
    ordered: &[(Address, u128)],
    free: impl Fn(&Address) -> TokenAmount,
) -> Result<TokenAmount> {
    let mut total = TokenAmount::ZERO;
    for (token, weight) in ordered {
        let value = free(token).apply_rate(*weight).ok_or(StakingError::Overflow)?;
        total = total.checked_add(value).ok_or(StakingError::Overflow)?;
    }
    Ok(total)
}

/// Greedy plan covering `target` from free balances. `None` when the free
/// balances cannot cover it.
pub(crate) fn plan_lock(
    ordered: &[(Address, u128)],
    free: impl Fn(&Address) -> TokenAmount,
    target: TokenAmount,
) -> Result<Option<Vec<LockLeg>>> {
    let mut remaining = target;
    let mut legs = Vec::new();
    for (token, weight) in ordered {
        if remaining.is_zero() {
            break;
        }
        let free_raw = free(token);
        if free_raw.is_zero() {
            continue;
        }
        let free_norm = free_raw.apply_rate(*weight).ok_or(StakingError::Overflow)?;
        let raw = if free_norm >= remaining {
            remaining
                .unapply_rate_ceil(*weight)
                .ok_or(StakingError::Overflow)?
                .min(free_raw)
        } else {
            free_raw
        };
        let covered = raw
            .apply_rate(*weight)
            .ok_or(StakingError::Overflow)?
            .min(remaining);
        if covered.is_zero() {
            continue;
        }
        legs.push(LockLeg {
            token: *token,
            raw,
            normalized: covered,
        });
        remaining = remaining.saturating_sub(covered);
    }
    Ok(if remaining.is_zero() { Some(legs) } else { None })
}

/// Split a lock into the raw amounts forfeited per leg for a normalized
/// slash of `amount`. Legs are consumed in order.
pub(crate) fn slash_split(legs: &[LockLeg], amount: TokenAmount, weight_of: impl Fn(&Address) -> u128) -> Result<Vec<(Address, TokenAmount)>> {
    let mut remaining = amount;
    let mut out = Vec::new();
    for leg in legs {
        if remaining.is_zero() {
            break;
        }
        if leg.normalized <= remaining {
            out.push((leg.token, leg.raw));
            remaining = remaining.saturating_sub(leg.normalized);
        } else {
            let weight = weight_of(&leg.token);
            let raw = if weight == 0 {
                leg.raw
            } else {
                remaining
                    .unapply_rate_ceil(weight)
                    .ok_or(StakingError::Overflow)?
                    .min(leg.raw)
            };
            out.push((leg.token, raw));
            remaining = TokenAmount::ZERO;
        }
    }
    Ok(out)
}
