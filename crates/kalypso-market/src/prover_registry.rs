//! Prover accounts and per-market membership.
//!
//! Compute is an abstract unit declared by the prover. Every assigned task
//! consumes its market's `compute_per_request_required` until it settles.

use crate::error::{MarketError, Result};
use kalypso_attestation::{prover_family, AttestationDocument, EntityKeyRegistry};
use kalypso_types::{
    AccessControl, Address, BlockInfo, EventBus, MarketEvent, MarketId, Role, TokenAmount,
    WEIGHT_SCALE,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const DEFAULT_PARALLEL_REQUESTS_UPPER_LIMIT: u64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProverRegistryConfig {
    /// Account holding the key registrar role for prover enclave keys.
    pub address: Address,
    pub parallel_requests_upper_limit: u64,
    /// Blocks between announcing a compute reduction and applying it.
    pub reduction_block_gap: u64,
}

impl Default for ProverRegistryConfig {
    fn default() -> Self {
        Self {
            address: Address::ZERO,
            parallel_requests_upper_limit: DEFAULT_PARALLEL_REQUESTS_UPPER_LIMIT,
            reduction_block_gap: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProverAccount {
    pub reward_address: Address,
    pub declared_compute: u128,
    pub compute_consumed: u128,
    pub active_marketplaces: u64,
    /// Fraction of declared compute open to new work, scaled by 1e18.
    pub intended_compute_utilization: u128,
    /// Block from which a pending reduction may be applied.
    pub reduction_ready_at: Option<u64>,
    pub prover_data: Vec<u8>,
}

impl ProverAccount {
    /// Compute that new assignments may draw on.
    pub fn assignable_compute(&self) -> u128 {
        kalypso_types::mul_div(
            self.declared_compute,
            self.intended_compute_utilization,
            WEIGHT_SCALE,
            false,
        )
        .unwrap_or(self.declared_compute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProverMarketState {
    Active,
    Inactive,
    Banned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProverInfoPerMarket {
    pub state: ProverMarketState,
    pub compute_per_request_required: u128,
    pub proof_generation_cost: TokenAmount,
    pub active_requests: u64,
}

#[derive(Default)]
struct RegistryState {
    accounts: HashMap<Address, ProverAccount>,
    memberships: HashMap<(Address, MarketId), ProverInfoPerMarket>,
}

impl RegistryState {
    fn account_mut(&mut self, prover: &Address) -> Result<&mut ProverAccount> {
        self.accounts
            .get_mut(prover)
            .ok_or(MarketError::ProverNotRegistered(*prover))
    }
}

pub struct ProverRegistry {
    config: ProverRegistryConfig,
    access: Arc<AccessControl>,
    keys: Arc<EntityKeyRegistry>,
    events: Arc<EventBus>,
    state: RwLock<RegistryState>,
}

impl ProverRegistry {
    pub fn new(
        config: ProverRegistryConfig,
        access: Arc<AccessControl>,
        keys: Arc<EntityKeyRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            access,
            keys,
            events,
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn parallel_requests_upper_limit(&self) -> u64 {
        self.config.parallel_requests_upper_limit
    }

    pub async fn register(
        &self,
        prover: Address,
        reward_address: Address,
        declared_compute: u128,
        prover_data: Vec<u8>,
    ) -> Result<()> {
        if prover.is_zero() || reward_address.is_zero() {
            return Err(MarketError::ZeroAddress);
        }
        if declared_compute == 0 {
            return Err(MarketError::InvalidCompute("declared compute is zero".into()));
        }
        let mut state = self.state.write().await;
        if state.accounts.contains_key(&prover) {
            return Err(MarketError::ProverAlreadyRegistered(prover));
        }
        state.accounts.insert(
            prover,
            ProverAccount {
                reward_address,
                declared_compute,
                compute_consumed: 0,
                active_marketplaces: 0,
                intended_compute_utilization: WEIGHT_SCALE,
                reduction_ready_at: None,
                prover_data,
            },
        );
        info!(prover = %prover, declared_compute, "🧑‍🔧 Prover registered");
        self.events.emit(MarketEvent::ProverRegistered {
            prover,
            declared_compute,
        });
        Ok(())
    }

    pub async fn deregister(&self, prover: Address) -> Result<()> {
        let mut state = self.state.write().await;
        let account = state.account_mut(&prover)?;
        if account.active_marketplaces > 0 {
            return Err(MarketError::CannotDeregisterWithActiveMarkets {
                prover,
                markets: account.active_marketplaces,
            });
        }
        state.accounts.remove(&prover);
        info!(prover = %prover, "👋 Prover deregistered");
        self.events.emit(MarketEvent::ProverDeregistered { prover });
        Ok(())
    }

    pub async fn update_reward_address(&self, prover: Address, reward_address: Address) -> Result<()> {
        if reward_address.is_zero() {
            return Err(MarketError::ZeroAddress);
        }
        let mut state = self.state.write().await;
        state.account_mut(&prover)?.reward_address = reward_address;
        debug!(prover = %prover, reward_address = %reward_address, "Reward address updated");
        Ok(())
    }

    pub async fn increase_declared_compute(&self, prover: Address, additional: u128) -> Result<u128> {
        let mut state = self.state.write().await;
        let account = state.account_mut(&prover)?;
        account.declared_compute = account
            .declared_compute
            .checked_add(additional)
            .ok_or(MarketError::Overflow)?;
        let (declared_compute, intended_utilization) =
            (account.declared_compute, account.intended_compute_utilization);
        info!(prover = %prover, declared_compute, "📈 Declared compute increased");
        self.events.emit(MarketEvent::ComputeChanged {
            prover,
            declared_compute,
            intended_utilization,
        });
        Ok(declared_compute)
    }

    /// First phase of a reduction: new assignments immediately see the
    /// reduced compute; the declaration shrinks after `reduction_block_gap`.
    pub async fn intend_to_reduce_compute(
        &self,
        prover: Address,
        new_utilization: u128,
        block: BlockInfo,
    ) -> Result<u64> {
        if new_utilization >= WEIGHT_SCALE {
            return Err(MarketError::InvalidUtilization(new_utilization));
        }
        let gap = self.config.reduction_block_gap;
        let mut state = self.state.write().await;
        let account = state.account_mut(&prover)?;
        let target = kalypso_types::mul_div(account.declared_compute, new_utilization, WEIGHT_SCALE, false)
            .ok_or(MarketError::Overflow)?;
        if target < account.compute_consumed {
            return Err(MarketError::InvalidCompute(format!(
                "reduced compute {} is below consumed {}",
                target, account.compute_consumed
            )));
        }
        let ready_at = block.number.saturating_add(gap);
        account.intended_compute_utilization = new_utilization;
        account.reduction_ready_at = Some(ready_at);
        let declared_compute = account.declared_compute;

        info!(prover = %prover, new_utilization, ready_at, "📉 Compute reduction scheduled");
        self.events.emit(MarketEvent::ComputeChanged {
            prover,
            declared_compute,
            intended_utilization: new_utilization,
        });
        Ok(ready_at)
    }

    pub async fn decrease_declared_compute(&self, prover: Address, block: BlockInfo) -> Result<u128> {
        let mut state = self.state.write().await;
        let account = state.account_mut(&prover)?;
        let ready_at = account
            .reduction_ready_at
            .ok_or(MarketError::ReductionNotRequested(prover))?;
        if block.number < ready_at {
            return Err(MarketError::ReductionTooEarly {
                ready_at,
                now: block.number,
            });
        }
        let reduced = account.assignable_compute();
        if reduced < account.compute_consumed || reduced == 0 {
            return Err(MarketError::InvalidCompute(format!(
                "reduced compute {} is below consumed {}",
                reduced, account.compute_consumed
            )));
        }
        account.declared_compute = reduced;
        account.intended_compute_utilization = WEIGHT_SCALE;
        account.reduction_ready_at = None;

        info!(prover = %prover, declared_compute = reduced, "📉 Declared compute reduced");
        self.events.emit(MarketEvent::ComputeChanged {
            prover,
            declared_compute: reduced,
            intended_utilization: WEIGHT_SCALE,
        });
        Ok(reduced)
    }

    /// Join `market_id` and bind the prover's enclave key to the market's
    /// key slot. Called by the marketplace once the market is known.
    #[allow(clippy::too_many_arguments)]
    pub async fn join_marketplace(
        &self,
        caller: Address,
        prover: Address,
        market_id: MarketId,
        compute_per_request_required: u128,
        proof_generation_cost: TokenAmount,
        pubkey: &[u8],
        attestation: &AttestationDocument,
        block: BlockInfo,
    ) -> Result<Address> {
        self.access.ensure(Role::Marketplace, caller).await?;
        let mut state = self.state.write().await;
        let declared = state.account_mut(&prover)?.declared_compute;
        if compute_per_request_required == 0 || compute_per_request_required > declared {
            return Err(MarketError::InvalidCompute(format!(
                "compute per request {} must be within declared {}",
                compute_per_request_required, declared
            )));
        }
        if state.memberships.contains_key(&(prover, market_id)) {
            return Err(MarketError::ProverAlreadyInMarket { prover, market_id });
        }

        let enclave = self
            .keys
            .update_pubkey(
                self.config.address,
                prover,
                market_id,
                pubkey,
                attestation,
                prover_family(market_id),
                block,
            )
            .await?;

        state.memberships.insert(
            (prover, market_id),
            ProverInfoPerMarket {
                state: ProverMarketState::Active,
                compute_per_request_required,
                proof_generation_cost,
                active_requests: 0,
            },
        );
        let account = state.account_mut(&prover)?;
        account.active_marketplaces = account.active_marketplaces.saturating_add(1);

        info!(
            prover = %prover,
            market_id,
            compute_per_request_required,
            proof_generation_cost = %proof_generation_cost,
            enclave = %enclave,
            "🤝 Prover joined market"
        );
        self.events.emit(MarketEvent::ProverJoinedMarket {
            prover,
            market_id,
            compute_per_request: compute_per_request_required,
        });
        Ok(enclave)
    }

    /// Stop taking new tasks in `market_id`; running tasks continue.
    pub async fn request_marketplace_exit(&self, prover: Address, market_id: MarketId) -> Result<()> {
        let mut state = self.state.write().await;
        let info = state
            .memberships
            .get_mut(&(prover, market_id))
            .ok_or(MarketError::InvalidProverStatePerMarket { prover, market_id })?;
        if info.state != ProverMarketState::Active {
            return Err(MarketError::InvalidProverStatePerMarket { prover, market_id });
        }
        info.state = ProverMarketState::Inactive;
        info!(prover = %prover, market_id, "🚪 Prover exit requested");
        Ok(())
    }

    pub async fn leave_marketplace(&self, prover: Address, market_id: MarketId) -> Result<()> {
        let mut state = self.state.write().await;
        let info = state
            .memberships
            .get(&(prover, market_id))
            .ok_or(MarketError::InvalidProverStatePerMarket { prover, market_id })?;
        if info.active_requests > 0 {
            return Err(MarketError::CannotLeaveMarketWithActiveRequest {
                prover,
                market_id,
                active: info.active_requests,
            });
        }
        if info.state == ProverMarketState::Banned {
            return Err(MarketError::InvalidProverStatePerMarket { prover, market_id });
        }

        match self
            .keys
            .remove_pubkey(self.config.address, prover, market_id)
            .await
        {
            Ok(()) | Err(kalypso_attestation::AttestationError::KeyNotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        state.memberships.remove(&(prover, market_id));
        let account = state.account_mut(&prover)?;
        account.active_marketplaces = account.active_marketplaces.saturating_sub(1);

        info!(prover = %prover, market_id, "👋 Prover left market");
        self.events.emit(MarketEvent::ProverLeftMarket { prover, market_id });
        Ok(())
    }

    pub async fn ban_prover(&self, caller: Address, prover: Address, market_id: MarketId) -> Result<()> {
        self.access.ensure(Role::Admin, caller).await?;
        let mut state = self.state.write().await;
        let info = state
            .memberships
            .get_mut(&(prover, market_id))
            .ok_or(MarketError::InvalidProverStatePerMarket { prover, market_id })?;
        info.state = ProverMarketState::Banned;
        info!(prover = %prover, market_id, "⛔ Prover banned from market");
        Ok(())
    }

    /// Check that one more task fits. Returns the market terms.
    pub async fn check_capacity(&self, prover: &Address, market_id: MarketId) -> Result<ProverInfoPerMarket> {
        let state = self.state.read().await;
        Self::capacity(&state, self.config.parallel_requests_upper_limit, prover, market_id)
    }

    fn capacity(
        state: &RegistryState,
        limit: u64,
        prover: &Address,
        market_id: MarketId,
    ) -> Result<ProverInfoPerMarket> {
        let account = state
            .accounts
            .get(prover)
            .ok_or(MarketError::ProverNotRegistered(*prover))?;
        let info = state
            .memberships
            .get(&(*prover, market_id))
            .ok_or(MarketError::ProverNotActive {
                prover: *prover,
                market_id,
            })?;
        if info.state != ProverMarketState::Active {
            return Err(MarketError::ProverNotActive {
                prover: *prover,
                market_id,
            });
        }
        let assignable = account.assignable_compute();
        let available = assignable.saturating_sub(account.compute_consumed);
        if info.compute_per_request_required > available {
            return Err(MarketError::InsufficientGeneratorComputeAvailable {
                prover: *prover,
                required: info.compute_per_request_required,
                available,
            });
        }
        if info.active_requests >= limit {
            return Err(MarketError::MaxParallelRequestsPerMarketExceeded {
                prover: *prover,
                market_id,
                limit,
            });
        }
        Ok(info.clone())
    }

    pub async fn on_task_assigned(&self, caller: Address, prover: Address, market_id: MarketId) -> Result<()> {
        self.access.ensure(Role::Marketplace, caller).await?;
        let mut state = self.state.write().await;
        let info = Self::capacity(&state, self.config.parallel_requests_upper_limit, &prover, market_id)?;
        if let Some(entry) = state.memberships.get_mut(&(prover, market_id)) {
            entry.active_requests += 1;
        }
        let account = state.account_mut(&prover)?;
        account.compute_consumed = account
            .compute_consumed
            .saturating_add(info.compute_per_request_required);
        debug!(prover = %prover, market_id, consumed = account.compute_consumed, "Compute reserved");
        Ok(())
    }

    pub async fn on_task_released(&self, caller: Address, prover: Address, market_id: MarketId) -> Result<()> {
        self.access.ensure(Role::Marketplace, caller).await?;
        let mut state = self.state.write().await;
        let released = match state.memberships.get_mut(&(prover, market_id)) {
            Some(entry) => {
                entry.active_requests = entry.active_requests.saturating_sub(1);
                entry.compute_per_request_required
            }
            None => return Err(MarketError::InvalidProverStatePerMarket { prover, market_id }),
        };
        let account = state.account_mut(&prover)?;
        account.compute_consumed = account.compute_consumed.saturating_sub(released);
        debug!(prover = %prover, market_id, consumed = account.compute_consumed, "Compute released");
        Ok(())
    }

    pub async fn account(&self, prover: &Address) -> Option<ProverAccount> {
        self.state.read().await.accounts.get(prover).cloned()
    }

    pub async fn market_info(&self, prover: &Address, market_id: MarketId) -> Option<ProverInfoPerMarket> {
        self.state
            .read()
            .await
            .memberships
            .get(&(*prover, market_id))
            .cloned()
    }
}
