//! Bid → task → settlement state machine.
//!
//! Rewards are escrowed in [`MarketplaceConfig::address`] from bid creation
//! until settlement. Every transition holds the marketplace write lock for
//! its whole duration, so transitions apply one at a time, and a failing
//! transition undoes the external effects it already made before returning.

use crate::error::{MarketError, Result};
use crate::metrics::MarketMetrics;
use crate::prover_registry::ProverRegistry;
use crate::types::{Bid, BidState, MarketInfo, MarketParams, SecretType, TaskInfo};
use crate::verifier::ProofVerifier;
use kalypso_attestation::{
    ivs_family, prover_family, AttestationDocument, EntityKeyRegistry, Measurements,
};
use kalypso_crypto::{recover_signer, Keccak, RecoverableSignature};
use kalypso_ledger::TokenLedger;
use kalypso_staking::{LockRequest, SlashedTask, StakingManager};
use kalypso_types::{
    AccessControl, Address, BidId, BlockInfo, EventBus, FamilyId, ImageId, MarketEvent, MarketId,
    Role, TokenAmount, H256, WEIGHT_SCALE,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// IVS keys live in their own slot range so an operator can hold both a
/// prover key and an IVS key for the same market.
const IVS_SLOT_FLAG: u64 = 1 << 63;

/// Key registry slot holding an operator's IVS key for `market_id`.
pub fn ivs_key_slot(market_id: MarketId) -> u64 {
    market_id | IVS_SLOT_FLAG
}

/// Digest an enclave signs to flag a bid's inputs as unprovable.
pub fn invalid_inputs_digest(bid_id: BidId, prover_data: &[u8]) -> H256 {
    let mut hasher = Keccak::new();
    hasher.update_u64(bid_id).update(prover_data);
    hasher.finalize()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketplaceConfig {
    /// Escrow account. Also the caller identity towards the staking
    /// manager, the prover registry and the key registry.
    pub address: Address,
    pub payment_token: Address,
    pub treasury: Address,
    pub market_creation_cost: TokenAmount,
    /// Platform fee per input byte of a private bid.
    pub cost_per_input_byte: TokenAmount,
    /// Fraction of each fee routed to the staking pools, scaled by 1e18.
    pub staking_fee_share: u128,
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            address: Address::ZERO,
            payment_token: Address::ZERO,
            treasury: Address::ZERO,
            market_creation_cost: TokenAmount::ZERO,
            cost_per_input_byte: TokenAmount::from_base_units(1_000),
            staking_fee_share: WEIGHT_SCALE / 10,
        }
    }
}

#[derive(Debug, Clone)]
struct BidRecord {
    bid: Bid,
    requester: Address,
    state: BidState,
    secret_type: SecretType,
    platform_fee: TokenAmount,
    acl: Vec<u8>,
}

#[derive(Default)]
struct MarketplaceState {
    markets: HashMap<MarketId, MarketInfo>,
    verifiers: HashMap<MarketId, Arc<dyn ProofVerifier>>,
    bids: HashMap<BidId, BidRecord>,
    tasks: HashMap<BidId, TaskInfo>,
    next_market_id: MarketId,
    next_bid_id: BidId,
}

impl MarketplaceState {
    fn market(&self, market_id: MarketId) -> Result<&MarketInfo> {
        self.markets
            .get(&market_id)
            .ok_or(MarketError::MarketNotFound(market_id))
    }

    fn record(&self, bid_id: BidId) -> Result<&BidRecord> {
        self.bids.get(&bid_id).ok_or(MarketError::BidNotFound(bid_id))
    }

    /// The live task of an assigned bid.
    fn assigned(&self, bid_id: BidId) -> Result<(BidRecord, TaskInfo)> {
        let record = self.record(bid_id)?;
        if record.state != BidState::Assigned {
            return Err(MarketError::InvalidBidState {
                bid_id,
                state: record.state,
            });
        }
        let task = self
            .tasks
            .get(&bid_id)
            .cloned()
            .ok_or(MarketError::BidNotFound(bid_id))?;
        Ok((record.clone(), task))
    }

    fn set_state(&mut self, bid_id: BidId, state: BidState) {
        if let Some(record) = self.bids.get_mut(&bid_id) {
            record.state = state;
        }
    }
}

enum ImageRole {
    Prover,
    Ivs,
}

impl ImageRole {
    fn family(&self, market_id: MarketId) -> FamilyId {
        match self {
            ImageRole::Prover => prover_family(market_id),
            ImageRole::Ivs => ivs_family(market_id),
        }
    }
}

pub struct ProofMarketplace {
    config: MarketplaceConfig,
    access: Arc<AccessControl>,
    ledger: Arc<TokenLedger>,
    keys: Arc<EntityKeyRegistry>,
    provers: Arc<ProverRegistry>,
    staking: Arc<StakingManager>,
    events: Arc<EventBus>,
    metrics: Option<Arc<MarketMetrics>>,
    state: RwLock<MarketplaceState>,
}

impl ProofMarketplace {
    pub fn new(
        config: MarketplaceConfig,
        access: Arc<AccessControl>,
        ledger: Arc<TokenLedger>,
        keys: Arc<EntityKeyRegistry>,
        provers: Arc<ProverRegistry>,
        staking: Arc<StakingManager>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            access,
            ledger,
            keys,
            provers,
            staking,
            events,
            metrics: None,
            state: RwLock::new(MarketplaceState {
                next_market_id: 1,
                next_bid_id: 1,
                ..Default::default()
            }),
        }
    }

    pub fn set_metrics(&mut self, metrics: Arc<MarketMetrics>) {
        self.metrics = Some(metrics);
    }

    pub fn config(&self) -> &MarketplaceConfig {
        &self.config
    }

    pub fn prover_registry(&self) -> &Arc<ProverRegistry> {
        &self.provers
    }

    fn observe(&self, f: impl FnOnce(&MarketMetrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }

    async fn pay(&self, from: Address, to: Address, amount: TokenAmount, memo: &str) -> Result<()> {
        self.ledger
            .transfer(self.config.payment_token, from, to, amount, memo)
            .await?;
        Ok(())
    }

    async fn unwind_payment(&self, from: Address, to: Address, amount: TokenAmount, memo: &str) {
        if let Err(e) = self.pay(from, to, amount, memo).await {
            warn!(from = %from, to = %to, amount = %amount, error = %e, "Rollback transfer failed");
        }
    }

    // Markets

    pub async fn create_marketplace(&self, creator: Address, params: MarketParams) -> Result<MarketId> {
        if creator.is_zero() {
            return Err(MarketError::ZeroAddress);
        }
        params.prover_image.validate()?;
        params.ivs_image.validate()?;

        let mut state = self.state.write().await;
        let market_id = state.next_market_id;
        let creation_cost = self.config.market_creation_cost;
        self.pay(creator, self.config.treasury, creation_cost, "market creation")
            .await?;

        let images = self.install_default_images(market_id, &params).await;
        let (prover_image_id, ivs_image_id) = match images {
            Ok(ids) => ids,
            Err(e) => {
                self.unwind_payment(self.config.treasury, creator, creation_cost, "market creation refund")
                    .await;
                return Err(e);
            }
        };

        let info = MarketInfo {
            market_id,
            creator,
            prover_image_id,
            ivs_image_id,
            prover_family: prover_family(market_id),
            ivs_family: ivs_family(market_id),
            slashing_penalty: params.slashing_penalty,
            metadata: params.metadata,
        };
        state.markets.insert(market_id, info);
        state.verifiers.insert(market_id, params.verifier);
        state.next_market_id += 1;

        info!(
            market_id,
            creator = %creator,
            prover_image = %prover_image_id,
            ivs_image = %ivs_image_id,
            slashing_penalty = %params.slashing_penalty,
            "🏪 Market created"
        );
        self.events.emit(MarketEvent::MarketCreated {
            market_id,
            creator,
            prover_image: prover_image_id,
            ivs_image: ivs_image_id,
        });
        Ok(market_id)
    }

    async fn install_default_images(
        &self,
        market_id: MarketId,
        params: &MarketParams,
    ) -> Result<(ImageId, ImageId)> {
        let mut ids = Vec::with_capacity(2);
        for (family, measurements) in [
            (prover_family(market_id), &params.prover_image),
            (ivs_family(market_id), &params.ivs_image),
        ] {
            let image_id = self
                .keys
                .whitelist_image_using_pcrs(self.config.address, family, measurements.clone())
                .await?;
            self.keys
                .protect_default_image(self.config.address, family, image_id)
                .await?;
            ids.push(image_id);
        }
        Ok((ids[0], ids[1]))
    }

    async fn ensure_creator(&self, caller: Address, market_id: MarketId) -> Result<()> {
        let state = self.state.read().await;
        if state.market(market_id)?.creator != caller {
            return Err(MarketError::OnlyMarketCreator { market_id, caller });
        }
        Ok(())
    }

    async fn add_image(
        &self,
        caller: Address,
        market_id: MarketId,
        role: ImageRole,
        measurements: Measurements,
    ) -> Result<ImageId> {
        self.ensure_creator(caller, market_id).await?;
        let family = role.family(market_id);
        let image_id = self
            .keys
            .whitelist_image_using_pcrs(self.config.address, family, measurements)
            .await?;
        debug!(market_id, image_id = %image_id, "Extra image added");
        Ok(image_id)
    }

    async fn remove_image(
        &self,
        caller: Address,
        market_id: MarketId,
        role: ImageRole,
        measurements: &Measurements,
    ) -> Result<ImageId> {
        let family = role.family(market_id);
        let image_id = measurements.image_id();
        if self.keys.default_image(&family).await == Some(image_id) {
            return Err(kalypso_attestation::AttestationError::CannotRemoveDefaultImageFromMarket {
                image_id,
                family_id: family,
            }
            .into());
        }
        self.ensure_creator(caller, market_id).await?;
        let removed = self
            .keys
            .remove_image_from_family(self.config.address, family, measurements)
            .await?;
        debug!(market_id, image_id = %removed, "Extra image removed");
        Ok(removed)
    }

    pub async fn add_extra_prover_image(
        &self,
        caller: Address,
        market_id: MarketId,
        measurements: Measurements,
    ) -> Result<ImageId> {
        self.add_image(caller, market_id, ImageRole::Prover, measurements).await
    }

    pub async fn add_extra_ivs_image(
        &self,
        caller: Address,
        market_id: MarketId,
        measurements: Measurements,
    ) -> Result<ImageId> {
        self.add_image(caller, market_id, ImageRole::Ivs, measurements).await
    }

    /// The market's default image cannot be removed by anyone.
    pub async fn remove_extra_prover_image(
        &self,
        caller: Address,
        market_id: MarketId,
        measurements: &Measurements,
    ) -> Result<ImageId> {
        self.remove_image(caller, market_id, ImageRole::Prover, measurements).await
    }

    pub async fn remove_extra_ivs_image(
        &self,
        caller: Address,
        market_id: MarketId,
        measurements: &Measurements,
    ) -> Result<ImageId> {
        self.remove_image(caller, market_id, ImageRole::Ivs, measurements).await
    }

    // Provers and IVS operators

    #[allow(clippy::too_many_arguments)]
    pub async fn join_marketplace(
        &self,
        prover: Address,
        market_id: MarketId,
        compute_per_request_required: u128,
        proof_generation_cost: TokenAmount,
        pubkey: &[u8],
        attestation: &AttestationDocument,
        block: BlockInfo,
    ) -> Result<Address> {
        {
            let state = self.state.read().await;
            state.market(market_id)?;
        }
        self.provers
            .join_marketplace(
                self.config.address,
                prover,
                market_id,
                compute_per_request_required,
                proof_generation_cost,
                pubkey,
                attestation,
                block,
            )
            .await
    }

    pub async fn register_ivs_key(
        &self,
        operator: Address,
        market_id: MarketId,
        pubkey: &[u8],
        attestation: &AttestationDocument,
        block: BlockInfo,
    ) -> Result<Address> {
        {
            let state = self.state.read().await;
            state.market(market_id)?;
        }
        let enclave = self
            .keys
            .update_pubkey(
                self.config.address,
                operator,
                ivs_key_slot(market_id),
                pubkey,
                attestation,
                ivs_family(market_id),
                block,
            )
            .await?;
        info!(operator = %operator, market_id, enclave = %enclave, "🛡️ IVS key registered");
        Ok(enclave)
    }

    /// Drop the operator's IVS key for `market_id`. Its enclave can no
    /// longer flag inputs in this market.
    pub async fn remove_ivs_key(&self, operator: Address, market_id: MarketId) -> Result<()> {
        self.keys
            .remove_pubkey(self.config.address, operator, ivs_key_slot(market_id))
            .await?;
        info!(operator = %operator, market_id, "🗑️ IVS key removed");
        Ok(())
    }

    // Bids

    pub fn platform_fee(&self, bid: &Bid, private_inputs: &[u8], acl: &[u8]) -> Result<TokenAmount> {
        let bytes = (bid.prover_data.len() + private_inputs.len() + acl.len()) as u128;
        self.config
            .cost_per_input_byte
            .to_base_units()
            .checked_mul(bytes)
            .map(TokenAmount::from_base_units)
            .ok_or(MarketError::Overflow)
    }

    pub async fn create_bid(
        &self,
        requester: Address,
        bid: Bid,
        secret_type: SecretType,
        private_inputs: &[u8],
        acl: &[u8],
        block: BlockInfo,
    ) -> Result<BidId> {
        if bid.reward.is_zero() {
            return Err(MarketError::ZeroReward);
        }
        if bid.prover_data.is_empty() {
            return Err(MarketError::EmptyProverData);
        }
        if bid.refund_address.is_zero() {
            return Err(MarketError::ZeroAddress);
        }
        if bid.expiry <= block.number {
            return Err(MarketError::InvalidBid(format!(
                "expiry {} is not after block {}",
                bid.expiry, block.number
            )));
        }
        let earliest = block.number.saturating_add(bid.time_for_proof_generation);
        if bid.deadline < earliest {
            return Err(MarketError::InvalidBid(format!(
                "deadline {} is before the earliest completion {}",
                bid.deadline, earliest
            )));
        }

        let mut state = self.state.write().await;
        let verifier = state
            .verifiers
            .get(&bid.market_id)
            .cloned()
            .ok_or(MarketError::MarketNotFound(bid.market_id))?;
        match verifier.verify_inputs(&bid.prover_data) {
            Ok(true) => {}
            Ok(false) => return Err(MarketError::InputsRejected),
            Err(e) => {
                warn!(market_id = bid.market_id, error = %e, "Input screening failed");
                return Err(MarketError::InputsRejected);
            }
        }

        let platform_fee = match secret_type {
            SecretType::Public => TokenAmount::ZERO,
            SecretType::Private => self.platform_fee(&bid, private_inputs, acl)?,
        };

        self.pay(requester, self.config.address, bid.reward, "bid reward escrow")
            .await?;
        if let Err(e) = self
            .pay(requester, self.config.treasury, platform_fee, "platform fee")
            .await
        {
            self.unwind_payment(self.config.address, requester, bid.reward, "bid reward refund")
                .await;
            return Err(e);
        }

        let bid_id = state.next_bid_id;
        state.next_bid_id += 1;
        let (market_id, reward) = (bid.market_id, bid.reward);
        state.bids.insert(
            bid_id,
            BidRecord {
                bid,
                requester,
                state: BidState::Created,
                secret_type,
                platform_fee,
                acl: acl.to_vec(),
            },
        );

        info!(
            bid_id,
            market_id,
            requester = %requester,
            reward = %reward,
            platform_fee = %platform_fee,
            ?secret_type,
            "📝 Bid created"
        );
        self.events.emit(MarketEvent::BidCreated {
            bid_id,
            market_id,
            requester,
            reward,
            platform_fee,
        });
        self.observe(|m| m.bids_created.inc());
        Ok(bid_id)
    }

    /// Requester reclaims the reward of a bid that was never assigned.
    pub async fn cancel_bid(&self, caller: Address, bid_id: BidId) -> Result<TokenAmount> {
        let mut state = self.state.write().await;
        let record = state.record(bid_id)?;
        if record.requester != caller {
            return Err(MarketError::OnlyRequester { bid_id, caller });
        }
        if record.state != BidState::Created {
            return Err(MarketError::InvalidBidState {
                bid_id,
                state: record.state,
            });
        }
        let (refund_address, refund) = (record.bid.refund_address, record.bid.reward);

        self.pay(self.config.address, refund_address, refund, "bid cancelled")
            .await?;
        state.set_state(bid_id, BidState::Cancelled);

        info!(bid_id, refund = %refund, "🚫 Bid cancelled");
        self.events.emit(MarketEvent::BidCancelled { bid_id, refund });
        Ok(refund)
    }

    // Tasks

    pub async fn assign_task(
        &self,
        caller: Address,
        bid_id: BidId,
        prover: Address,
        new_acl: Vec<u8>,
        block: BlockInfo,
    ) -> Result<TaskInfo> {
        self.access.ensure(Role::MatchingEngine, caller).await?;
        let mut state = self.state.write().await;
        let result = self
            .try_assign(&mut state, bid_id, prover, new_acl, block)
            .await;
        match &result {
            Ok(task) => {
                info!(
                    bid_id,
                    prover = %prover,
                    fee_paid = %task.fee_paid,
                    deadline = task.deadline,
                    "🎯 Task assigned"
                );
                self.observe(|m| {
                    m.tasks_assigned.inc();
                    m.open_tasks.inc();
                });
            }
            Err(e) => {
                debug!(bid_id, prover = %prover, error = %e, "Assignment rejected");
                self.observe(|m| m.assignment_failures.inc());
            }
        }
        result
    }

    async fn try_assign(
        &self,
        state: &mut MarketplaceState,
        bid_id: BidId,
        prover: Address,
        new_acl: Vec<u8>,
        block: BlockInfo,
    ) -> Result<TaskInfo> {
        let record = state.record(bid_id)?.clone();
        if record.state != BidState::Created {
            return Err(MarketError::InvalidBidState {
                bid_id,
                state: record.state,
            });
        }
        let bid = &record.bid;
        if block.number > bid.expiry {
            return Err(MarketError::BidExpired {
                bid_id,
                expiry: bid.expiry,
            });
        }
        let market = state.market(bid.market_id)?.clone();

        let terms = self.provers.check_capacity(&prover, bid.market_id).await?;
        if bid.reward < terms.proof_generation_cost {
            return Err(MarketError::RewardBelowProofCost {
                reward: bid.reward,
                cost: terms.proof_generation_cost,
            });
        }
        let deadline = block.number.saturating_add(bid.time_for_proof_generation);
        if deadline > bid.deadline {
            return Err(MarketError::DeadlineTooShort {
                task_deadline: deadline,
                bid_deadline: bid.deadline,
            });
        }
        let fee_paid = terms.proof_generation_cost;
        let refund = bid
            .reward
            .checked_sub(fee_paid)
            .ok_or(MarketError::Overflow)?;

        self.staking
            .lock_stake(
                self.config.address,
                &LockRequest {
                    bid_id,
                    prover,
                    market_id: bid.market_id,
                    amount: market.slashing_penalty,
                },
            )
            .await?;

        if let Err(e) = self
            .provers
            .on_task_assigned(self.config.address, prover, bid.market_id)
            .await
        {
            self.release_stake(bid_id, prover).await;
            return Err(e);
        }

        if let Err(e) = self
            .pay(self.config.address, bid.refund_address, refund, "unused reward refund")
            .await
        {
            self.release_compute(bid_id, prover, bid.market_id).await;
            self.release_stake(bid_id, prover).await;
            return Err(e);
        }

        let task = TaskInfo {
            requester: record.requester,
            prover,
            fee_paid,
            deadline,
        };
        state.tasks.insert(bid_id, task.clone());
        if let Some(stored) = state.bids.get_mut(&bid_id) {
            stored.state = BidState::Assigned;
            stored.acl = new_acl;
        }
        self.events.emit(MarketEvent::TaskAssigned {
            bid_id,
            market_id: bid.market_id,
            prover,
            fee_paid,
            deadline,
        });
        Ok(task)
    }

    async fn release_stake(&self, bid_id: BidId, prover: Address) {
        if let Err(e) = self.staking.unlock_stake(self.config.address, bid_id, prover).await {
            warn!(bid_id, prover = %prover, error = %e, "Stake rollback failed");
        }
    }

    async fn release_compute(&self, bid_id: BidId, prover: Address, market_id: MarketId) {
        if let Err(e) = self
            .provers
            .on_task_released(self.config.address, prover, market_id)
            .await
        {
            warn!(bid_id, prover = %prover, error = %e, "Compute release failed");
        }
    }

    pub async fn submit_proof(&self, bid_id: BidId, proof: &[u8], block: BlockInfo) -> Result<TokenAmount> {
        let mut state = self.state.write().await;
        let (record, task) = state.assigned(bid_id)?;
        let market_id = record.bid.market_id;
        if block.number > task.deadline {
            return Err(MarketError::DeadlinePassed {
                bid_id,
                deadline: task.deadline,
            });
        }
        let verifier = state
            .verifiers
            .get(&market_id)
            .cloned()
            .ok_or(MarketError::MarketNotFound(market_id))?;

        let accepted = match verifier.verify(&record.bid.prover_data, proof) {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(bid_id, market_id, error = %e, "Verifier failed");
                false
            }
        };
        if !accepted {
            warn!(bid_id, prover = %task.prover, "❌ Proof rejected");
            self.observe(|m| m.proofs_rejected.inc());
            return Err(MarketError::InvalidProof { bid_id });
        }

        let reward_address = self
            .provers
            .account(&task.prover)
            .await
            .map(|a| a.reward_address)
            .ok_or(MarketError::ProverNotRegistered(task.prover))?;
        let staking_share = task
            .fee_paid
            .apply_rate(self.config.staking_fee_share)
            .ok_or(MarketError::Overflow)?;
        let payout = task.fee_paid.saturating_sub(staking_share);

        let manager = self.staking.address();
        self.pay(self.config.address, manager, staking_share, "staking fee share")
            .await?;
        if let Err(e) = self
            .staking
            .on_task_completion(self.config.address, bid_id, task.prover, staking_share)
            .await
        {
            self.unwind_payment(manager, self.config.address, staking_share, "staking fee share refund")
                .await;
            return Err(e.into());
        }
        self.pay(self.config.address, reward_address, payout, "proof payout")
            .await?;
        self.release_compute(bid_id, task.prover, market_id).await;

        state.tasks.remove(&bid_id);
        state.set_state(bid_id, BidState::Completed);

        info!(
            bid_id,
            prover = %task.prover,
            payout = %payout,
            staking_share = %staking_share,
            "✅ Proof accepted"
        );
        self.events.emit(MarketEvent::ProofAccepted {
            bid_id,
            prover: task.prover,
            payout,
        });
        self.observe(|m| {
            m.proofs_accepted.inc();
            m.open_tasks.dec();
        });
        Ok(payout)
    }

    /// Close a task whose inputs an enclave of the assigned prover, or any
    /// IVS enclave of the market, attests to be unprovable.
    pub async fn submit_proof_for_invalid_inputs(
        &self,
        bid_id: BidId,
        signature: &RecoverableSignature,
        block: BlockInfo,
    ) -> Result<Address> {
        let mut state = self.state.write().await;
        let (record, task) = state.assigned(bid_id)?;
        let market_id = record.bid.market_id;
        if block.number > task.deadline {
            return Err(MarketError::DeadlinePassed {
                bid_id,
                deadline: task.deadline,
            });
        }

        let digest = invalid_inputs_digest(bid_id, &record.bid.prover_data);
        let signer = recover_signer(&digest, signature)?;
        let family = if self.keys.enclave_address_of(&task.prover, market_id).await == Some(signer) {
            prover_family(market_id)
        } else {
            ivs_family(market_id)
        };
        if let Err(e) = self.keys.allow_only_verified_family(&family, &signer).await {
            warn!(bid_id, signer = %signer, error = %e, "Invalid inputs attestation rejected");
            return Err(e.into());
        }

        self.staking
            .unlock_stake(self.config.address, bid_id, task.prover)
            .await?;
        self.pay(
            self.config.address,
            record.bid.refund_address,
            task.fee_paid,
            "invalid inputs refund",
        )
        .await?;
        self.release_compute(bid_id, task.prover, market_id).await;

        state.tasks.remove(&bid_id);
        state.set_state(bid_id, BidState::InvalidInputs);

        info!(bid_id, prover = %task.prover, signer = %signer, "🧾 Invalid inputs accepted");
        self.events.emit(MarketEvent::InvalidInputsDetected {
            bid_id,
            prover: task.prover,
            signer,
        });
        self.observe(|m| {
            m.invalid_inputs.inc();
            m.open_tasks.dec();
        });
        Ok(signer)
    }

    /// Slash an overdue task. Anyone may call once the deadline has passed.
    pub async fn slash_prover(&self, bid_id: BidId, block: BlockInfo) -> Result<TokenAmount> {
        let mut state = self.state.write().await;
        let (record, task) = state.assigned(bid_id)?;
        if block.number <= task.deadline {
            return Err(MarketError::DeadlineNotReached {
                bid_id,
                deadline: task.deadline,
            });
        }
        let market_id = record.bid.market_id;
        let penalty = state.market(market_id)?.slashing_penalty;

        let seized = self
            .staking
            .on_slash(
                self.config.address,
                &SlashedTask {
                    bid_id,
                    prover: task.prover,
                    market_id,
                    reward_address: self.config.treasury,
                    amount: penalty,
                },
            )
            .await?;
        self.pay(
            self.config.address,
            record.bid.refund_address,
            task.fee_paid,
            "missed deadline refund",
        )
        .await?;
        self.release_compute(bid_id, task.prover, market_id).await;

        state.tasks.remove(&bid_id);
        state.set_state(bid_id, BidState::DeadlineCrossed);

        info!(
            bid_id,
            prover = %task.prover,
            market_id,
            seized = %seized,
            "⚔️ Prover slashed for missed deadline"
        );
        self.events.emit(MarketEvent::ProverSlashed {
            bid_id,
            prover: task.prover,
            market_id,
        });
        self.observe(|m| {
            m.provers_slashed.inc();
            m.open_tasks.dec();
        });
        Ok(seized)
    }

    // Reads

    /// Bid state as seen at `block`: unassigned bids past expiry read
    /// `Unassigned`, overdue tasks read `DeadlineCrossed`.
    pub async fn bid_state(&self, bid_id: BidId, block: BlockInfo) -> Option<BidState> {
        let state = self.state.read().await;
        let record = state.bids.get(&bid_id)?;
        let derived = match record.state {
            BidState::Created if block.number > record.bid.expiry => BidState::Unassigned,
            BidState::Assigned => match state.tasks.get(&bid_id) {
                Some(task) if block.number > task.deadline => BidState::DeadlineCrossed,
                _ => BidState::Assigned,
            },
            other => other,
        };
        Some(derived)
    }

    pub async fn bid(&self, bid_id: BidId) -> Option<Bid> {
        self.state.read().await.bids.get(&bid_id).map(|r| r.bid.clone())
    }

    pub async fn bid_acl(&self, bid_id: BidId) -> Option<Vec<u8>> {
        self.state.read().await.bids.get(&bid_id).map(|r| r.acl.clone())
    }

    pub async fn bid_secret_type(&self, bid_id: BidId) -> Option<(SecretType, TokenAmount)> {
        self.state
            .read()
            .await
            .bids
            .get(&bid_id)
            .map(|r| (r.secret_type, r.platform_fee))
    }

    pub async fn task(&self, bid_id: BidId) -> Option<TaskInfo> {
        self.state.read().await.tasks.get(&bid_id).cloned()
    }

    pub async fn market(&self, market_id: MarketId) -> Option<MarketInfo> {
        self.state.read().await.markets.get(&market_id).cloned()
    }

    pub async fn market_count(&self) -> u64 {
        self.state.read().await.markets.len() as u64
    }
}
