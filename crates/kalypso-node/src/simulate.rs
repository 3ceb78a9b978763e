//! In-memory marketplace round.
//!
//! Wires every component from a [`NodeConfig`] and drives one market
//! through the paths a deployment sees: a settled proof, an invalid inputs
//! report, a missed deadline and a vault snapshot delivered in two parts.

use crate::config::{system_address, NodeConfig};
use anyhow::{Context, Result};
use kalypso_attestation::{AttestationDocument, AttestationTrust, EntityKeyRegistry, Measurements, MockAuthenticator};
use kalypso_crypto::EnclaveKeypair;
use kalypso_ledger::{MemoryStorage, TokenLedger};
use kalypso_market::{
    invalid_inputs_digest, Bid, BidState, MarketMetrics, MarketParams, MockVerifier, ProofMarketplace, ProverRegistry,
    SecretType,
};
use kalypso_staking::{
    NativeStaking, SlashResult, SlashResultSubmission, SnapshotSubmission, StakingManager, StakingPool,
    SymbioticStaking, VaultSnapshot,
};
use kalypso_types::{AccessControl, Address, BidId, BlockInfo, EventBus, MarketId, Role, TokenAmount};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

const SLASHING_PENALTY: u128 = 100;
const PROOF_COST: u128 = 50;
const BID_REWARD: u128 = 200;
const PROOF_TIME: u64 = 20;
const DECLARED_COMPUTE: u128 = 1_000;
const COMPUTE_PER_REQUEST: u128 = 100;
const NATIVE_STAKE: u128 = 10_000;
const VAULT_STAKE: u128 = 5_000;

fn amount(v: u128) -> TokenAmount {
    TokenAmount::from_base_units(v)
}

/// Accounts played by the simulation.
#[derive(Debug, Clone, Copy)]
struct Actors {
    admin: Address,
    registrar: Address,
    manager: Address,
    matcher: Address,
    transmitter: Address,
    creator: Address,
    requester: Address,
    refund: Address,
    prover: Address,
    prover_reward: Address,
    ivs_operator: Address,
}

impl Actors {
    fn new(registrar: Address) -> Self {
        Self {
            admin: system_address("admin"),
            registrar,
            manager: system_address("staking-manager"),
            matcher: system_address("matching-engine"),
            transmitter: system_address("transmitter"),
            creator: system_address("market-creator"),
            requester: system_address("requester"),
            refund: system_address("refund"),
            prover: system_address("prover"),
            prover_reward: system_address("prover-reward"),
            ivs_operator: system_address("ivs-operator"),
        }
    }
}

/// Every component, wired the way a deployment wires them.
pub struct LocalStack {
    config: NodeConfig,
    actors: Actors,
    payment_token: Address,
    stake_token: Address,
    treasury: Address,
    pub ledger: Arc<TokenLedger>,
    pub events: Arc<EventBus>,
    pub native: Arc<NativeStaking>,
    pub symbiotic: Arc<SymbioticStaking>,
    pub manager: Arc<StakingManager>,
    pub marketplace: Arc<ProofMarketplace>,
    pub metrics: Arc<MarketMetrics>,
    bridge: EnclaveKeypair,
}

impl LocalStack {
    pub async fn build(config: &NodeConfig) -> Result<Self> {
        config.validate()?;
        let payment_token = config.payment_token()?;
        let stake_token = config.stake_token()?;
        let treasury = config.treasury()?;
        let market_config = config.marketplace_config()?;
        let registry_config = config.prover_registry_config();
        let actors = Actors::new(registry_config.address);
        let admin = actors.admin;

        let access = Arc::new(AccessControl::new(admin));
        for role in [Role::Updater, Role::KeyRegister] {
            access.grant_role(admin, role, admin).await?;
        }
        for role in [Role::Marketplace, Role::KeyRegister] {
            access.grant_role(admin, role, market_config.address).await?;
        }
        access.grant_role(admin, Role::KeyRegister, actors.registrar).await?;
        access.grant_role(admin, Role::StakingManager, actors.manager).await?;
        access.grant_role(admin, Role::MatchingEngine, actors.matcher).await?;

        let events = Arc::new(EventBus::new());
        let ledger = Arc::new(TokenLedger::new(Arc::new(MemoryStorage::new())));
        let trust = Arc::new(AttestationTrust::new(
            Arc::new(MockAuthenticator),
            config.attestation.max_age_ms,
            access.clone(),
            events.clone(),
        ));
        let keys = Arc::new(EntityKeyRegistry::new(trust, access.clone(), events.clone()));

        let token_weight = config.staking.stake_token_weight as u128;
        let native = Arc::new(NativeStaking::new(
            config.native_config()?,
            access.clone(),
            ledger.clone(),
            events.clone(),
        ));
        native.set_token_weight(admin, stake_token, token_weight).await?;

        let symbiotic_config = config.symbiotic_config()?;
        let family = symbiotic_config.bridge_family;
        let symbiotic = Arc::new(SymbioticStaking::new(
            symbiotic_config,
            access.clone(),
            ledger.clone(),
            keys.clone(),
            events.clone(),
        ));
        symbiotic.set_token_weight(admin, stake_token, token_weight).await?;

        let bridge = EnclaveKeypair::generate();
        let bridge_image = keys
            .whitelist_image_using_pcrs(admin, family, Measurements::from_label("kalypso-bridge"))
            .await?;
        keys.whitelist_bridge_key(admin, family, &bridge.public_key(), bridge_image)
            .await?;

        let manager = Arc::new(StakingManager::new(
            actors.manager,
            payment_token,
            access.clone(),
            ledger.clone(),
        ));
        if config.staking.native_pool_weight > 0 {
            manager
                .add_pool(admin, native.clone(), config.staking.native_pool_weight as u128)
                .await?;
        }
        if config.staking.symbiotic_pool_weight > 0 {
            manager
                .add_pool(admin, symbiotic.clone(), config.staking.symbiotic_pool_weight as u128)
                .await?;
        }

        let provers = Arc::new(ProverRegistry::new(
            registry_config,
            access.clone(),
            keys.clone(),
            events.clone(),
        ));
        let mut marketplace = ProofMarketplace::new(
            market_config,
            access,
            ledger.clone(),
            keys.clone(),
            provers,
            manager.clone(),
            events.clone(),
        );
        let metrics = Arc::new(MarketMetrics::new()?);
        marketplace.set_metrics(metrics.clone());

        info!(node = %config.node.name, payment_token = %payment_token, stake_token = %stake_token, "🧬 Local stack wired");

        Ok(Self {
            config: config.clone(),
            actors,
            payment_token,
            stake_token,
            treasury,
            ledger,
            events,
            native,
            symbiotic,
            manager,
            marketplace: Arc::new(marketplace),
            metrics,
            bridge,
        })
    }

    fn block(&self, number: u64) -> BlockInfo {
        BlockInfo::new(
            number,
            self.config.node.genesis_timestamp + number * self.config.node.block_time_secs,
        )
    }

    fn attestation(&self, enclave: &EnclaveKeypair, measurements: Measurements, at: BlockInfo) -> AttestationDocument {
        AttestationDocument::new(enclave.public_key(), measurements, at.timestamp * 1_000)
    }

    async fn usdc(&self, account: Address) -> Result<TokenAmount> {
        Ok(self.ledger.balance_of(self.payment_token, account).await?)
    }

    async fn fund(&self) -> Result<()> {
        let creation_cost = self.config.marketplace.market_creation_cost as u128;
        self.ledger
            .mint(self.payment_token, self.actors.creator, amount(creation_cost))
            .await?;
        self.ledger
            .mint(self.payment_token, self.actors.requester, amount(100_000))
            .await?;
        self.ledger
            .mint(self.stake_token, self.actors.prover, amount(NATIVE_STAKE))
            .await?;
        Ok(())
    }

    async fn create_market(&self, at: BlockInfo) -> Result<MarketId> {
        let market_id = self
            .marketplace
            .create_marketplace(
                self.actors.creator,
                MarketParams {
                    verifier: Arc::new(MockVerifier::accepting()),
                    prover_image: Measurements::from_label("kalypso-prover"),
                    ivs_image: Measurements::from_label("kalypso-ivs"),
                    slashing_penalty: amount(SLASHING_PENALTY),
                    metadata: format!("{} local market", self.config.node.name).into_bytes(),
                },
            )
            .await
            .context("market creation failed")?;
        debug!(market_id, block = at.number, "Market ready");
        Ok(market_id)
    }

    async fn onboard_prover(&self, market_id: MarketId, at: BlockInfo) -> Result<EnclaveKeypair> {
        let provers = self.marketplace.prover_registry();
        provers
            .register(
                self.actors.prover,
                self.actors.prover_reward,
                DECLARED_COMPUTE,
                b"local prover".to_vec(),
            )
            .await?;
        self.native
            .stake(self.actors.prover, self.actors.prover, self.stake_token, amount(NATIVE_STAKE))
            .await?;

        let enclave = EnclaveKeypair::generate();
        let doc = self.attestation(&enclave, Measurements::from_label("kalypso-prover"), at);
        self.marketplace
            .join_marketplace(
                self.actors.prover,
                market_id,
                COMPUTE_PER_REQUEST,
                amount(PROOF_COST),
                &enclave.public_key(),
                &doc,
                at,
            )
            .await
            .context("prover failed to join the market")?;
        Ok(enclave)
    }

    async fn register_ivs(&self, market_id: MarketId, at: BlockInfo) -> Result<EnclaveKeypair> {
        let enclave = EnclaveKeypair::generate();
        let doc = self.attestation(&enclave, Measurements::from_label("kalypso-ivs"), at);
        self.marketplace
            .register_ivs_key(self.actors.ivs_operator, market_id, &enclave.public_key(), &doc, at)
            .await?;
        Ok(enclave)
    }

    /// Two-part vault snapshot, delivered last part first.
    async fn deliver_snapshot(&self, at: BlockInfo) -> Result<u64> {
        let capture_timestamp = at.timestamp;
        let vault = |label: &str| VaultSnapshot {
            prover: self.actors.prover,
            vault: system_address(label),
            stake_token: self.stake_token,
            stake_amount: amount(VAULT_STAKE / 2),
        };
        let parts = [
            SnapshotSubmission::signed(&self.bridge, 1, 2, capture_timestamp, vec![vault("vault-b")])?,
            SnapshotSubmission::signed(&self.bridge, 0, 2, capture_timestamp, vec![vault("vault-a")])?,
        ];
        for part in &parts {
            let status = self
                .symbiotic
                .submit_vault_snapshot(self.actors.transmitter, part, at)
                .await?;
            debug!(idx = part.idx, status = ?status, "Snapshot part delivered");
        }
        Ok(capture_timestamp)
    }

    async fn open_bid(&self, market_id: MarketId, at: BlockInfo) -> Result<BidId> {
        let bid = Bid {
            market_id,
            reward: amount(BID_REWARD),
            expiry: at.number + 50,
            time_for_proof_generation: PROOF_TIME,
            deadline: at.number + 200,
            refund_address: self.actors.refund,
            prover_data: format!("inputs@{}", at.number).into_bytes(),
        };
        let bid_id = self
            .marketplace
            .create_bid(self.actors.requester, bid, SecretType::Public, &[], &[], at)
            .await?;
        self.marketplace
            .assign_task(
                self.actors.matcher,
                bid_id,
                self.actors.prover,
                Vec::new(),
                self.block(at.number + 1),
            )
            .await?;
        Ok(bid_id)
    }

    async fn vault_share(&self, bid_id: BidId) -> Option<TokenAmount> {
        self.manager
            .locked_pools(bid_id)
            .await
            .into_iter()
            .find(|(pool, _)| pool == self.symbiotic.name())
            .map(|(_, share)| share)
    }

    async fn report_vault_slash(&self, bid_id: BidId, share: TokenAmount, at: BlockInfo) -> Result<()> {
        let part = SlashResultSubmission::signed(
            &self.bridge,
            0,
            1,
            at.timestamp,
            at.number,
            vec![SlashResult {
                bid_id,
                prover: self.actors.prover,
                reward_address: self.treasury,
                amount_to_slash: share,
            }],
        )?;
        self.symbiotic
            .submit_slash_result(self.actors.transmitter, &part, at)
            .await?;
        Ok(())
    }

    /// Drive one full round and collect what happened.
    pub async fn run_round(&self) -> Result<SimulationSummary> {
        let mut events = self.events.subscribe();
        self.fund().await?;

        let start = self.block(1);
        let market_id = self.create_market(start).await?;
        self.onboard_prover(market_id, start).await?;
        let ivs = self.register_ivs(market_id, start).await?;
        let capture_timestamp = self.deliver_snapshot(self.block(2)).await?;

        let settled = self.open_bid(market_id, self.block(3)).await?;
        let payout = self
            .marketplace
            .submit_proof(settled, b"local proof", self.block(5))
            .await?;

        let flagged = self.open_bid(market_id, self.block(6)).await?;
        let inputs = self
            .marketplace
            .bid(flagged)
            .await
            .map(|bid| bid.prover_data)
            .unwrap_or_default();
        let signature = ivs.sign_digest(&invalid_inputs_digest(flagged, &inputs))?;
        self.marketplace
            .submit_proof_for_invalid_inputs(flagged, &signature, self.block(8))
            .await?;

        let missed = self.open_bid(market_id, self.block(9)).await?;
        let overdue = self.block(10 + PROOF_TIME + 1);
        // the vault share stays locked until the bridge reports
        let vault_share = self.vault_share(missed).await;
        let seized = self.marketplace.slash_prover(missed, overdue).await?;
        if let Some(share) = vault_share {
            self.report_vault_slash(missed, share, self.block(overdue.number + 1)).await?;
        }

        let final_block = self.block(overdue.number + 1);
        let mut bids = BTreeMap::new();
        for bid_id in [settled, flagged, missed] {
            if let Some(state) = self.marketplace.bid_state(bid_id, final_block).await {
                bids.insert(bid_id, state);
            }
        }

        let mut event_counts = BTreeMap::new();
        while let Ok(event) = events.try_recv() {
            *event_counts.entry(event.name().to_string()).or_insert(0u64) += 1;
        }

        let summary = SimulationSummary {
            market_id,
            bids,
            prover_payout: payout.to_base_units(),
            native_seized: seized.to_base_units(),
            treasury_balance: self.usdc(self.treasury).await?.to_base_units(),
            treasury_stake: self
                .ledger
                .balance_of(self.stake_token, self.treasury)
                .await?
                .to_base_units(),
            refund_balance: self.usdc(self.actors.refund).await?.to_base_units(),
            prover_reward_balance: self.usdc(self.actors.prover_reward).await?.to_base_units(),
            native_rewards: self.native.pending_rewards(&self.actors.prover).await.to_base_units(),
            symbiotic_fees: self.symbiotic.accrued_fees(&self.actors.prover).await.to_base_units(),
            available_stake: self.manager.available_stake(&self.actors.prover).await?.to_base_units(),
            confirmed_capture_timestamp: self
                .symbiotic
                .latest_confirmed()
                .await
                .map(|c| c.capture_timestamp)
                .filter(|ts| *ts == capture_timestamp),
            vault_slashes: self.symbiotic.slash_history().await.len(),
            tasks_assigned: self.metrics.tasks_assigned.get(),
            proofs_accepted: self.metrics.proofs_accepted.get(),
            invalid_inputs: self.metrics.invalid_inputs.get(),
            provers_slashed: self.metrics.provers_slashed.get(),
            event_counts,
        };
        info!(
            market_id,
            proofs_accepted = summary.proofs_accepted,
            provers_slashed = summary.provers_slashed,
            "✅ Local round complete"
        );
        Ok(summary)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub market_id: MarketId,
    pub bids: BTreeMap<BidId, BidState>,
    pub prover_payout: u128,
    pub native_seized: u128,
    pub treasury_balance: u128,
    pub treasury_stake: u128,
    pub refund_balance: u128,
    pub prover_reward_balance: u128,
    pub native_rewards: u128,
    pub symbiotic_fees: u128,
    pub available_stake: u128,
    pub confirmed_capture_timestamp: Option<u64>,
    pub vault_slashes: usize,
    pub tasks_assigned: u64,
    pub proofs_accepted: u64,
    pub invalid_inputs: u64,
    pub provers_slashed: u64,
    pub event_counts: BTreeMap<String, u64>,
}

impl fmt::Display for SimulationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "market {}", self.market_id)?;
        for (bid_id, state) in &self.bids {
            writeln!(f, "  bid {:<4} {:?}", bid_id, state)?;
        }
        writeln!(f, "payments")?;
        writeln!(f, "  prover payout        {}", self.prover_payout)?;
        writeln!(f, "  prover reward acct   {}", self.prover_reward_balance)?;
        writeln!(f, "  refunds              {}", self.refund_balance)?;
        writeln!(f, "  treasury             {}", self.treasury_balance)?;
        writeln!(f, "  treasury stake       {}", self.treasury_stake)?;
        writeln!(f, "  native seized        {}", self.native_seized)?;
        writeln!(f, "staking")?;
        writeln!(f, "  available stake      {}", self.available_stake)?;
        writeln!(f, "  native rewards       {}", self.native_rewards)?;
        writeln!(f, "  symbiotic fees       {}", self.symbiotic_fees)?;
        match self.confirmed_capture_timestamp {
            Some(ts) => writeln!(f, "  snapshot confirmed   {}", ts)?,
            None => writeln!(f, "  snapshot confirmed   no")?,
        }
        writeln!(f, "  vault slashes        {}", self.vault_slashes)?;
        writeln!(f, "metrics")?;
        writeln!(f, "  tasks assigned       {}", self.tasks_assigned)?;
        writeln!(f, "  proofs accepted      {}", self.proofs_accepted)?;
        writeln!(f, "  invalid inputs       {}", self.invalid_inputs)?;
        writeln!(f, "  provers slashed      {}", self.provers_slashed)?;
        writeln!(f, "events")?;
        for (name, count) in &self.event_counts {
            writeln!(f, "  {:<22}{}", name, count)?;
        }
        Ok(())
    }
}
