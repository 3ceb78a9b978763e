//! Event stream for external indexers.
//!
//! Every committed transition emits one [`MarketEvent`]. Emission never fails
//! the transition; with no subscribers the event is dropped.

use crate::address::Address;
use crate::amount::TokenAmount;
use crate::{BidId, FamilyId, ImageId, MarketId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MarketEvent {
    ImageWhitelisted {
        image_id: ImageId,
    },
    ImageRevoked {
        image_id: ImageId,
    },
    ImageAddedToFamily {
        image_id: ImageId,
        family_id: FamilyId,
    },
    ImageRemovedFromFamily {
        image_id: ImageId,
        family_id: FamilyId,
    },
    EnclaveKeyVerified {
        enclave: Address,
        image_id: ImageId,
    },
    EnclaveKeyRevoked {
        enclave: Address,
    },
    KeyUpdated {
        owner: Address,
        slot: u64,
        enclave: Address,
    },
    KeyRemoved {
        owner: Address,
        slot: u64,
    },
    MarketCreated {
        market_id: MarketId,
        creator: Address,
        prover_image: ImageId,
        ivs_image: ImageId,
    },
    BidCreated {
        bid_id: BidId,
        market_id: MarketId,
        requester: Address,
        reward: TokenAmount,
        platform_fee: TokenAmount,
    },
    BidCancelled {
        bid_id: BidId,
        refund: TokenAmount,
    },
    TaskAssigned {
        bid_id: BidId,
        market_id: MarketId,
        prover: Address,
        fee_paid: TokenAmount,
        deadline: u64,
    },
    ProofAccepted {
        bid_id: BidId,
        prover: Address,
        payout: TokenAmount,
    },
    InvalidInputsDetected {
        bid_id: BidId,
        prover: Address,
        signer: Address,
    },
    ProverSlashed {
        bid_id: BidId,
        prover: Address,
        market_id: MarketId,
    },
    ProverRegistered {
        prover: Address,
        declared_compute: u128,
    },
    ProverDeregistered {
        prover: Address,
    },
    ProverJoinedMarket {
        prover: Address,
        market_id: MarketId,
        compute_per_request: u128,
    },
    ProverLeftMarket {
        prover: Address,
        market_id: MarketId,
    },
    ComputeChanged {
        prover: Address,
        declared_compute: u128,
        intended_utilization: u128,
    },
    Staked {
        pool: String,
        prover: Address,
        token: Address,
        amount: TokenAmount,
    },
    StakeLocked {
        pool: String,
        bid_id: BidId,
        prover: Address,
        amount: TokenAmount,
    },
    StakeUnlocked {
        pool: String,
        bid_id: BidId,
        prover: Address,
    },
    StakeSlashed {
        pool: String,
        bid_id: BidId,
        prover: Address,
        recipient: Address,
        amount: TokenAmount,
    },
    WithdrawalRequested {
        prover: Address,
        token: Address,
        amount: TokenAmount,
        claimable_at: u64,
    },
    WithdrawalClaimed {
        prover: Address,
        token: Address,
        amount: TokenAmount,
    },
    SnapshotPartAccepted {
        kind: String,
        capture_timestamp: u64,
        idx: u32,
        num_of_txs: u32,
        transmitter: Address,
    },
    SnapshotConfirmed {
        capture_timestamp: u64,
        block_number: u64,
        transmitter: Address,
        commission_rate: u128,
    },
    SlashBatchConfirmed {
        capture_timestamp: u64,
        transmitter: Address,
        slashed: u32,
    },
    BatchAbandoned {
        kind: String,
        capture_timestamp: u64,
        superseded_by: u64,
    },
    RewardsClaimed {
        pool: String,
        account: Address,
        amount: TokenAmount,
    },
}

impl MarketEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MarketEvent::ImageWhitelisted { .. } => "ImageWhitelisted",
            MarketEvent::ImageRevoked { .. } => "ImageRevoked",
            MarketEvent::ImageAddedToFamily { .. } => "ImageAddedToFamily",
            MarketEvent::ImageRemovedFromFamily { .. } => "ImageRemovedFromFamily",
            MarketEvent::EnclaveKeyVerified { .. } => "EnclaveKeyVerified",
            MarketEvent::EnclaveKeyRevoked { .. } => "EnclaveKeyRevoked",
            MarketEvent::KeyUpdated { .. } => "KeyUpdated",
            MarketEvent::KeyRemoved { .. } => "KeyRemoved",
            MarketEvent::MarketCreated { .. } => "MarketCreated",
            MarketEvent::BidCreated { .. } => "BidCreated",
            MarketEvent::BidCancelled { .. } => "BidCancelled",
            MarketEvent::TaskAssigned { .. } => "TaskAssigned",
            MarketEvent::ProofAccepted { .. } => "ProofAccepted",
            MarketEvent::InvalidInputsDetected { .. } => "InvalidInputsDetected",
            MarketEvent::ProverSlashed { .. } => "ProverSlashed",
            MarketEvent::ProverRegistered { .. } => "ProverRegistered",
            MarketEvent::ProverDeregistered { .. } => "ProverDeregistered",
            MarketEvent::ProverJoinedMarket { .. } => "ProverJoinedMarket",
            MarketEvent::ProverLeftMarket { .. } => "ProverLeftMarket",
            MarketEvent::ComputeChanged { .. } => "ComputeChanged",
            MarketEvent::Staked { .. } => "Staked",
            MarketEvent::StakeLocked { .. } => "StakeLocked",
            MarketEvent::StakeUnlocked { .. } => "StakeUnlocked",
            MarketEvent::StakeSlashed { .. } => "StakeSlashed",
            MarketEvent::WithdrawalRequested { .. } => "WithdrawalRequested",
            MarketEvent::WithdrawalClaimed { .. } => "WithdrawalClaimed",
            MarketEvent::SnapshotPartAccepted { .. } => "SnapshotPartAccepted",
            MarketEvent::SnapshotConfirmed { .. } => "SnapshotConfirmed",
            MarketEvent::SlashBatchConfirmed { .. } => "SlashBatchConfirmed",
            MarketEvent::BatchAbandoned { .. } => "BatchAbandoned",
            MarketEvent::RewardsClaimed { .. } => "RewardsClaimed",
        }
    }
}

pub struct EventBus {
    sender: broadcast::Sender<MarketEvent>,
    emitted: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            sender,
            emitted: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: MarketEvent) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => debug!(event = name, receivers, "📦 Event emitted"),
            Err(_) => debug!(event = name, "📦 Event emitted with no subscribers"),
        }
    }

    pub fn emitted_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

/// Collect whatever is currently buffered on a receiver.
#[cfg(any(test, feature = "test-utils"))]
pub fn drain(receiver: &mut broadcast::Receiver<MarketEvent>) -> Vec<MarketEvent> {
    let mut out = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        out.push(event);
    }
    out
}
