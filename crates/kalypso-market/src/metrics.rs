use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Counters for the marketplace state machine.
#[derive(Clone)]
pub struct MarketMetrics {
    registry: Arc<Registry>,
    pub bids_created: IntCounter,
    pub tasks_assigned: IntCounter,
    pub proofs_accepted: IntCounter,
    pub proofs_rejected: IntCounter,
    pub invalid_inputs: IntCounter,
    pub provers_slashed: IntCounter,
    pub assignment_failures: IntCounter,
    pub open_tasks: IntGauge,
}

impl MarketMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    pub fn with_registry(registry: Arc<Registry>) -> prometheus::Result<Self> {
        let bids_created = IntCounter::new("kalypso_bids_created_total", "Total bids created")?;
        let tasks_assigned =
            IntCounter::new("kalypso_tasks_assigned_total", "Total bids assigned to a prover")?;
        let proofs_accepted =
            IntCounter::new("kalypso_proofs_accepted_total", "Total proofs accepted")?;
        let proofs_rejected = IntCounter::new(
            "kalypso_proofs_rejected_total",
            "Total proofs rejected by the market verifier",
        )?;
        let invalid_inputs = IntCounter::new(
            "kalypso_invalid_inputs_total",
            "Total tasks closed by an invalid inputs attestation",
        )?;
        let provers_slashed =
            IntCounter::new("kalypso_provers_slashed_total", "Total tasks slashed past deadline")?;
        let assignment_failures = IntCounter::new(
            "kalypso_assignment_failures_total",
            "Total assignments rolled back",
        )?;
        let open_tasks = IntGauge::new("kalypso_open_tasks", "Tasks assigned and not yet settled")?;

        registry.register(Box::new(bids_created.clone()))?;
        registry.register(Box::new(tasks_assigned.clone()))?;
        registry.register(Box::new(proofs_accepted.clone()))?;
        registry.register(Box::new(proofs_rejected.clone()))?;
        registry.register(Box::new(invalid_inputs.clone()))?;
        registry.register(Box::new(provers_slashed.clone()))?;
        registry.register(Box::new(assignment_failures.clone()))?;
        registry.register(Box::new(open_tasks.clone()))?;

        Ok(Self {
            registry,
            bids_created,
            tasks_assigned,
            proofs_accepted,
            proofs_rejected,
            invalid_inputs,
            provers_slashed,
            assignment_failures,
            open_tasks,
        })
    }

    /// Prometheus text exposition of every registered metric.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}
