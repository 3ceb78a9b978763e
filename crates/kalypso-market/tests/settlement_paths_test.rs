mod common;

use common::*;
use kalypso_attestation::{AttestationError, Measurements};
use kalypso_crypto::EnclaveKeypair;
use kalypso_market::{
    invalid_inputs_digest, ivs_key_slot, BidState, MarketError, MarketParams, MockVerifier,
};
use kalypso_types::{drain, ErrorKind, MarketEvent};
use std::sync::Arc;

#[tokio::test]
async fn test_valid_proof_settles_task() {
    let f = Fixture::new().await;
    f.default_prover().await;
    let mut rx = f.events.subscribe();

    let bid_id = f.create_bid(REWARD, 10).await.unwrap();
    assert_eq!(f.usdc(MARKETPLACE).await, amt(REWARD));

    let task = f.assign(bid_id, 11).await.unwrap();
    assert_eq!(task.fee_paid, amt(PROOF_COST));
    assert_eq!(task.deadline, 11 + PROOF_TIME);
    assert_eq!(f.marketplace.bid_state(bid_id, block(11)).await, Some(BidState::Assigned));
    assert_eq!(f.usdc(REFUND).await, amt(REWARD - PROOF_COST));
    assert_eq!(f.compute_consumed().await, 100);
    assert_eq!(f.available_stake().await, amt(10_000 - SLASHING_PENALTY));

    let payout = f.marketplace.submit_proof(bid_id, b"proof", block(20)).await.unwrap();
    assert_eq!(payout, amt(45));
    assert_eq!(f.verifier.calls(), 1);
    assert_eq!(f.marketplace.bid_state(bid_id, block(20)).await, Some(BidState::Completed));
    assert!(f.marketplace.task(bid_id).await.is_none());

    assert_eq!(f.usdc(PROVER_REWARD).await, amt(45));
    assert_eq!(f.usdc(NATIVE_POOL).await, amt(5));
    assert_eq!(f.native_rewards().await, amt(5));
    assert_eq!(f.usdc(MARKETPLACE).await, amt(0));

    assert_eq!(f.compute_consumed().await, 0);
    assert_eq!(f.active_requests().await, 0);
    assert_eq!(f.available_stake().await, amt(10_000));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        MarketEvent::ProofAccepted { bid_id: b, payout, .. } if *b == bid_id && *payout == amt(45)
    )));
    assert!(f.metrics.gather().contains("kalypso_proofs_accepted_total 1"));
}

#[tokio::test]
async fn test_declared_compute_bounds_assignments() {
    let f = Fixture::new().await;
    let declared: u128 = 98 * 10u128.pow(19) / 123;
    let compute_per_request: u128 = 10u128.pow(17);
    f.onboard_prover(declared, compute_per_request, 10_000).await;

    let max_asks = declared / compute_per_request;
    assert_eq!(max_asks, 79);
    for _ in 0..max_asks {
        let bid_id = f.create_bid(REWARD, 10).await.unwrap();
        f.assign(bid_id, 11).await.unwrap();
    }
    assert_eq!(f.compute_consumed().await, max_asks * compute_per_request);
    assert_eq!(f.active_requests().await, max_asks as u64);

    let bid_id = f.create_bid(REWARD, 10).await.unwrap();
    let consumed = f.compute_consumed().await;
    let stake = f.available_stake().await;
    let escrow = f.usdc(MARKETPLACE).await;

    let err = f.assign(bid_id, 11).await.unwrap_err();
    assert!(matches!(err, MarketError::InsufficientGeneratorComputeAvailable { .. }), "{err}");
    assert_eq!(err.kind(), ErrorKind::Capacity);

    assert_eq!(f.compute_consumed().await, consumed);
    assert_eq!(f.active_requests().await, max_asks as u64);
    assert_eq!(f.available_stake().await, stake);
    assert_eq!(f.usdc(MARKETPLACE).await, escrow);
    assert_eq!(f.marketplace.bid_state(bid_id, block(11)).await, Some(BidState::Created));
    assert!(f.metrics.gather().contains("kalypso_assignment_failures_total 1"));
}

#[tokio::test]
async fn test_prover_flags_invalid_inputs() {
    let f = Fixture::new().await;
    let enclave = f.default_prover().await;
    let bid_id = f.create_bid(REWARD, 10).await.unwrap();
    f.assign(bid_id, 11).await.unwrap();

    let digest = invalid_inputs_digest(bid_id, b"public inputs");
    let signature = enclave.sign_digest(&digest).unwrap();
    let signer = f
        .marketplace
        .submit_proof_for_invalid_inputs(bid_id, &signature, block(15))
        .await
        .unwrap();
    assert_eq!(signer, enclave.address());

    assert_eq!(f.marketplace.bid_state(bid_id, block(15)).await, Some(BidState::InvalidInputs));
    assert_eq!(f.usdc(REFUND).await, amt(REWARD));
    assert_eq!(f.usdc(PROVER_REWARD).await, amt(0));
    assert_eq!(f.verifier.calls(), 0);
    assert_eq!(f.compute_consumed().await, 0);
    assert_eq!(f.available_stake().await, amt(10_000));

    let err = f
        .marketplace
        .submit_proof_for_invalid_inputs(bid_id, &signature, block(16))
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::InvalidBidState { state: BidState::InvalidInputs, .. }));
}

#[tokio::test]
async fn test_ivs_flags_invalid_inputs() {
    let f = Fixture::new().await;
    f.default_prover().await;
    let ivs = f.register_ivs().await;
    let bid_id = f.create_bid(REWARD, 10).await.unwrap();
    f.assign(bid_id, 11).await.unwrap();

    let signature = ivs.sign_digest(&invalid_inputs_digest(bid_id, b"public inputs")).unwrap();
    let signer = f
        .marketplace
        .submit_proof_for_invalid_inputs(bid_id, &signature, block(15))
        .await
        .unwrap();
    assert_eq!(signer, ivs.address());
    assert_eq!(f.marketplace.bid_state(bid_id, block(15)).await, Some(BidState::InvalidInputs));
    assert_eq!(f.usdc(REFUND).await, amt(REWARD));
    assert_eq!(f.active_requests().await, 0);
}

#[tokio::test]
async fn test_unverified_enclave_cannot_flag_inputs() {
    let f = Fixture::new().await;
    f.default_prover().await;
    let bid_id = f.create_bid(REWARD, 10).await.unwrap();
    f.assign(bid_id, 11).await.unwrap();
    let digest = invalid_inputs_digest(bid_id, b"public inputs");

    let stranger = EnclaveKeypair::generate();
    let err = f
        .marketplace
        .submit_proof_for_invalid_inputs(bid_id, &stranger.sign_digest(&digest).unwrap(), block(15))
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Attestation(AttestationError::KeyNotVerified(_))));
    assert_eq!(err.kind(), ErrorKind::Authorization);

    // an IVS enclave verified for a different market's family
    let other_market = f
        .marketplace
        .create_marketplace(
            addr(CREATOR),
            MarketParams {
                verifier: Arc::new(MockVerifier::accepting()),
                prover_image: Measurements::from_label("other-prover"),
                ivs_image: Measurements::from_label("other-ivs"),
                slashing_penalty: amt(SLASHING_PENALTY),
                metadata: Vec::new(),
            },
        )
        .await
        .unwrap();
    let foreign = EnclaveKeypair::generate();
    f.marketplace
        .register_ivs_key(
            addr(IVS_OPERATOR),
            other_market,
            &foreign.public_key(),
            &attestation(&foreign, Measurements::from_label("other-ivs")),
            block(12),
        )
        .await
        .unwrap();

    let err = f
        .marketplace
        .submit_proof_for_invalid_inputs(bid_id, &foreign.sign_digest(&digest).unwrap(), block(15))
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Attestation(AttestationError::ImageNotInFamily { .. })));
    assert!(err.to_string().contains("AttestationAutherImageNotInFamily"));

    assert_eq!(f.marketplace.bid_state(bid_id, block(15)).await, Some(BidState::Assigned));
    assert_eq!(f.available_stake().await, amt(10_000 - SLASHING_PENALTY));
    assert_eq!(f.active_requests().await, 1);
}

#[tokio::test]
async fn test_rejected_proof_then_deadline_slash() {
    let f = Fixture::with_verifier(MockVerifier::rejecting()).await;
    f.default_prover().await;
    let bid_id = f.create_bid(REWARD, 10).await.unwrap();
    let task = f.assign(bid_id, 11).await.unwrap();

    let err = f.marketplace.submit_proof(bid_id, b"proof", block(20)).await.unwrap_err();
    assert!(matches!(err, MarketError::InvalidProof { .. }));
    assert_eq!(err.kind(), ErrorKind::Proof);
    assert_eq!(f.verifier.calls(), 1);
    assert_eq!(f.marketplace.bid_state(bid_id, block(20)).await, Some(BidState::Assigned));
    assert_eq!(f.usdc(PROVER_REWARD).await, amt(0));

    let overdue = block(task.deadline + 1);
    assert_eq!(f.marketplace.bid_state(bid_id, overdue).await, Some(BidState::DeadlineCrossed));
    assert!(matches!(
        f.marketplace.slash_prover(bid_id, block(task.deadline)).await,
        Err(MarketError::DeadlineNotReached { .. })
    ));

    let seized = f.marketplace.slash_prover(bid_id, overdue).await.unwrap();
    assert_eq!(seized, amt(SLASHING_PENALTY));
    assert_eq!(f.pond(TREASURY).await, amt(SLASHING_PENALTY));
    assert_eq!(f.usdc(REFUND).await, amt(REWARD));
    assert_eq!(f.available_stake().await, amt(10_000 - SLASHING_PENALTY));
    assert_eq!(f.compute_consumed().await, 0);
    assert!(matches!(
        f.marketplace.slash_prover(bid_id, overdue).await,
        Err(MarketError::InvalidBidState { state: BidState::DeadlineCrossed, .. })
    ));
    assert!(f.metrics.gather().contains("kalypso_provers_slashed_total 1"));
}

#[tokio::test]
async fn test_late_proof_is_refused_without_calling_verifier() {
    let f = Fixture::new().await;
    f.default_prover().await;
    let bid_id = f.create_bid(REWARD, 10).await.unwrap();
    let task = f.assign(bid_id, 11).await.unwrap();

    let err = f
        .marketplace
        .submit_proof(bid_id, b"proof", block(task.deadline + 1))
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::DeadlinePassed { .. }));
    assert_eq!(f.verifier.calls(), 0);
}

#[tokio::test]
async fn test_failing_verifier_counts_as_rejection() {
    let f = Fixture::with_verifier(MockVerifier::new(kalypso_market::VerifierMode::Fail)).await;
    f.default_prover().await;
    let bid_id = f.create_bid(REWARD, 10).await.unwrap();
    f.assign(bid_id, 11).await.unwrap();

    let err = f.marketplace.submit_proof(bid_id, b"proof", block(20)).await.unwrap_err();
    assert!(matches!(err, MarketError::InvalidProof { .. }));
    assert_eq!(f.active_requests().await, 1);
}

#[tokio::test]
async fn test_removed_ivs_key_cannot_flag_inputs() {
    let f = Fixture::new().await;
    f.default_prover().await;
    let ivs = f.register_ivs().await;
    let bid_id = f.create_bid(REWARD, 10).await.unwrap();
    f.assign(bid_id, 11).await.unwrap();

    f.marketplace
        .remove_ivs_key(addr(IVS_OPERATOR), f.market_id)
        .await
        .unwrap();
    assert!(f
        .keys
        .key_slot(&addr(IVS_OPERATOR), ivs_key_slot(f.market_id))
        .await
        .is_none());

    let signature = ivs.sign_digest(&invalid_inputs_digest(bid_id, b"public inputs")).unwrap();
    let err = f
        .marketplace
        .submit_proof_for_invalid_inputs(bid_id, &signature, block(15))
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Attestation(AttestationError::KeyNotVerified(_))));
    assert_eq!(f.marketplace.bid_state(bid_id, block(15)).await, Some(BidState::Assigned));
    assert_eq!(f.active_requests().await, 1);

    assert!(matches!(
        f.marketplace.remove_ivs_key(addr(IVS_OPERATOR), f.market_id).await,
        Err(MarketError::Attestation(AttestationError::KeyNotFound { .. }))
    ));
}

#[tokio::test]
async fn test_unattested_key_cannot_be_trusted_directly() {
    let f = Fixture::new().await;
    f.default_prover().await;
    let bid_id = f.create_bid(REWARD, 10).await.unwrap();
    f.assign(bid_id, 11).await.unwrap();

    let rogue = EnclaveKeypair::generate();
    let err = f
        .keys
        .trust()
        .whitelist_enclave_key(addr(PROVER), &rogue.public_key(), ivs_image().image_id())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
    assert!(f
        .keys
        .trust()
        .revoke_image(addr(PROVER), ivs_image().image_id())
        .await
        .is_err());

    let signature = rogue.sign_digest(&invalid_inputs_digest(bid_id, b"public inputs")).unwrap();
    let err = f
        .marketplace
        .submit_proof_for_invalid_inputs(bid_id, &signature, block(15))
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Attestation(AttestationError::KeyNotVerified(_))));
    assert_eq!(f.marketplace.bid_state(bid_id, block(15)).await, Some(BidState::Assigned));
}
