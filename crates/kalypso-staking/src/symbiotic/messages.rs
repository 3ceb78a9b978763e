//! Bridged submissions and their signing digests.

use kalypso_crypto::{EnclaveKeypair, Keccak, RecoverableSignature};
use kalypso_types::{Address, BidId, TokenAmount, H256};
use serde::{Deserialize, Serialize};

const SNAPSHOT_DOMAIN: &[u8] = b"VAULT_SNAPSHOT";
const SLASH_RESULT_DOMAIN: &[u8] = b"SLASH_RESULT";

/// One vault's stake delegated to a prover, as of a capture timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSnapshot {
    pub prover: Address,
    pub vault: Address,
    pub stake_token: Address,
    pub stake_amount: TokenAmount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashResult {
    pub bid_id: BidId,
    pub prover: Address,
    pub reward_address: Address,
    pub amount_to_slash: TokenAmount,
}

/// Part `idx` of a `num_of_txs`-part vault snapshot batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSubmission {
    pub idx: u32,
    pub num_of_txs: u32,
    pub capture_timestamp: u64,
    pub entries: Vec<VaultSnapshot>,
    pub signature: RecoverableSignature,
}

impl SnapshotSubmission {
    pub fn digest_for(idx: u32, num_of_txs: u32, capture_timestamp: u64, entries: &[VaultSnapshot]) -> H256 {
        let mut hasher = Keccak::new();
        hasher
            .update(SNAPSHOT_DOMAIN)
            .update_u32(idx)
            .update_u32(num_of_txs)
            .update_u64(capture_timestamp)
            .update_u32(entries.len() as u32);
        for entry in entries {
            hasher
                .update(entry.prover.as_bytes())
                .update(entry.vault.as_bytes())
                .update(entry.stake_token.as_bytes())
                .update_u128(entry.stake_amount.to_base_units());
        }
        hasher.finalize()
    }

    pub fn digest(&self) -> H256 {
        Self::digest_for(self.idx, self.num_of_txs, self.capture_timestamp, &self.entries)
    }

    /// Build and sign a part with a bridge enclave key.
    pub fn signed(
        signer: &EnclaveKeypair,
        idx: u32,
        num_of_txs: u32,
        capture_timestamp: u64,
        entries: Vec<VaultSnapshot>,
    ) -> kalypso_crypto::Result<Self> {
        let digest = Self::digest_for(idx, num_of_txs, capture_timestamp, &entries);
        Ok(Self {
            idx,
            num_of_txs,
            capture_timestamp,
            entries,
            signature: signer.sign_digest(&digest)?,
        })
    }
}

/// Part `idx` of a slash result batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashResultSubmission {
    pub idx: u32,
    pub num_of_txs: u32,
    pub capture_timestamp: u64,
    pub last_block_number: u64,
    pub entries: Vec<SlashResult>,
    pub signature: RecoverableSignature,
}

impl SlashResultSubmission {
    pub fn digest_for(
        idx: u32,
        num_of_txs: u32,
        capture_timestamp: u64,
        last_block_number: u64,
        entries: &[SlashResult],
    ) -> H256 {
        let mut hasher = Keccak::new();
        hasher
            .update(SLASH_RESULT_DOMAIN)
            .update_u32(idx)
            .update_u32(num_of_txs)
            .update_u64(capture_timestamp)
            .update_u64(last_block_number)
            .update_u32(entries.len() as u32);
        for entry in entries {
            hasher
                .update_u64(entry.bid_id)
                .update(entry.prover.as_bytes())
                .update(entry.reward_address.as_bytes())
                .update_u128(entry.amount_to_slash.to_base_units());
        }
        hasher.finalize()
    }

    pub fn digest(&self) -> H256 {
        Self::digest_for(
            self.idx,
            self.num_of_txs,
            self.capture_timestamp,
            self.last_block_number,
            &self.entries,
        )
    }

    pub fn signed(
        signer: &EnclaveKeypair,
        idx: u32,
        num_of_txs: u32,
        capture_timestamp: u64,
        last_block_number: u64,
        entries: Vec<SlashResult>,
    ) -> kalypso_crypto::Result<Self> {
        let digest =
            Self::digest_for(idx, num_of_txs, capture_timestamp, last_block_number, &entries);
        Ok(Self {
            idx,
            num_of_txs,
            capture_timestamp,
            last_block_number,
            entries,
            signature: signer.sign_digest(&digest)?,
        })
    }
}

/// A fully reconciled snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedTimestamp {
    pub capture_timestamp: u64,
    pub block_number: u64,
    pub transmitter: Address,
    pub transmitter_commission_rate: u128,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kalypso_crypto::recover_signer;

    fn entry(amount: u128) -> VaultSnapshot {
        VaultSnapshot {
            prover: Address::repeat_byte(1),
            vault: Address::repeat_byte(2),
            stake_token: Address::repeat_byte(3),
            stake_amount: TokenAmount::from_base_units(amount),
        }
    }

    #[test]
    fn test_digest_binds_header_and_entries() {
        let base = SnapshotSubmission::digest_for(0, 2, 100, &[entry(5)]);
        assert_ne!(base, SnapshotSubmission::digest_for(1, 2, 100, &[entry(5)]));
        assert_ne!(base, SnapshotSubmission::digest_for(0, 3, 100, &[entry(5)]));
        assert_ne!(base, SnapshotSubmission::digest_for(0, 2, 101, &[entry(5)]));
        assert_ne!(base, SnapshotSubmission::digest_for(0, 2, 100, &[entry(6)]));
    }

    #[test]
    fn test_signed_part_recovers_signer() {
        let kp = EnclaveKeypair::generate();
        let part = SnapshotSubmission::signed(&kp, 0, 1, 50, vec![entry(1)]).unwrap();
        assert_eq!(recover_signer(&part.digest(), &part.signature).unwrap(), kp.address());

        let slash = SlashResultSubmission::signed(&kp, 0, 1, 50, 9, vec![]).unwrap();
        assert_eq!(recover_signer(&slash.digest(), &slash.signature).unwrap(), kp.address());
    }
}
