//! Reassembly of fragmented bridge batches.
//!
//! A batch is identified by its capture timestamp and collected part by
//! part in any arrival order. The tracker only decides whether a part's
//! header may be admitted; payload handling stays with the pool so a part
//! is either applied in full or not at all.

use crate::error::{Result, StakingError};
use kalypso_types::{Address, BlockInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchKind {
    VaultSnapshot,
    SlashResult,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::VaultSnapshot => "vault_snapshot",
            BatchKind::SlashResult => "slash_result",
        }
    }
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Idle,
    Collecting {
        capture_timestamp: u64,
        num_of_txs: u32,
        received: BTreeSet<u32>,
        transmitter: Address,
    },
    Confirmed {
        capture_timestamp: u64,
    },
}

impl BatchStatus {
    pub fn is_collecting(&self) -> bool {
        matches!(self, BatchStatus::Collecting { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PartHeader {
    pub idx: u32,
    pub num_of_txs: u32,
    pub capture_timestamp: u64,
}

/// How an admitted part relates to the batch in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// First part of a new batch.
    Start,
    /// Another part of the batch being collected.
    Continue,
    /// First part of a newer batch; the incomplete one is dropped.
    Supersede { abandoned: u64 },
}

impl Admission {
    pub fn starts_batch(&self) -> bool {
        !matches!(self, Admission::Continue)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct BatchTracker {
    kind: BatchKind,
    status: BatchStatus,
    last_confirmed: Option<u64>,
}

impl BatchTracker {
    pub fn new(kind: BatchKind) -> Self {
        Self {
            kind,
            status: BatchStatus::Idle,
            last_confirmed: None,
        }
    }

    pub fn kind(&self) -> BatchKind {
        self.kind
    }

    pub fn status(&self) -> &BatchStatus {
        &self.status
    }

    pub fn last_confirmed(&self) -> Option<u64> {
        self.last_confirmed
    }

    /// Check a part header without changing anything.
    pub fn admit(
        &self,
        header: PartHeader,
        transmitter: Address,
        block: BlockInfo,
        cooldown: u64,
    ) -> Result<Admission> {
        let PartHeader {
            idx,
            num_of_txs,
            capture_timestamp,
        } = header;
        if num_of_txs == 0 || idx >= num_of_txs {
            return Err(StakingError::InvalidPartIndex { idx, num_of_txs });
        }
        if capture_timestamp > block.timestamp {
            return Err(StakingError::FutureCaptureTimestamp {
                capture_timestamp,
                now: block.timestamp,
            });
        }
        if let Some(latest) = self.last_confirmed {
            if capture_timestamp <= latest {
                return Err(StakingError::StaleCaptureTimestamp {
                    capture_timestamp,
                    latest,
                });
            }
            let earliest = latest.saturating_add(cooldown);
            if capture_timestamp < earliest {
                return Err(StakingError::CooldownNotElapsed {
                    capture_timestamp,
                    earliest,
                });
            }
        }

        match &self.status {
            BatchStatus::Collecting {
                capture_timestamp: current,
                num_of_txs: expected,
                received,
                transmitter: owner,
            } => {
                if capture_timestamp < *current {
                    return Err(StakingError::StaleCaptureTimestamp {
                        capture_timestamp,
                        latest: *current,
                    });
                }
                if capture_timestamp > *current {
                    return Ok(Admission::Supersede { abandoned: *current });
                }
                if num_of_txs != *expected {
                    return Err(StakingError::NumOfTxsMismatch {
                        expected: *expected,
                        actual: num_of_txs,
                    });
                }
                if transmitter != *owner {
                    return Err(StakingError::TransmitterMismatch {
                        expected: *owner,
                        actual: transmitter,
                    });
                }
                if received.contains(&idx) {
                    return Err(StakingError::DuplicatePart {
                        capture_timestamp,
                        idx,
                    });
                }
                Ok(Admission::Continue)
            }
            BatchStatus::Idle | BatchStatus::Confirmed { .. } => Ok(Admission::Start),
        }
    }

    /// Whether recording `header` under `admission` completes its batch.
    pub fn completes(&self, header: PartHeader, admission: Admission) -> bool {
        let received = match (&self.status, admission) {
            (BatchStatus::Collecting { received, .. }, Admission::Continue) => received.len(),
            _ => 0,
        };
        received + 1 == header.num_of_txs as usize
    }

    /// Record an admitted part. Returns `true` once every part has arrived.
    pub fn record(&mut self, header: PartHeader, admission: Admission, transmitter: Address) -> bool {
        if admission.starts_batch() {
            self.status = BatchStatus::Collecting {
                capture_timestamp: header.capture_timestamp,
                num_of_txs: header.num_of_txs,
                received: BTreeSet::new(),
                transmitter,
            };
        }
        match &mut self.status {
            BatchStatus::Collecting {
                received,
                num_of_txs,
                ..
            } => {
                received.insert(header.idx);
                received.len() == *num_of_txs as usize
            }
            _ => false,
        }
    }

    pub fn confirm(&mut self, capture_timestamp: u64) {
        self.status = BatchStatus::Confirmed { capture_timestamp };
        self.last_confirmed = Some(capture_timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BRIDGE: Address = Address::ZERO;

    fn header(idx: u32, num_of_txs: u32, capture_timestamp: u64) -> PartHeader {
        PartHeader {
            idx,
            num_of_txs,
            capture_timestamp,
        }
    }

    fn block() -> BlockInfo {
        BlockInfo::new(100, 10_000)
    }

    fn feed(tracker: &mut BatchTracker, h: PartHeader) -> Result<bool> {
        let admission = tracker.admit(h, BRIDGE, block(), 0)?;
        let done = tracker.record(h, admission, BRIDGE);
        if done {
            tracker.confirm(h.capture_timestamp);
        }
        Ok(done)
    }

    fn permutations(n: u32) -> Vec<Vec<u32>> {
        if n == 0 {
            return vec![vec![]];
        }
        let mut out = Vec::new();
        for rest in permutations(n - 1) {
            for pos in 0..=rest.len() {
                let mut p = rest.clone();
                p.insert(pos, n - 1);
                out.push(p);
            }
        }
        out
    }

    #[test]
    fn test_every_arrival_order_completes_once() {
        for n in 1..=4 {
            for order in permutations(n) {
                let mut tracker = BatchTracker::new(BatchKind::VaultSnapshot);
                for (i, idx) in order.iter().enumerate() {
                    let done = feed(&mut tracker, header(*idx, n, 500)).unwrap();
                    assert_eq!(done, i + 1 == order.len(), "order {:?}", order);
                }
                assert_eq!(tracker.last_confirmed(), Some(500));
                for idx in 0..n {
                    assert!(matches!(
                        feed(&mut tracker, header(idx, n, 500)),
                        Err(StakingError::StaleCaptureTimestamp { .. })
                    ));
                }
            }
        }
    }

    #[test]
    fn test_duplicate_part_rejected_while_collecting() {
        let mut tracker = BatchTracker::new(BatchKind::SlashResult);
        feed(&mut tracker, header(1, 3, 500)).unwrap();
        let before = tracker.status().clone();
        assert!(matches!(
            feed(&mut tracker, header(1, 3, 500)),
            Err(StakingError::DuplicatePart { capture_timestamp: 500, idx: 1 })
        ));
        assert_eq!(tracker.status(), &before);
    }

    #[test]
    fn test_header_validation() {
        let tracker = BatchTracker::new(BatchKind::VaultSnapshot);
        assert!(matches!(
            tracker.admit(header(0, 0, 1), BRIDGE, block(), 0),
            Err(StakingError::InvalidPartIndex { .. })
        ));
        assert!(matches!(
            tracker.admit(header(3, 3, 1), BRIDGE, block(), 0),
            Err(StakingError::InvalidPartIndex { .. })
        ));
        assert!(matches!(
            tracker.admit(header(0, 1, 10_001), BRIDGE, block(), 0),
            Err(StakingError::FutureCaptureTimestamp { .. })
        ));
    }

    #[test]
    fn test_newer_batch_supersedes_and_older_is_stale() {
        let mut tracker = BatchTracker::new(BatchKind::VaultSnapshot);
        feed(&mut tracker, header(0, 2, 500)).unwrap();

        let admission = tracker.admit(header(0, 2, 600), BRIDGE, block(), 0).unwrap();
        assert_eq!(admission, Admission::Supersede { abandoned: 500 });
        tracker.record(header(0, 2, 600), admission, BRIDGE);

        assert!(matches!(
            tracker.admit(header(1, 2, 500), BRIDGE, block(), 0),
            Err(StakingError::StaleCaptureTimestamp { latest: 600, .. })
        ));
        assert!(matches!(
            tracker.admit(header(1, 3, 600), BRIDGE, block(), 0),
            Err(StakingError::NumOfTxsMismatch { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_transmitter_fixed_by_first_part() {
        let mut tracker = BatchTracker::new(BatchKind::VaultSnapshot);
        feed(&mut tracker, header(0, 2, 500)).unwrap();
        let other = Address::repeat_byte(9);
        assert!(matches!(
            tracker.admit(header(1, 2, 500), other, block(), 0),
            Err(StakingError::TransmitterMismatch { .. })
        ));
    }

    #[test]
    fn test_cooldown_after_confirmation() {
        let mut tracker = BatchTracker::new(BatchKind::VaultSnapshot);
        feed(&mut tracker, header(0, 1, 500)).unwrap();
        assert!(matches!(
            tracker.admit(header(0, 1, 599), BRIDGE, block(), 100),
            Err(StakingError::CooldownNotElapsed { earliest: 600, .. })
        ));
        assert_eq!(
            tracker.admit(header(0, 1, 600), BRIDGE, block(), 100).unwrap(),
            Admission::Start
        );
    }
}
