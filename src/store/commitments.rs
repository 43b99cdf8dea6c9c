use std::collections::HashMap;

use thiserror::Error;
use votecommit::{Commitment, Digest256, ReceiptCode};

use crate::model::record::{AnchorState, CommitmentRecord, LedgerReceipt};
use crate::store::partition::Partitioned;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("Commitment {0} is already recorded")]
    Duplicate(Digest256),
    #[error("Commitment {0} is not recorded")]
    Unknown(Digest256),
    #[error("Commitment cannot move from {from:?} to {to:?}")]
    IllegalTransition { from: AnchorState, to: AnchorState },
}

#[derive(Default)]
struct ElectionCommitments {
    records: HashMap<Digest256, CommitmentRecord>,
    by_code: HashMap<ReceiptCode, Digest256>,
}

/// The commitment-existence index: every accepted commitment and its
/// anchoring progress, partitioned by election.
#[derive(Default)]
pub struct CommitmentIndex {
    partitions: Partitioned<ElectionCommitments>,
}

impl CommitmentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly built commitment. Commitments are write-once.
    pub fn insert_pending(&self, commitment: &Commitment) -> Result<CommitmentRecord, IndexError> {
        self.partitions.with(&commitment.election_id, |partition| {
            if partition.records.contains_key(&commitment.commitment_hash) {
                return Err(IndexError::Duplicate(commitment.commitment_hash));
            }
            let record = CommitmentRecord::pending(commitment);
            partition
                .by_code
                .entry(record.receipt_code.clone())
                .or_insert(record.commitment_hash);
            partition
                .records
                .insert(record.commitment_hash, record.clone());
            Ok(record)
        })
    }

    /// The current record for `commitment`, recording it first if unseen.
    pub fn ensure_tracked(&self, commitment: &Commitment) -> CommitmentRecord {
        self.partitions.with(&commitment.election_id, |partition| {
            if let Some(record) = partition.records.get(&commitment.commitment_hash) {
                return record.clone();
            }
            let record = CommitmentRecord::pending(commitment);
            partition
                .by_code
                .entry(record.receipt_code.clone())
                .or_insert(record.commitment_hash);
            partition
                .records
                .insert(record.commitment_hash, record.clone());
            record
        })
    }

    /// Forget a commitment that was never handed to the relay.
    pub fn remove_pending(&self, election_id: &str, hash: &Digest256) {
        self.partitions.with(election_id, |partition| {
            if let Some(record) = partition.records.get(hash) {
                if record.state == AnchorState::Pending && record.attempts == 0 {
                    if partition.by_code.get(&record.receipt_code) == Some(hash) {
                        partition.by_code.remove(&record.receipt_code);
                    }
                    partition.records.remove(hash);
                }
            }
        })
    }

    /// Exact-match lookup by full hash.
    pub fn get(&self, hash: &Digest256) -> Option<CommitmentRecord> {
        self.partitions
            .find_map(|partition| partition.records.get(hash).cloned())
    }

    /// Exact-match lookup by receipt code.
    pub fn by_receipt_code(&self, code: &ReceiptCode) -> Option<CommitmentRecord> {
        self.partitions.find_map(|partition| {
            partition
                .by_code
                .get(code)
                .and_then(|hash| partition.records.get(hash))
                .cloned()
        })
    }

    /// Move a commitment through the anchoring state machine. Entering
    /// `Submitted` counts as an attempt.
    pub fn transition(
        &self,
        election_id: &str,
        hash: &Digest256,
        next: AnchorState,
    ) -> Result<CommitmentRecord, IndexError> {
        self.partitions.with(election_id, |partition| {
            let record = partition
                .records
                .get_mut(hash)
                .ok_or(IndexError::Unknown(*hash))?;
            if !record.state.can_become(next) {
                return Err(IndexError::IllegalTransition {
                    from: record.state,
                    to: next,
                });
            }
            // An operator requeue starts the attempt budget afresh.
            if record.state == AnchorState::DeadLettered {
                record.attempts = 0;
            }
            if next == AnchorState::Submitted {
                record.attempts += 1;
            }
            record.state = next;
            Ok(record.clone())
        })
    }

    /// Record a successful anchor. The receipt is immutable once set.
    pub fn mark_anchored(
        &self,
        election_id: &str,
        receipt: LedgerReceipt,
    ) -> Result<CommitmentRecord, IndexError> {
        self.partitions.with(election_id, |partition| {
            let record = partition
                .records
                .get_mut(&receipt.commitment_hash)
                .ok_or(IndexError::Unknown(receipt.commitment_hash))?;
            if let Some(existing) = &record.receipt {
                return Ok(CommitmentRecord {
                    receipt: Some(existing.clone()),
                    ..record.clone()
                });
            }
            if !record.state.can_become(AnchorState::Anchored) {
                return Err(IndexError::IllegalTransition {
                    from: record.state,
                    to: AnchorState::Anchored,
                });
            }
            record.state = AnchorState::Anchored;
            record.receipt = Some(receipt);
            Ok(record.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use votecommit::{Salt, TimestampBucket, TokenId};

    use super::*;

    fn commitment(election_id: &str, salt: &str) -> Commitment {
        Commitment::derive(
            election_id,
            &TokenId::random(&mut rand::rngs::OsRng),
            &[votecommit::Selection::option("president", "alice")],
            Salt::from_bytes(salt),
            TimestampBucket::from_secs(0),
        )
    }

    fn receipt(hash: Digest256, tx: &str) -> LedgerReceipt {
        LedgerReceipt {
            commitment_hash: hash,
            fabric_tx_id: tx.to_string(),
            fabric_block_num: 1,
            anchored_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn write_once() {
        let index = CommitmentIndex::new();
        let c = commitment("E1", "s1");
        index.insert_pending(&c).unwrap();
        assert_eq!(
            index.insert_pending(&c),
            Err(IndexError::Duplicate(c.commitment_hash))
        );
    }

    #[test]
    fn exact_lookups() {
        let index = CommitmentIndex::new();
        let c = commitment("E1", "s1");
        index.insert_pending(&c).unwrap();

        let by_hash = index.get(&c.commitment_hash).unwrap();
        assert_eq!(by_hash.state, AnchorState::Pending);
        assert_eq!(by_hash.election_id, "E1");
        assert_eq!(index.by_receipt_code(&c.receipt_code()), Some(by_hash));
        assert_eq!(index.get(&Digest256::of("nothing")), None);
    }

    #[test]
    fn anchoring_lifecycle() {
        let index = CommitmentIndex::new();
        let c = commitment("E1", "s1");
        let hash = c.commitment_hash;
        index.insert_pending(&c).unwrap();

        assert!(matches!(
            index.transition("E1", &hash, AnchorState::Anchored),
            Err(IndexError::IllegalTransition { .. })
        ));

        let record = index.transition("E1", &hash, AnchorState::Submitted).unwrap();
        assert_eq!(record.attempts, 1);
        index.transition("E1", &hash, AnchorState::Failed).unwrap();
        index.transition("E1", &hash, AnchorState::Pending).unwrap();
        let record = index.transition("E1", &hash, AnchorState::Submitted).unwrap();
        assert_eq!(record.attempts, 2);

        let record = index.mark_anchored("E1", receipt(hash, "tx1")).unwrap();
        assert_eq!(record.state, AnchorState::Anchored);

        // The first receipt wins.
        let record = index.mark_anchored("E1", receipt(hash, "tx2")).unwrap();
        assert_eq!(record.receipt.unwrap().fabric_tx_id, "tx1");
    }

    #[test]
    fn requeue_resets_attempts() {
        let index = CommitmentIndex::new();
        let c = commitment("E1", "s1");
        let hash = c.commitment_hash;
        index.insert_pending(&c).unwrap();
        index.transition("E1", &hash, AnchorState::Submitted).unwrap();
        index.transition("E1", &hash, AnchorState::Failed).unwrap();
        index.transition("E1", &hash, AnchorState::DeadLettered).unwrap();
        let record = index.transition("E1", &hash, AnchorState::Pending).unwrap();
        assert_eq!(record.attempts, 0);
    }

    #[test]
    fn ensure_tracked_is_idempotent() {
        let index = CommitmentIndex::new();
        let c = commitment("E2", "s2");
        let first = index.ensure_tracked(&c);
        index
            .transition("E2", &c.commitment_hash, AnchorState::Submitted)
            .unwrap();
        let second = index.ensure_tracked(&c);
        assert_eq!(first.state, AnchorState::Pending);
        assert_eq!(second.state, AnchorState::Submitted);
    }
}
