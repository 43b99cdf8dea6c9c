use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use votecommit::{Commitment, Digest256, ReceiptCode, TimestampBucket};

use crate::model::election::ElectionId;

/// Anchoring progress of a single commitment.
///
/// ```text
/// Pending -> Submitted -> Anchored
///               |
///               v
///            Failed -> Pending (retry)
///               |
///               v
///          DeadLettered -> Pending (operator requeue)
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorState {
    Pending,
    Submitted,
    Anchored,
    Failed,
    DeadLettered,
}

impl AnchorState {
    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_become(self, next: AnchorState) -> bool {
        use AnchorState::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Pending, DeadLettered)
                | (Submitted, Anchored)
                | (Submitted, Failed)
                | (Failed, Pending)
                | (Failed, DeadLettered)
                | (DeadLettered, Pending)
        )
    }
}

/// Proof of inclusion, created once per anchored commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerReceipt {
    pub commitment_hash: Digest256,
    pub fabric_tx_id: String,
    pub fabric_block_num: u64,
    pub anchored_at: DateTime<Utc>,
}

/// What the service remembers about a commitment. Deliberately holds no salt,
/// selections, token or voter data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentRecord {
    pub commitment_hash: Digest256,
    pub receipt_code: ReceiptCode,
    pub election_id: ElectionId,
    pub timestamp_bucket: TimestampBucket,
    pub state: AnchorState,
    pub attempts: u32,
    pub receipt: Option<LedgerReceipt>,
}

impl CommitmentRecord {
    pub fn pending(commitment: &Commitment) -> Self {
        Self {
            commitment_hash: commitment.commitment_hash,
            receipt_code: commitment.receipt_code(),
            election_id: commitment.election_id.clone(),
            timestamp_bucket: commitment.timestamp_bucket,
            state: AnchorState::Pending,
            attempts: 0,
            receipt: None,
        }
    }
}

/// A commitment that exhausted its retries, awaiting an operator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    #[serde(skip)]
    pub commitment: Commitment,
    pub commitment_hash: Digest256,
    pub election_id: ElectionId,
    pub attempts: u32,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}
