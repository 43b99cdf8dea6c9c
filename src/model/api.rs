//! Request and response bodies of the HTTP API. Requests reject unknown
//! fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use votecommit::{
    BlindToken, BlindedMessage, Commitment, Digest256, ReceiptCode, Salt, Selection,
    TimestampBucket,
};

use crate::model::record::{AnchorState, DeadLetter};
use crate::oracle::Channel;

/// Ask for a blind token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TokenRequestBody {
    pub voter_registration_id: String,
    pub channel: Channel,
    pub blinded_message: BlindedMessage,
}

/// Cast a ballot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CommitmentRequest {
    pub token: BlindToken,
    pub election_id: String,
    pub selections: Vec<Selection>,
    #[serde(default)]
    pub salt: Option<Salt>,
}

/// What the voter gets back when their ballot is accepted. The salt is
/// returned only here and never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitmentAccepted {
    pub commitment_hash: Digest256,
    pub receipt_code: ReceiptCode,
    pub salt: Salt,
    pub timestamp_bucket: TimestampBucket,
    pub status: AnchorState,
}

impl From<Commitment> for CommitmentAccepted {
    fn from(commitment: Commitment) -> Self {
        Self {
            receipt_code: commitment.receipt_code(),
            commitment_hash: commitment.commitment_hash,
            salt: commitment.salt,
            timestamp_bucket: commitment.timestamp_bucket,
            status: AnchorState::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterList {
    pub dead_letters: Vec<DeadLetterSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterSummary {
    pub commitment_hash: Digest256,
    pub election_id: String,
    pub attempts: u32,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl From<DeadLetter> for DeadLetterSummary {
    fn from(letter: DeadLetter) -> Self {
        Self {
            commitment_hash: letter.commitment_hash,
            election_id: letter.election_id,
            attempts: letter.attempts,
            last_error: letter.last_error,
            dead_lettered_at: letter.dead_lettered_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequeueResponse {
    pub commitment_hash: Digest256,
    pub status: AnchorState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditVerification {
    pub stream: String,
    pub valid: bool,
    pub entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditAnchor {
    pub stream: String,
    pub merkle_root: Digest256,
    pub entry_count: usize,
    pub fabric_tx_id: String,
    pub fabric_block_num: u64,
}
