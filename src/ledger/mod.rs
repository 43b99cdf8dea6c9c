//! The append-only ledger that commitments are anchored to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use votecommit::{Digest256, TimestampBucket};

mod http;
mod memory;

pub use http::HttpLedger;
pub use memory::MemLedger;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Transient; the submission may be retried.
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
    #[error("Ledger already holds this entry")]
    Duplicate,
    #[error("Ledger rejected the transaction: {0}")]
    Rejected(String),
}

/// What gets written to the ledger. Never contains selections, salts,
/// tokens or voter data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LedgerPayload {
    #[serde(rename_all = "camelCase")]
    Commitment {
        election_id: String,
        commitment_hash: Digest256,
        timestamp_bucket: TimestampBucket,
    },
    #[serde(rename_all = "camelCase")]
    AuditRoot {
        stream: String,
        merkle_root: Digest256,
        entry_count: u64,
    },
}

impl LedgerPayload {
    /// Identity of the payload for duplicate detection. A commitment can be
    /// written once; an audit root once per distinct root.
    pub fn key(&self) -> String {
        match self {
            Self::Commitment {
                commitment_hash, ..
            } => commitment_hash.to_hex(),
            Self::AuditRoot {
                stream,
                merkle_root,
                ..
            } => format!("audit/{stream}/{merkle_root}"),
        }
    }
}

/// A ledger transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerTx {
    pub tx_id: String,
    pub block_num: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Committed,
    Pending,
    Invalid,
}

/// Submit/query access to the ledger.
#[rocket::async_trait]
pub trait Ledger: Send + Sync {
    /// Append a transaction. Fails with [`LedgerError::Duplicate`] if the
    /// payload's key is already on the ledger.
    async fn submit(&self, payload: &LedgerPayload) -> Result<LedgerTx, LedgerError>;

    /// Validation status of a written transaction.
    async fn query(&self, tx_id: &str) -> Result<Option<TxStatus>, LedgerError>;

    /// The transaction that anchored `commitment_hash`, if any.
    async fn find_commitment(
        &self,
        commitment_hash: &Digest256,
    ) -> Result<Option<LedgerTx>, LedgerError>;
}

#[cfg(test)]
mod tests {
    use rocket::serde::json::{json, to_value};

    use super::*;

    #[test]
    fn payload_wire_format() {
        let hash = Digest256::of("c");
        let payload = LedgerPayload::Commitment {
            election_id: "E1".to_string(),
            commitment_hash: hash,
            timestamp_bucket: TimestampBucket::from_secs(300),
        };
        assert_eq!(
            to_value(&payload).unwrap(),
            json!({
                "type": "commitment",
                "electionId": "E1",
                "commitmentHash": hash.to_hex(),
                "timestampBucket": 300,
            })
        );
        assert_eq!(payload.key(), hash.to_hex());
    }
}
